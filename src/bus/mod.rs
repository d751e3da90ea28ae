//! Message-bus transport layer
//!
//! The coordinator talks to an external pub/sub broker: anchor firmware
//! publishes local vectors on `<base>/anchor/<anchor_id>/vector`, and the
//! pipeline publishes solved positions on `<base>/tag/<tag_id>/position`.
//! The broker is out of scope here; everything behind the [`BusClient`]
//! trait is replaceable, with a TCP line-protocol transport for deployment
//! and a scriptable mock for tests.

pub mod client;
pub mod error;
pub mod mock;
pub mod tcp;

pub use client::{BusClient, BusSettings};
pub use error::{BusError, BusResult};
pub use mock::MockBusClient;
pub use tcp::TcpLineClient;

use crate::core::{AnchorId, TagId};

/// One message received from or destined for the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Subscription pattern matching every anchor's vector topic.
pub fn measurement_pattern(base_topic: &str) -> String {
    format!("{}/anchor/+/vector", base_topic)
}

/// Topic carrying one anchor's vector reports.
pub fn measurement_topic(base_topic: &str, anchor_id: AnchorId) -> String {
    format!("{}/anchor/{}/vector", base_topic, anchor_id)
}

/// Topic carrying solved positions for one tag.
pub fn position_topic(base_topic: &str, tag_id: TagId) -> String {
    format!("{}/tag/{}/position", base_topic, tag_id)
}

/// Extract the anchor id from a `<base>/anchor/<anchor_id>/vector` topic.
/// Returns `None` for any other topic shape.
pub fn parse_measurement_topic(base_topic: &str, topic: &str) -> Option<AnchorId> {
    let rest = topic.strip_prefix(base_topic)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    if parts.next() != Some("anchor") {
        return None;
    }
    let anchor_id = parts.next()?.parse().ok()?;
    if parts.next() != Some("vector") || parts.next().is_some() {
        return None;
    }
    Some(anchor_id)
}

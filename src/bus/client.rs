//! Bus client trait and connection settings

use super::{BusMessage, BusResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Abstraction over the pub/sub message bus.
///
/// The broker itself is an external collaborator; the pipeline only needs
/// subscribe-and-poll for anchor vectors plus best-effort publication of
/// position updates. Implementations must be `Send` so a dedicated ingest
/// thread can own or share them.
pub trait BusClient: Send {
    /// Connect and subscribe to the measurement topic pattern.
    fn connect(&mut self) -> BusResult<()>;

    /// Wait up to `timeout` for the next message.
    /// Returns `Ok(None)` when no message arrived in time.
    fn poll(&mut self, timeout: Duration) -> BusResult<Option<BusMessage>>;

    /// Publish a payload to a topic.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> BusResult<()>;

    fn is_connected(&self) -> bool;

    /// Tear the session down. Safe to call repeatedly.
    fn disconnect(&mut self);
}

/// Message-bus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Broker hostname or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Topic namespace prefix, e.g. `uwb`.
    pub base_topic: String,
    /// Socket connect timeout (milliseconds).
    pub connect_timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            base_topic: "uwb".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl BusSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

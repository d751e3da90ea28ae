//! Core data types for the localization pipeline

use nalgebra::Vector3;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a fixed UWB anchor, typically 0..=3.
pub type AnchorId = u8;

/// Identifier of a mobile tag (phone).
pub type TagId = u32;

/// Seconds since the synchronized monotonic epoch.
///
/// The wire carries integer nanoseconds (`t_unix_ns`); everything internal
/// works in float seconds.
pub type Timestamp = f64;

/// Single UWB measurement from one anchor at one instant.
///
/// `local_vector` is the vector from the anchor to the tag, expressed in the
/// anchor's sensor-local frame, in centimeters. Immutable once ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub timestamp: Timestamp,
    pub anchor_id: AnchorId,
    pub tag_id: TagId,
    pub local_vector: Vector3<f64>,
}

/// Node of the pose graph: an anchor slot or a tag slot.
///
/// A tagged sum instead of string labels keeps equality and hashing off the
/// hot path; `Display` produces the conventional `anchor_3` / `tag_0` form
/// for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Node {
    Anchor(AnchorId),
    Tag(TagId),
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Anchor(id) => write!(f, "anchor_{}", id),
            Node::Tag(id) => write!(f, "tag_{}", id),
        }
    }
}

/// Relative-position constraint between two nodes.
///
/// `vector` asserts the global-frame displacement `to − from` in centimeters.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub from: Node,
    pub to: Node,
    pub vector: Vector3<f64>,
}

impl Edge {
    pub fn new(from: Node, to: Node, vector: Vector3<f64>) -> Self {
        Self { from, to, vector }
    }
}

/// Snapshot of one tag's measurements inside a bounded time window.
///
/// Local vectors only, grouped by reporting anchor, covering
/// `[start_ts, end_ts]`. Present anchor keys always map to non-empty
/// sequences.
#[derive(Debug, Clone)]
pub struct Bin {
    pub tag_id: TagId,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub per_anchor: BTreeMap<AnchorId, Vec<Vector3<f64>>>,
}

impl Bin {
    /// Number of anchors that contributed at least one measurement.
    pub fn anchor_count(&self) -> usize {
        self.per_anchor.len()
    }

    /// Total measurements across all anchors.
    pub fn sample_count(&self) -> usize {
        self.per_anchor.values().map(Vec::len).sum()
    }

    /// Per-anchor measurement counts, in anchor-id order.
    pub fn samples_per_anchor(&self) -> BTreeMap<AnchorId, usize> {
        self.per_anchor
            .iter()
            .map(|(id, vectors)| (*id, vectors.len()))
            .collect()
    }
}

//! Pose-graph edge construction from a bin and the anchor geometry

use crate::core::{AnchorId, Bin, Edge, Node};
use crate::geometry::AnchorGeometry;
use nalgebra::Vector3;
use std::collections::BTreeMap;

/// Edges for one solve tick plus the sample multiplicity behind each
/// anchor-tag edge. The solver weighs all edges uniformly; the counts feed
/// quality metrics.
#[derive(Debug, Clone)]
pub struct EdgeSet {
    pub edges: Vec<Edge>,
    /// Measurements averaged into each anchor-tag edge.
    pub tag_edge_samples: BTreeMap<AnchorId, usize>,
}

impl EdgeSet {
    /// Number of anchor-tag edges; fewer than two leaves the tag
    /// underconstrained.
    pub fn tag_edge_count(&self) -> usize {
        self.tag_edge_samples.len()
    }
}

/// Build the edge set for one bin.
///
/// The 12 anchor-anchor edges are reused verbatim (anchor positions are
/// already global). Each anchor present in the bin contributes a single
/// edge `anchor → tag` whose vector is the anchor's rotation applied to the
/// mean of its local vectors; averaging discards temporal ordering inside
/// the window.
pub fn build_edge_set(bin: &Bin, geometry: &AnchorGeometry) -> EdgeSet {
    let mut edges = Vec::with_capacity(geometry.anchor_edges().len() + bin.anchor_count());
    edges.extend_from_slice(geometry.anchor_edges());

    let tag_node = Node::Tag(bin.tag_id);
    let mut tag_edge_samples = BTreeMap::new();

    for (&anchor_id, vectors) in &bin.per_anchor {
        // Anchors are validated at ingest; a bin cannot name geometry the
        // pipeline does not know about.
        let Some(rotation) = geometry.rotation(anchor_id) else {
            continue;
        };
        if vectors.is_empty() {
            continue;
        }

        let mean: Vector3<f64> = vectors.iter().sum::<Vector3<f64>>() / vectors.len() as f64;
        edges.push(Edge::new(Node::Anchor(anchor_id), tag_node, rotation * mean));
        tag_edge_samples.insert(anchor_id, vectors.len());
    }

    EdgeSet {
        edges,
        tag_edge_samples,
    }
}

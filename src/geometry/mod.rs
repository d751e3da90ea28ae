//! Anchor geometry: ground-truth positions, mounting rotations, and the
//! rigid anchor-to-anchor edge set
//!
//! Built once at startup from configuration and immutable afterwards, so it
//! is shared across threads without locking. All construction failures are
//! fatal; there is no runtime recovery from bad geometry.

pub mod rotations;

use crate::core::{AnchorId, Edge, Node, GAUGE_ORIGIN_ANCHOR, GAUGE_SCALE_ANCHOR};
use nalgebra::{Matrix3, Vector3};
use std::collections::BTreeMap;
use std::fmt;

pub use rotations::{rotation_y, rotation_z};

/// Errors detected while constructing anchor geometry. All are fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// An anchor id required by the pipeline is absent from configuration.
    MissingAnchor { anchor_id: AnchorId },
    /// The position/yaw/tilt maps do not cover the same anchor ids.
    MismatchedIds { details: String },
    /// No anchors configured at all.
    NoAnchors,
    /// A computed local-to-global rotation failed the orthonormality check.
    NonOrthonormalRotation { anchor_id: AnchorId },
    /// Anchor positions are collinear; the layout cannot constrain a pose.
    DegenerateLayout { details: String },
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryError::MissingAnchor { anchor_id } => {
                write!(f, "anchor {} missing from configuration", anchor_id)
            }
            GeometryError::MismatchedIds { details } => {
                write!(f, "anchor id sets disagree: {}", details)
            }
            GeometryError::NoAnchors => write!(f, "no anchors configured"),
            GeometryError::NonOrthonormalRotation { anchor_id } => {
                write!(f, "rotation for anchor {} is not orthonormal", anchor_id)
            }
            GeometryError::DegenerateLayout { details } => {
                write!(f, "degenerate anchor layout: {}", details)
            }
        }
    }
}

impl std::error::Error for GeometryError {}

/// Ground-truth anchor positions and orientations, plus the precomputed set
/// of rigid anchor-to-anchor edges.
#[derive(Debug, Clone)]
pub struct AnchorGeometry {
    positions: BTreeMap<AnchorId, Vector3<f64>>,
    rotations: BTreeMap<AnchorId, Matrix3<f64>>,
    anchor_edges: Vec<Edge>,
}

impl AnchorGeometry {
    /// Build geometry from per-anchor positions (cm) and mounting angles
    /// (degrees). Each anchor's local-to-global rotation is
    /// `Rz(yaw) · Ry(tilt)`.
    pub fn new(
        positions: BTreeMap<AnchorId, Vector3<f64>>,
        yaw_deg: &BTreeMap<AnchorId, f64>,
        tilt_deg: &BTreeMap<AnchorId, f64>,
    ) -> Result<Self, GeometryError> {
        if positions.is_empty() {
            return Err(GeometryError::NoAnchors);
        }

        let position_ids: Vec<AnchorId> = positions.keys().copied().collect();
        let yaw_ids: Vec<AnchorId> = yaw_deg.keys().copied().collect();
        let tilt_ids: Vec<AnchorId> = tilt_deg.keys().copied().collect();
        if position_ids != yaw_ids || position_ids != tilt_ids {
            return Err(GeometryError::MismatchedIds {
                details: format!(
                    "positions {:?}, yaw {:?}, tilt {:?}",
                    position_ids, yaw_ids, tilt_ids
                ),
            });
        }

        for required in [GAUGE_ORIGIN_ANCHOR, GAUGE_SCALE_ANCHOR] {
            if !positions.contains_key(&required) {
                return Err(GeometryError::MissingAnchor {
                    anchor_id: required,
                });
            }
        }

        let mut rotations = BTreeMap::new();
        for (&anchor_id, &yaw) in yaw_deg {
            let rotation = rotation_z(yaw) * rotation_y(tilt_deg[&anchor_id]);
            let deviation = (rotation.transpose() * rotation - Matrix3::identity()).norm();
            if deviation > 1e-9 || (rotation.determinant() - 1.0).abs() > 1e-9 {
                return Err(GeometryError::NonOrthonormalRotation { anchor_id });
            }
            rotations.insert(anchor_id, rotation);
        }

        check_layout_spans_plane(&positions)?;

        let anchor_edges = build_anchor_edges(&positions);

        Ok(Self {
            positions,
            rotations,
            anchor_edges,
        })
    }

    /// Ground-truth position of an anchor, if configured.
    pub fn position(&self, anchor_id: AnchorId) -> Option<&Vector3<f64>> {
        self.positions.get(&anchor_id)
    }

    /// Local-to-global rotation of an anchor, if configured.
    pub fn rotation(&self, anchor_id: AnchorId) -> Option<&Matrix3<f64>> {
        self.rotations.get(&anchor_id)
    }

    pub fn contains(&self, anchor_id: AnchorId) -> bool {
        self.positions.contains_key(&anchor_id)
    }

    /// Configured anchor ids in ascending order.
    pub fn anchor_ids(&self) -> impl Iterator<Item = AnchorId> + '_ {
        self.positions.keys().copied()
    }

    pub fn anchor_count(&self) -> usize {
        self.positions.len()
    }

    /// The full ordered anchor-to-anchor edge set: for every ordered pair
    /// `(i, j)` with `i != j`, the global vector `position[j] − position[i]`.
    pub fn anchor_edges(&self) -> &[Edge] {
        &self.anchor_edges
    }

    /// Centroid of the anchor positions; the default tag seed.
    pub fn centroid(&self) -> Vector3<f64> {
        let sum: Vector3<f64> = self.positions.values().sum();
        sum / self.positions.len() as f64
    }

    /// Diagonal of the axis-aligned bounding box spanned by the anchors.
    pub fn bounding_diagonal(&self) -> f64 {
        let mut min = Vector3::repeat(f64::INFINITY);
        let mut max = Vector3::repeat(f64::NEG_INFINITY);
        for position in self.positions.values() {
            min = min.inf(position);
            max = max.sup(position);
        }
        (max - min).norm()
    }
}

/// Pairwise position differences for every ordered anchor pair. The reverse
/// edge carries the negated vector; self-edges are excluded.
fn build_anchor_edges(positions: &BTreeMap<AnchorId, Vector3<f64>>) -> Vec<Edge> {
    let ids: Vec<AnchorId> = positions.keys().copied().collect();
    let mut edges = Vec::with_capacity(ids.len() * ids.len().saturating_sub(1));
    for (index, &i) in ids.iter().enumerate() {
        for &j in &ids[index + 1..] {
            let forward = positions[&j] - positions[&i];
            edges.push(Edge::new(Node::Anchor(i), Node::Anchor(j), forward));
            edges.push(Edge::new(Node::Anchor(j), Node::Anchor(i), -forward));
        }
    }
    edges
}

/// Collinear anchors leave the pose graph free to pivot about the line; the
/// layout must span at least a plane.
fn check_layout_spans_plane(
    positions: &BTreeMap<AnchorId, Vector3<f64>>,
) -> Result<(), GeometryError> {
    if positions.len() < 3 {
        return Err(GeometryError::DegenerateLayout {
            details: format!("{} anchors cannot span a plane", positions.len()),
        });
    }

    let centroid: Vector3<f64> =
        positions.values().sum::<Vector3<f64>>() / positions.len() as f64;
    let mut spread = nalgebra::DMatrix::zeros(positions.len(), 3);
    for (row, position) in positions.values().enumerate() {
        let offset = position - centroid;
        for column in 0..3 {
            spread[(row, column)] = offset[column];
        }
    }

    let singular_values = spread.svd(false, false).singular_values;
    let largest = singular_values[0];
    if singular_values.len() < 2 || singular_values[1] <= 1e-6 * largest.max(1.0) {
        return Err(GeometryError::DegenerateLayout {
            details: "anchor positions are collinear".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_positions() -> BTreeMap<AnchorId, Vector3<f64>> {
        let mut positions = BTreeMap::new();
        positions.insert(0, Vector3::new(480.0, 600.0, 239.0));
        positions.insert(1, Vector3::new(0.0, 600.0, 239.0));
        positions.insert(2, Vector3::new(480.0, 0.0, 239.0));
        positions.insert(3, Vector3::new(0.0, 0.0, 239.0));
        positions
    }

    fn uniform_angles(value: f64) -> BTreeMap<AnchorId, f64> {
        (0..4).map(|id| (id, value)).collect()
    }

    fn room_yaws() -> BTreeMap<AnchorId, f64> {
        // Each anchor faces the room center.
        let mut yaws = BTreeMap::new();
        yaws.insert(0, 225.0);
        yaws.insert(1, 315.0);
        yaws.insert(2, 135.0);
        yaws.insert(3, 45.0);
        yaws
    }

    fn build_square() -> AnchorGeometry {
        AnchorGeometry::new(square_positions(), &room_yaws(), &uniform_angles(45.0)).unwrap()
    }

    #[test]
    fn test_edge_set_is_complete_and_antisymmetric() {
        let geometry = build_square();
        let edges = geometry.anchor_edges();
        assert_eq!(edges.len(), 12);

        for edge in edges {
            let reverse = edges
                .iter()
                .find(|other| other.from == edge.to && other.to == edge.from)
                .expect("reverse edge present");
            assert!((edge.vector + reverse.vector).norm() < 1e-12);
            assert_ne!(edge.from, edge.to);
        }
    }

    #[test]
    fn test_edge_vectors_match_position_differences() {
        let geometry = build_square();
        for edge in geometry.anchor_edges() {
            let (Node::Anchor(i), Node::Anchor(j)) = (edge.from, edge.to) else {
                panic!("anchor edge with non-anchor node");
            };
            let expected = geometry.position(j).unwrap() - geometry.position(i).unwrap();
            assert!((edge.vector - expected).norm() < 1e-12);
        }
    }

    #[test]
    fn test_rotation_composition_matches_manual_product() {
        let geometry = build_square();
        let expected = rotation_z(45.0) * rotation_y(45.0);
        assert!((geometry.rotation(3).unwrap() - expected).norm() < 1e-12);
    }

    #[test]
    fn test_centroid_and_diagonal() {
        let geometry = build_square();
        assert!((geometry.centroid() - Vector3::new(240.0, 300.0, 239.0)).norm() < 1e-9);
        let expected = (480.0f64.powi(2) + 600.0f64.powi(2)).sqrt();
        assert!((geometry.bounding_diagonal() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_missing_gauge_anchor_is_fatal() {
        let mut positions = square_positions();
        positions.remove(&3);
        let yaws: BTreeMap<AnchorId, f64> = (0..3).map(|id| (id, 0.0)).collect();
        let tilts = yaws.clone();
        let err = AnchorGeometry::new(positions, &yaws, &tilts).unwrap_err();
        assert_eq!(err, GeometryError::MissingAnchor { anchor_id: 3 });
    }

    #[test]
    fn test_mismatched_angle_maps_are_fatal() {
        let mut yaws = room_yaws();
        yaws.remove(&2);
        let err =
            AnchorGeometry::new(square_positions(), &yaws, &uniform_angles(45.0)).unwrap_err();
        assert!(matches!(err, GeometryError::MismatchedIds { .. }));
    }

    #[test]
    fn test_collinear_layout_is_fatal() {
        let mut positions = BTreeMap::new();
        for id in 0..4u8 {
            positions.insert(id, Vector3::new(id as f64 * 100.0, 0.0, 239.0));
        }
        let err = AnchorGeometry::new(positions, &uniform_angles(0.0), &uniform_angles(0.0))
            .unwrap_err();
        assert!(matches!(err, GeometryError::DegenerateLayout { .. }));
    }

    #[test]
    fn test_coplanar_layout_is_accepted() {
        // All anchors at the same height is the nominal installation.
        assert_eq!(build_square().anchor_count(), 4);
    }
}

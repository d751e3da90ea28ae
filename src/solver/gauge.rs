//! Gauge fixing: aligning a solver output with the ground-truth frame
//!
//! The anchor-anchor edges form a rigid sub-graph the optimizer cannot
//! deform, only translate, rotate, or scale as a whole. The similarity
//! transform computed here removes exactly that freedom: anchor 3 pins the
//! translation, anchor 0 pins scale and primary direction, and every anchor
//! slot is then overwritten with its exact ground-truth position. The tag
//! inherits the same transform, so its frame matches the anchors'.

use crate::core::{Node, GAUGE_ORIGIN_ANCHOR, GAUGE_SCALE_ANCHOR};
use crate::geometry::AnchorGeometry;
use nalgebra::{Matrix3, Vector3};
use std::collections::HashMap;
use std::fmt;

/// Gauge fixing failures. Both reference anchors must be present in the
/// solver output and the geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum GaugeError {
    MissingReferenceAnchor { node: Node },
}

impl fmt::Display for GaugeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GaugeError::MissingReferenceAnchor { node } => {
                write!(f, "gauge reference {} missing from solve output", node)
            }
        }
    }
}

impl std::error::Error for GaugeError {}

/// Apply `T(x) = s · R · (x − A*₃) + A₃` to every node, then snap each
/// anchor to its ground-truth position.
pub fn apply_gauge_fix(
    positions: &mut HashMap<Node, Vector3<f64>>,
    geometry: &AnchorGeometry,
) -> Result<(), GaugeError> {
    let origin_node = Node::Anchor(GAUGE_ORIGIN_ANCHOR);
    let scale_node = Node::Anchor(GAUGE_SCALE_ANCHOR);

    let solved_origin = *positions
        .get(&origin_node)
        .ok_or(GaugeError::MissingReferenceAnchor { node: origin_node })?;
    let solved_scale = *positions
        .get(&scale_node)
        .ok_or(GaugeError::MissingReferenceAnchor { node: scale_node })?;

    let true_origin = *geometry
        .position(GAUGE_ORIGIN_ANCHOR)
        .ok_or(GaugeError::MissingReferenceAnchor { node: origin_node })?;
    let true_scale = *geometry
        .position(GAUGE_SCALE_ANCHOR)
        .ok_or(GaugeError::MissingReferenceAnchor { node: scale_node })?;

    let solved_baseline = solved_scale - solved_origin;
    let true_baseline = true_scale - true_origin;
    let solved_length = solved_baseline.norm();
    let true_length = true_baseline.norm();

    let (scale, rotation) = if solved_length > 1e-6 && true_length > 1e-6 {
        (
            true_length / solved_length,
            rotation_between(solved_baseline / solved_length, true_baseline / true_length),
        )
    } else {
        (1.0, Matrix3::identity())
    };

    for position in positions.values_mut() {
        *position = scale * (rotation * (*position - solved_origin)) + true_origin;
    }

    // Residual optimization drift at the anchor slots is discarded outright.
    for anchor_id in geometry.anchor_ids() {
        if let Some(truth) = geometry.position(anchor_id) {
            positions.insert(Node::Anchor(anchor_id), *truth);
        }
    }

    Ok(())
}

/// Minimal rotation carrying unit vector `from` onto unit vector `to`
/// (Rodrigues). Antiparallel inputs rotate half a turn about any
/// perpendicular axis.
fn rotation_between(from: Vector3<f64>, to: Vector3<f64>) -> Matrix3<f64> {
    let axis = from.cross(&to);
    let sine = axis.norm();
    let cosine = from.dot(&to);

    if sine < 1e-12 {
        if cosine > 0.0 {
            return Matrix3::identity();
        }
        let perpendicular = pick_perpendicular(&from);
        // Half-turn about the perpendicular axis: R = 2aaᵀ − I.
        return 2.0 * perpendicular * perpendicular.transpose() - Matrix3::identity();
    }

    let skew = Matrix3::new(
        0.0, -axis.z, axis.y, //
        axis.z, 0.0, -axis.x, //
        -axis.y, axis.x, 0.0,
    );
    Matrix3::identity() + skew + skew * skew * ((1.0 - cosine) / (sine * sine))
}

fn pick_perpendicular(direction: &Vector3<f64>) -> Vector3<f64> {
    let candidate = if direction.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    (candidate - direction * direction.dot(&candidate)).normalize()
}

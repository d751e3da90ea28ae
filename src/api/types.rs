//! Coordinator-facing types: position updates, quality metrics, errors

use crate::bus::BusError;
use crate::core::{TagId, Timestamp};
use crate::geometry::GeometryError;
use crate::utils::config::ConfigError;
use nalgebra::Vector3;
use serde::Serialize;
use std::fmt;

/// Quality attached to every position update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetrics {
    /// Euclidean norm of the solver's final residual vector (cm).
    pub residual_norm: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Anchor-tag edges used in the solve; fewer than two means the tag was
    /// underconstrained and consumers may discard the update.
    pub anchor_edges_used: usize,
    /// Raw measurements in the bin behind this solve.
    pub samples_in_bin: usize,
    /// Set when a later tick failed to converge and this value was carried
    /// forward.
    pub stale: bool,
}

/// The most recent solved position of one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    pub tag_id: TagId,
    /// Global-frame position (cm).
    pub position: Vector3<f64>,
    /// Time interval of the bin that produced this solve.
    pub bin_start: Timestamp,
    pub bin_end: Timestamp,
    pub quality: QualityMetrics,
}

/// Callback invoked after each successful solve.
pub type PositionCallback = Box<dyn Fn(&PositionUpdate) + Send + Sync>;

#[derive(Debug, Serialize)]
struct XyzOut {
    x: f64,
    y: f64,
    z: f64,
}

/// Outbound payload for `<base>/tag/<tag_id>/position`.
#[derive(Debug, Serialize)]
pub struct PositionNotification {
    t_unix_ns: i64,
    position_global: XyzOut,
    residual: f64,
    converged: bool,
    n_anchor_edges_used: usize,
}

impl PositionNotification {
    pub fn from_update(update: &PositionUpdate) -> Self {
        Self {
            t_unix_ns: (update.bin_end * crate::core::NANOS_PER_SEC) as i64,
            position_global: XyzOut {
                x: update.position.x,
                y: update.position.y,
                z: update.position.z,
            },
            residual: update.quality.residual_norm,
            converged: update.quality.converged,
            n_anchor_edges_used: update.quality.anchor_edges_used,
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Serialization of this payload cannot fail; fall back to an empty
        // object rather than poisoning the tick.
        serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec())
    }
}

/// Fatal pipeline initialization errors.
#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    Geometry(GeometryError),
    /// The bus was unreachable at startup.
    Bus(BusError),
    AlreadyRunning,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "configuration error: {}", e),
            PipelineError::Geometry(e) => write!(f, "geometry error: {}", e),
            PipelineError::Bus(e) => write!(f, "bus error: {}", e),
            PipelineError::AlreadyRunning => write!(f, "coordinator already running"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ConfigError> for PipelineError {
    fn from(e: ConfigError) -> Self {
        PipelineError::Config(e)
    }
}

impl From<GeometryError> for PipelineError {
    fn from(e: GeometryError) -> Self {
        PipelineError::Geometry(e)
    }
}

impl From<BusError> for PipelineError {
    fn from(e: BusError) -> Self {
        PipelineError::Bus(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payload_shape() {
        let update = PositionUpdate {
            tag_id: 0,
            position: Vector3::new(240.0, 300.0, 100.0),
            bin_start: 9.0,
            bin_end: 10.0,
            quality: QualityMetrics {
                residual_norm: 0.5,
                iterations: 3,
                converged: true,
                anchor_edges_used: 4,
                samples_in_bin: 40,
                stale: false,
            },
        };

        let payload = PositionNotification::from_update(&update).to_json();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["t_unix_ns"], 10_000_000_000i64);
        assert_eq!(value["position_global"]["x"], 240.0);
        assert_eq!(value["position_global"]["z"], 100.0);
        assert_eq!(value["converged"], true);
        assert_eq!(value["n_anchor_edges_used"], 4);
        assert_eq!(value["residual"], 0.5);
    }
}

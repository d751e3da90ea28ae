//! System configuration: loading, defaults, and validation
//!
//! Configuration is read once at startup from a JSON file and treated as
//! immutable afterwards. Validation failures are fatal before the pipeline
//! starts; nothing reconfigures at runtime.

use crate::bus::BusSettings;
use crate::core::{AnchorId, TagId};
use crate::geometry::{AnchorGeometry, GeometryError};
use crate::processing::BinnerSettings;
use crate::solver::SolverSettings;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Configuration errors surfaced at startup.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Configuration file could not be read.
    Io { message: String },
    /// Configuration file is not valid JSON of the expected shape.
    Serialization { message: String },
    /// A parameter value fails validation.
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },
    /// The anchor layout itself is unusable.
    Geometry(GeometryError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { message } => write!(f, "config I/O error: {}", message),
            ConfigError::Serialization { message } => {
                write!(f, "config parse error: {}", message)
            }
            ConfigError::InvalidParameter {
                parameter,
                value,
                reason,
            } => write!(f, "invalid {} = {}: {}", parameter, value, reason),
            ConfigError::Geometry(e) => write!(f, "anchor geometry: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<GeometryError> for ConfigError {
    fn from(e: GeometryError) -> Self {
        ConfigError::Geometry(e)
    }
}

/// Ground-truth anchor layout and mounting angles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSettings {
    /// Anchor positions in the global frame (cm).
    pub positions: BTreeMap<AnchorId, [f64; 3]>,
    /// Mounting yaw about vertical, per anchor (degrees).
    pub yaw_deg: BTreeMap<AnchorId, f64>,
    /// Downward mounting tilt, per anchor (degrees). The sign is a
    /// calibration decision; it must match how the anchors report their
    /// local vectors.
    pub tilt_deg: BTreeMap<AnchorId, f64>,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        // Corner-mounted square room, each anchor yawed to face the center
        // and tilted 45 degrees down.
        Self {
            positions: BTreeMap::from([
                (0, [440.0, 550.0, 0.0]),
                (1, [0.0, 550.0, 0.0]),
                (2, [440.0, 0.0, 0.0]),
                (3, [0.0, 0.0, 0.0]),
            ]),
            yaw_deg: BTreeMap::from([(0, 225.0), (1, 315.0), (2, 135.0), (3, 45.0)]),
            tilt_deg: (0..4).map(|id| (id, 45.0)).collect(),
        }
    }
}

impl AnchorSettings {
    /// Construct the immutable anchor geometry. All geometry errors are
    /// fatal at startup.
    pub fn build_geometry(&self) -> Result<AnchorGeometry, GeometryError> {
        let positions = self
            .positions
            .iter()
            .map(|(&id, &[x, y, z])| (id, Vector3::new(x, y, z)))
            .collect();
        AnchorGeometry::new(positions, &self.yaw_deg, &self.tilt_deg)
    }
}

/// Coordinator pacing and tag assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Solve cadence (seconds).
    pub tick_seconds: f64,
    /// Tag slot this deployment localizes. One active tag; the design
    /// admits a small fixed set.
    pub tag_id: TagId,
    /// Bus poll timeout on the ingest thread (milliseconds).
    pub poll_timeout_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tick_seconds: 1.0,
            tag_id: 0,
            poll_timeout_ms: 50,
        }
    }
}

/// Complete system configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub anchors: AnchorSettings,
    #[serde(default)]
    pub binner: BinnerSettings,
    #[serde(default)]
    pub solver: SolverSettings,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
}

impl SystemConfig {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            message: format!("{}: {}", path.as_ref().display(), e),
        })?;
        let config: SystemConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Serialization {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter range and the anchor layout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.binner.window_seconds > 0.0) {
            return Err(invalid(
                "binner.window_seconds",
                self.binner.window_seconds,
                "must be positive",
            ));
        }
        if !(self.binner.outlier_sigma > 0.0) {
            return Err(invalid(
                "binner.outlier_sigma",
                self.binner.outlier_sigma,
                "must be positive",
            ));
        }
        if self.binner.min_samples_for_outlier_check == 0 {
            return Err(invalid(
                "binner.min_samples_for_outlier_check",
                self.binner.min_samples_for_outlier_check as f64,
                "must be at least 1",
            ));
        }
        if !(self.binner.max_anchor_variance > 0.0) {
            return Err(invalid(
                "binner.max_anchor_variance",
                self.binner.max_anchor_variance,
                "must be positive",
            ));
        }
        if self.solver.iteration_cap == 0 {
            return Err(invalid(
                "solver.iteration_cap",
                self.solver.iteration_cap as f64,
                "must be at least 1",
            ));
        }
        if !(self.coordinator.tick_seconds > 0.0) {
            return Err(invalid(
                "coordinator.tick_seconds",
                self.coordinator.tick_seconds,
                "must be positive",
            ));
        }
        if self.bus.base_topic.is_empty() || self.bus.base_topic.contains('/') {
            return Err(ConfigError::InvalidParameter {
                parameter: "bus.base_topic".to_string(),
                value: self.bus.base_topic.clone(),
                reason: "must be a single non-empty topic segment".to_string(),
            });
        }

        // Surfaces layout problems before any thread starts.
        self.anchors.build_geometry()?;
        Ok(())
    }
}

fn invalid(parameter: &str, value: f64, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

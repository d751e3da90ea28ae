//! Measurement ingest: payload parsing and validation
//!
//! Converts raw bus messages into [`Measurement`]s. Every failure is local:
//! the offending message is counted and dropped, and the stream continues.

use crate::bus::parse_measurement_topic;
use crate::core::{AnchorId, Measurement, TagId, NANOS_PER_SEC};
use crate::geometry::AnchorGeometry;
use nalgebra::Vector3;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reasons a bus message never becomes a measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestError {
    /// Topic or JSON body did not match the expected shape.
    InvalidPayload { details: String },
    /// Anchor id is not part of the configured geometry.
    UnknownAnchor { anchor_id: AnchorId },
    /// Vector components are non-finite or implausibly large.
    InvalidVector { details: String },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::InvalidPayload { details } => {
                write!(f, "invalid payload: {}", details)
            }
            IngestError::UnknownAnchor { anchor_id } => {
                write!(f, "unknown anchor id {}", anchor_id)
            }
            IngestError::InvalidVector { details } => {
                write!(f, "invalid vector: {}", details)
            }
        }
    }
}

impl std::error::Error for IngestError {}

#[derive(Debug, Deserialize)]
struct VectorXyz {
    x: f64,
    y: f64,
    z: f64,
}

/// Wire payload of `<base>/anchor/<anchor_id>/vector`. Unknown fields are
/// ignored for forward compatibility.
#[derive(Debug, Deserialize)]
struct VectorPayload {
    t_unix_ns: i64,
    vector_local: VectorXyz,
}

/// Parses and validates anchor vector reports for a single tag slot.
pub struct MeasurementParser {
    base_topic: String,
    known_anchors: BTreeSet<AnchorId>,
    max_vector_norm_cm: f64,
    tag_id: TagId,
}

impl MeasurementParser {
    /// Build a parser bound to the configured geometry. The magnitude bound
    /// is twice the anchor bounding-box diagonal, floored at
    /// [`crate::core::MIN_VECTOR_BOUND_CM`].
    pub fn new(base_topic: impl Into<String>, geometry: &AnchorGeometry, tag_id: TagId) -> Self {
        let max_vector_norm_cm =
            (2.0 * geometry.bounding_diagonal()).max(crate::core::MIN_VECTOR_BOUND_CM);
        Self {
            base_topic: base_topic.into(),
            known_anchors: geometry.anchor_ids().collect(),
            max_vector_norm_cm,
            tag_id,
        }
    }

    /// Parse one bus message into a measurement.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<Measurement, IngestError> {
        let anchor_id = parse_measurement_topic(&self.base_topic, topic).ok_or_else(|| {
            IngestError::InvalidPayload {
                details: format!("unexpected topic {}", topic),
            }
        })?;

        if !self.known_anchors.contains(&anchor_id) {
            return Err(IngestError::UnknownAnchor { anchor_id });
        }

        let parsed: VectorPayload =
            serde_json::from_slice(payload).map_err(|e| IngestError::InvalidPayload {
                details: e.to_string(),
            })?;

        let local_vector = Vector3::new(
            parsed.vector_local.x,
            parsed.vector_local.y,
            parsed.vector_local.z,
        );
        self.validate_vector(&local_vector)?;

        Ok(Measurement {
            timestamp: parsed.t_unix_ns as f64 / NANOS_PER_SEC,
            anchor_id,
            tag_id: self.tag_id,
            local_vector,
        })
    }

    fn validate_vector(&self, vector: &Vector3<f64>) -> Result<(), IngestError> {
        if !vector.iter().all(|component| component.is_finite()) {
            return Err(IngestError::InvalidVector {
                details: "non-finite component".to_string(),
            });
        }
        let norm = vector.norm();
        if norm > self.max_vector_norm_cm {
            return Err(IngestError::InvalidVector {
                details: format!(
                    "magnitude {:.1} cm exceeds bound {:.1} cm",
                    norm, self.max_vector_norm_cm
                ),
            });
        }
        Ok(())
    }
}

/// Monotonic per-category drop counters, shared across threads.
#[derive(Debug, Default)]
pub struct DropCounters {
    invalid_payload: AtomicU64,
    unknown_anchor: AtomicU64,
    invalid_vector: AtomicU64,
}

/// Point-in-time copy of [`DropCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DropSnapshot {
    pub invalid_payload: u64,
    pub unknown_anchor: u64,
    pub invalid_vector: u64,
}

impl DropSnapshot {
    pub fn total(&self) -> u64 {
        self.invalid_payload + self.unknown_anchor + self.invalid_vector
    }
}

impl DropCounters {
    pub fn record(&self, error: &IngestError) {
        let counter = match error {
            IngestError::InvalidPayload { .. } => &self.invalid_payload,
            IngestError::UnknownAnchor { .. } => &self.unknown_anchor,
            IngestError::InvalidVector { .. } => &self.invalid_vector,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot {
            invalid_payload: self.invalid_payload.load(Ordering::Relaxed),
            unknown_anchor: self.unknown_anchor.load(Ordering::Relaxed),
            invalid_vector: self.invalid_vector.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::AnchorSettings;

    fn parser() -> MeasurementParser {
        let geometry = AnchorSettings::default().build_geometry().unwrap();
        MeasurementParser::new("uwb", &geometry, 0)
    }

    #[test]
    fn test_parse_valid_payload() {
        let payload = br#"{"t_unix_ns": 1500000000, "vector_local": {"x": 10.0, "y": -20.5, "z": 3.0}}"#;
        let measurement = parser().parse("uwb/anchor/2/vector", payload).unwrap();

        assert_eq!(measurement.anchor_id, 2);
        assert_eq!(measurement.tag_id, 0);
        assert!((measurement.timestamp - 1.5).abs() < 1e-12);
        assert!((measurement.local_vector - Vector3::new(10.0, -20.5, 3.0)).norm() < 1e-12);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let payload = br#"{"t_unix_ns": 0, "vector_local": {"x": 1, "y": 2, "z": 3}, "firmware": "v2", "rssi": -40}"#;
        assert!(parser().parse("uwb/anchor/0/vector", payload).is_ok());
    }

    #[test]
    fn test_unknown_anchor_is_rejected() {
        let payload = br#"{"t_unix_ns": 0, "vector_local": {"x": 1, "y": 2, "z": 3}}"#;
        let err = parser().parse("uwb/anchor/7/vector", payload).unwrap_err();
        assert_eq!(err, IngestError::UnknownAnchor { anchor_id: 7 });
    }

    #[test]
    fn test_malformed_json_is_invalid_payload() {
        let err = parser()
            .parse("uwb/anchor/1/vector", b"{not json")
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidPayload { .. }));
    }

    #[test]
    fn test_wrong_topic_is_invalid_payload() {
        let payload = br#"{"t_unix_ns": 0, "vector_local": {"x": 1, "y": 2, "z": 3}}"#;
        let err = parser().parse("uwb/tag/0/position", payload).unwrap_err();
        assert!(matches!(err, IngestError::InvalidPayload { .. }));
    }

    #[test]
    fn test_non_finite_vector_is_rejected() {
        let payload = br#"{"t_unix_ns": 0, "vector_local": {"x": 1e999, "y": 0, "z": 0}}"#;
        let err = parser().parse("uwb/anchor/0/vector", payload).unwrap_err();
        // serde_json parses 1e999 as infinity only for f64 overflow; either
        // the payload or the vector check must catch it.
        assert!(matches!(
            err,
            IngestError::InvalidVector { .. } | IngestError::InvalidPayload { .. }
        ));
    }

    #[test]
    fn test_oversized_vector_is_rejected() {
        let payload = br#"{"t_unix_ns": 0, "vector_local": {"x": 90000.0, "y": 0, "z": 0}}"#;
        let err = parser().parse("uwb/anchor/0/vector", payload).unwrap_err();
        assert!(matches!(err, IngestError::InvalidVector { .. }));
    }

    #[test]
    fn test_drop_counters_accumulate() {
        let counters = DropCounters::default();
        counters.record(&IngestError::UnknownAnchor { anchor_id: 9 });
        counters.record(&IngestError::UnknownAnchor { anchor_id: 9 });
        counters.record(&IngestError::InvalidVector {
            details: String::new(),
        });

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.unknown_anchor, 2);
        assert_eq!(snapshot.invalid_vector, 1);
        assert_eq!(snapshot.invalid_payload, 0);
        assert_eq!(snapshot.total(), 3);
    }
}

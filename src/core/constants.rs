//! Fixed parameters of the localization pipeline

use super::types::AnchorId;

/// Nanoseconds per second, for `t_unix_ns` wire timestamps.
pub const NANOS_PER_SEC: f64 = 1.0e9;

/// Reference anchor that pins the gauge translation (conventional origin).
pub const GAUGE_ORIGIN_ANCHOR: AnchorId = 3;

/// Reference anchor that pins the gauge scale and primary direction.
pub const GAUGE_SCALE_ANCHOR: AnchorId = 0;

/// Floor for the ingest vector-magnitude bound (cm). The working bound is
/// twice the anchor bounding-box diagonal, but never below this.
pub const MIN_VECTOR_BOUND_CM: f64 = 2_000.0;

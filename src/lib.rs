//! Indoor UWB localization pipeline
//!
//! Four fixed anchors report vectors to a mobile tag over a pub/sub message
//! bus. The coordinator bins those measurements in a sliding window with
//! statistical quality filtering, builds a pose graph against the known
//! anchor geometry, solves it with nonlinear least squares, gauge-fixes the
//! result onto the ground-truth frame, and exposes the latest tag position
//! at roughly 1 Hz.

pub mod api;
pub mod bus;
pub mod core;
pub mod geometry;
pub mod processing;
pub mod solver;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{AnchorId, Bin, Edge, Measurement, Node, TagId, Timestamp};
pub use api::{Coordinator, PipelineError, PositionUpdate, QualityMetrics};
pub use bus::{BusClient, BusSettings, MockBusClient, TcpLineClient};
pub use geometry::{AnchorGeometry, GeometryError};
pub use processing::{
    BinnerSettings, InsertOutcome, MeasurementParser, RejectReason, SlidingWindowBinner,
};
pub use solver::{apply_gauge_fix, solve, SolveOutcome, SolverSettings};
pub use utils::{config::SystemConfig, init_logging};

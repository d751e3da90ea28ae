//! Coordinator API: pipeline lifecycle and position exposure

pub mod coordinator;
pub mod types;

pub use coordinator::Coordinator;
pub use types::{
    PipelineError, PositionCallback, PositionNotification, PositionUpdate, QualityMetrics,
};

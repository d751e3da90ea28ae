//! Pose graph optimization and gauge fixing

pub mod gauge;
pub mod pgo;

pub use gauge::{apply_gauge_fix, GaugeError};
pub use pgo::{solve, SolveError, SolveOutcome, SolverSettings};

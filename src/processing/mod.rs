//! Measurement processing: ingest validation, binning, and edge creation

pub mod binning;
pub mod edges;
pub mod parser;

pub use binning::{
    BinnerMetrics, BinnerSettings, InsertOutcome, RejectReason, SlidingWindowBinner,
};
pub use edges::{build_edge_set, EdgeSet};
pub use parser::{DropCounters, DropSnapshot, IngestError, MeasurementParser};

//! Core types and constants for the localization pipeline

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;

//! Sliding-window binning with two-stage quality filtering
//!
//! One binner per tag. The window follows the measurement stream rather
//! than the wall clock, so late-but-recent measurements are still admitted.
//! Rejected measurements are never buffered, which is what lets a misbehaving
//! anchor heal: its bad samples leave no trace in the statistics, and its old
//! good samples age out within one window.

use crate::core::{AnchorId, Bin, Measurement, TagId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

/// Binner tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinnerSettings {
    /// Sliding window length (seconds).
    pub window_seconds: f64,
    /// Z-score threshold for the per-anchor magnitude outlier check.
    pub outlier_sigma: f64,
    /// Samples required per anchor before the outlier check activates.
    pub min_samples_for_outlier_check: usize,
    /// Cap on the per-anchor magnitude variance (cm²), checked as if the
    /// candidate were already buffered.
    pub max_anchor_variance: f64,
}

impl Default for BinnerSettings {
    fn default() -> Self {
        Self {
            window_seconds: 1.0,
            outlier_sigma: 2.0,
            min_samples_for_outlier_check: 5,
            max_anchor_variance: 10_000.0,
        }
    }
}

/// Why an insert was refused. Expected filter behavior, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    /// Timestamp fell before the current window start.
    LateDrop,
    /// Magnitude z-score against the anchor's buffered samples was too high.
    StatisticalOutlier { z_score: f64 },
    /// Admitting the sample would push the anchor's variance over the cap.
    VarianceTooHigh { variance: f64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::LateDrop => write!(f, "late drop"),
            RejectReason::StatisticalOutlier { z_score } => {
                write!(f, "statistical outlier (z = {:.2})", z_score)
            }
            RejectReason::VarianceTooHigh { variance } => {
                write!(f, "variance too high ({:.1} cm^2)", variance)
            }
        }
    }
}

/// Outcome of [`SlidingWindowBinner::insert`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InsertOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl InsertOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, InsertOutcome::Accepted)
    }
}

/// Cumulative binner counters. All counts are monotonic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinnerMetrics {
    pub accepted: u64,
    pub late_drops: u64,
    pub statistical_outliers: u64,
    pub variance_drops: u64,
    /// Accepted measurements per anchor.
    pub accepted_per_anchor: BTreeMap<AnchorId, u64>,
}

impl BinnerMetrics {
    pub fn total_rejected(&self) -> u64 {
        self.late_drops + self.statistical_outliers + self.variance_drops
    }

    /// Per-category rejections gained since an earlier snapshot.
    pub fn rejected_since(&self, earlier: &BinnerMetrics) -> (u64, u64, u64) {
        (
            self.late_drops - earlier.late_drops,
            self.statistical_outliers - earlier.statistical_outliers,
            self.variance_drops - earlier.variance_drops,
        )
    }
}

struct BinnerState {
    /// Buffered measurements, ordered by timestamp.
    buffer: Vec<Measurement>,
    metrics: BinnerMetrics,
}

/// Time-bounded measurement buffer for one tag.
///
/// `insert` runs on the ingest thread and `emit_bin` on the solver tick
/// thread; the internal mutex keeps both critical sections short.
pub struct SlidingWindowBinner {
    tag_id: TagId,
    settings: BinnerSettings,
    state: Mutex<BinnerState>,
}

impl SlidingWindowBinner {
    pub fn new(tag_id: TagId, settings: BinnerSettings) -> Self {
        Self {
            tag_id,
            settings,
            state: Mutex::new(BinnerState {
                buffer: Vec::new(),
                metrics: BinnerMetrics::default(),
            }),
        }
    }

    pub fn tag_id(&self) -> TagId {
        self.tag_id
    }

    /// Admit or reject one measurement.
    ///
    /// The window start is `max(latest_buffered_ts, m.ts) − window_seconds`.
    /// The outlier and variance checks both run against the candidate's own
    /// anchor only, and the variance check is predictive: it evaluates the
    /// buffer as if the candidate were already part of it.
    pub fn insert(&self, measurement: &Measurement) -> InsertOutcome {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let latest = state
            .buffer
            .last()
            .map_or(measurement.timestamp, |m| m.timestamp.max(measurement.timestamp));
        let window_start = latest - self.settings.window_seconds;

        if measurement.timestamp < window_start {
            state.metrics.late_drops += 1;
            return InsertOutcome::Rejected(RejectReason::LateDrop);
        }

        let magnitude = measurement.local_vector.norm();
        let anchor_magnitudes: Vec<f64> = state
            .buffer
            .iter()
            .filter(|m| m.anchor_id == measurement.anchor_id)
            .map(|m| m.local_vector.norm())
            .collect();

        if anchor_magnitudes.len() >= self.settings.min_samples_for_outlier_check {
            let (mean, std_dev) = mean_and_std(&anchor_magnitudes);
            if std_dev > 0.0 {
                let z_score = ((magnitude - mean) / std_dev).abs();
                if z_score > self.settings.outlier_sigma {
                    state.metrics.statistical_outliers += 1;
                    return InsertOutcome::Rejected(RejectReason::StatisticalOutlier { z_score });
                }
            }
        }

        let variance = variance_with(&anchor_magnitudes, magnitude);
        if variance > self.settings.max_anchor_variance {
            state.metrics.variance_drops += 1;
            return InsertOutcome::Rejected(RejectReason::VarianceTooHigh { variance });
        }

        let position = state
            .buffer
            .partition_point(|m| m.timestamp <= measurement.timestamp);
        state.buffer.insert(position, measurement.clone());
        state.metrics.accepted += 1;
        *state
            .metrics
            .accepted_per_anchor
            .entry(measurement.anchor_id)
            .or_insert(0) += 1;

        // Eviction is the only retention policy; emit_bin never clears.
        let new_latest = state.buffer.last().map(|m| m.timestamp).unwrap_or_default();
        let cutoff = new_latest - self.settings.window_seconds;
        state.buffer.retain(|m| m.timestamp >= cutoff);

        InsertOutcome::Accepted
    }

    /// Snapshot the current window as a bin, grouped by anchor. The buffer
    /// is left untouched so consecutive ticks can share measurements.
    pub fn emit_bin(&self) -> Option<Bin> {
        let state = self.state.lock().unwrap();
        if state.buffer.is_empty() {
            return None;
        }

        let mut per_anchor: BTreeMap<AnchorId, Vec<nalgebra::Vector3<f64>>> = BTreeMap::new();
        for measurement in &state.buffer {
            per_anchor
                .entry(measurement.anchor_id)
                .or_default()
                .push(measurement.local_vector);
        }

        Some(Bin {
            tag_id: self.tag_id,
            start_ts: state.buffer[0].timestamp,
            end_ts: state.buffer[state.buffer.len() - 1].timestamp,
            per_anchor,
        })
    }

    pub fn metrics(&self) -> BinnerMetrics {
        self.state.lock().unwrap().metrics.clone()
    }

    /// Timestamps currently buffered, oldest first. Test and diagnostics
    /// hook; the pipeline itself only consumes bins.
    pub fn buffered_timestamps(&self) -> Vec<Timestamp> {
        self.state
            .lock()
            .unwrap()
            .buffer
            .iter()
            .map(|m| m.timestamp)
            .collect()
    }
}

/// Population mean and standard deviation.
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Population variance of `values` with `candidate` appended.
fn variance_with(values: &[f64], candidate: f64) -> f64 {
    let n = (values.len() + 1) as f64;
    let mean = (values.iter().sum::<f64>() + candidate) / n;
    let sum_sq = values
        .iter()
        .chain(std::iter::once(&candidate))
        .map(|v| (v - mean).powi(2))
        .sum::<f64>();
    sum_sq / n
}

//! Self-calibrating memory estimation.
//!
//! Estimates start from the static per-model baseline and are refined with
//! a rolling window of observed peaks per (gpu, model). The calibrated
//! estimate is `avg + stddev × confidence`, never below the baseline, with
//! the global calibration factor applied on top. Every observation is also
//! appended to a durable JSON log with atomic replace-on-write.

mod estimator;
mod record;

pub use estimator::MemoryEstimator;
pub use record::{ModelStatistics, UsageLog, UsageRecord};

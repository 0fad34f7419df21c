//! Calibrated memory estimation per (gpu, model).

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use audioscribe_config::{base_memory_for, SystemConfig};

use crate::record::UsageLog;

#[derive(Debug, Default)]
struct CalibrationWindow {
    samples: Vec<f64>,
    avg_usage: f64,
    std_deviation: f64,
}

impl CalibrationWindow {
    fn push(&mut self, sample: f64, capacity: usize) {
        self.samples.push(sample);
        if self.samples.len() > capacity {
            let overflow = self.samples.len() - capacity;
            self.samples.drain(..overflow);
        }
        let n = self.samples.len() as f64;
        self.avg_usage = self.samples.iter().sum::<f64>() / n;
        let variance = self
            .samples
            .iter()
            .map(|s| (s - self.avg_usage).powi(2))
            .sum::<f64>()
            / n;
        self.std_deviation = variance.sqrt();
    }
}

/// Produces per-(gpu, model) memory estimates and absorbs observed usage.
///
/// The contract is "never below base": before enough samples exist the
/// baseline is returned as-is, and afterwards the calibrated value is
/// floored at the baseline so a run of unusually light tasks cannot cause
/// underestimation.
pub struct MemoryEstimator {
    confidence_factor: f64,
    calibration_factor: f64,
    window_capacity: usize,
    min_samples: usize,
    windows: Mutex<HashMap<(u32, String), CalibrationWindow>>,
    log: UsageLog,
}

impl MemoryEstimator {
    pub fn new(config: &SystemConfig) -> Self {
        let log = UsageLog::open(
            config.memory_usage_file.clone(),
            config.memory_record_retention_days,
        );
        log.prune();
        Self {
            confidence_factor: config.memory_confidence_factor,
            calibration_factor: config.memory_calibration_factor,
            window_capacity: config.calibration_sample_size,
            min_samples: config.calibration_min_samples,
            windows: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Estimated memory need in GB for running `model` on `gpu_id`.
    pub fn estimate(&self, gpu_id: u32, model: &str) -> f64 {
        let base = base_memory_for(model);
        let windows = self.windows.lock();
        let calibrated = windows
            .get(&(gpu_id, model.to_string()))
            .filter(|w| w.samples.len() >= self.min_samples)
            .map(|w| w.avg_usage + w.std_deviation * self.confidence_factor);
        drop(windows);

        let estimate = match calibrated {
            Some(value) => value.max(base),
            None => base,
        };
        let estimate = estimate * self.calibration_factor;
        debug!(gpu_id, model, estimate, "memory estimate");
        estimate
    }

    /// Feed back an observed peak. Failed runs are persisted for analysis
    /// but do not influence the calibration window.
    #[allow(clippy::too_many_arguments)]
    pub fn record_usage(
        &self,
        gpu_id: u32,
        model: &str,
        estimated: f64,
        observed: f64,
        audio_duration: Option<f64>,
        task_id: Option<&str>,
        success: bool,
    ) {
        self.log.record(
            gpu_id,
            model,
            estimated,
            observed,
            audio_duration,
            task_id,
            success,
        );
        if !success || observed <= 0.0 {
            return;
        }

        let mut windows = self.windows.lock();
        let window = windows.entry((gpu_id, model.to_string())).or_default();
        window.push(observed, self.window_capacity);
        info!(
            gpu_id,
            model,
            avg = window.avg_usage,
            std = window.std_deviation,
            samples = window.samples.len(),
            "calibrated model memory"
        );
    }

    /// Number of calibration samples held for a pair. Exposed for status
    /// surfaces and tests.
    pub fn sample_count(&self, gpu_id: u32, model: &str) -> usize {
        self.windows
            .lock()
            .get(&(gpu_id, model.to_string()))
            .map(|w| w.samples.len())
            .unwrap_or(0)
    }

    pub fn usage_log(&self) -> &UsageLog {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn estimator_in(dir: &std::path::Path) -> MemoryEstimator {
        let cfg = SystemConfig {
            memory_usage_file: dir.join("usage.json"),
            calibration_min_samples: 5,
            ..SystemConfig::default()
        };
        MemoryEstimator::new(&cfg)
    }

    fn config_with(dir: &std::path::Path, f: impl FnOnce(&mut SystemConfig)) -> SystemConfig {
        let mut cfg = SystemConfig {
            memory_usage_file: dir.join("usage.json"),
            ..SystemConfig::default()
        };
        f(&mut cfg);
        cfg
    }

    #[test]
    fn unknown_model_uses_default_baseline() {
        let dir = tempdir().unwrap();
        let est = estimator_in(dir.path());
        assert_eq!(est.estimate(0, "mystery"), 5.0);
    }

    #[test]
    fn estimate_is_base_until_enough_samples() {
        let dir = tempdir().unwrap();
        let est = estimator_in(dir.path());
        for i in 0..4 {
            est.record_usage(0, "medium", 5.0, 4.3, None, Some(&format!("t{i}")), true);
        }
        assert_eq!(est.estimate(0, "medium"), 5.0);
        est.record_usage(0, "medium", 5.0, 4.3, None, Some("t4"), true);
        assert_eq!(est.sample_count(0, "medium"), 5);
        // avg 4.3, std 0 -> calibrated 4.3, floored at base 5.0.
        assert_eq!(est.estimate(0, "medium"), 5.0);
    }

    #[test]
    fn calibration_can_raise_above_base() {
        let dir = tempdir().unwrap();
        let est = estimator_in(dir.path());
        for i in 0..10 {
            est.record_usage(0, "small", 2.0, 3.0, None, Some(&format!("t{i}")), true);
        }
        // avg 3.0 > base 2.0, std 0.
        assert!((est.estimate(0, "small") - 3.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_factor_adds_headroom() {
        let dir = tempdir().unwrap();
        let cfg = config_with(dir.path(), |c| c.memory_confidence_factor = 2.0);
        let est = MemoryEstimator::new(&cfg);
        // Alternate 4.0/6.0: avg 5.0, std 1.0 -> estimate 5 + 2*1 = 7.
        for i in 0..10 {
            let observed = if i % 2 == 0 { 4.0 } else { 6.0 };
            est.record_usage(0, "medium", 5.0, observed, None, None, true);
        }
        assert!((est.estimate(0, "medium") - 7.0).abs() < 1e-9);
    }

    #[test]
    fn failed_runs_do_not_calibrate() {
        let dir = tempdir().unwrap();
        let est = estimator_in(dir.path());
        for _ in 0..10 {
            est.record_usage(0, "small", 2.0, 9.0, None, None, false);
        }
        assert_eq!(est.sample_count(0, "small"), 0);
        assert_eq!(est.estimate(0, "small"), 2.0);
        // ...but they are kept in the durable log.
        assert_eq!(est.usage_log().len(), 10);
    }

    #[test]
    fn global_calibration_factor_scales_estimates() {
        let dir = tempdir().unwrap();
        let cfg = config_with(dir.path(), |c| c.memory_calibration_factor = 1.5);
        let est = MemoryEstimator::new(&cfg);
        assert!((est.estimate(0, "small") - 3.0).abs() < 1e-9);
    }

    #[test]
    fn calibration_is_per_gpu() {
        let dir = tempdir().unwrap();
        let est = estimator_in(dir.path());
        for _ in 0..10 {
            est.record_usage(1, "small", 2.0, 3.5, None, None, true);
        }
        assert!((est.estimate(1, "small") - 3.5).abs() < 1e-9);
        assert_eq!(est.estimate(0, "small"), 2.0);
    }
}

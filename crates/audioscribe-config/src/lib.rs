//! Environment-driven configuration for the AudioScribe core.
//!
//! Every knob is overridable through an environment variable of the same
//! name. [`SystemConfig::from_env`] reads the process environment;
//! [`SystemConfig::from_lookup`] takes any lookup closure so tests can feed
//! values without mutating process state.

mod models;

use std::path::PathBuf;
use std::time::Duration;

use audioscribe_errors::{ScribeError, ScribeResult};
use serde::Serialize;

pub use models::{base_memory_for, speed_factor_for, DEFAULT_MODEL_MEMORY_GB};

/// Runtime configuration for the scheduler, pools, queue and workers.
#[derive(Debug, Clone, Serialize)]
pub struct SystemConfig {
    /// Global cap on tasks in the processing set.
    pub max_concurrent_transcriptions: usize,
    /// Per-GPU cap on dispatched tasks.
    pub max_tasks_per_gpu: usize,
    /// Fraction of total device memory held back from every pool.
    pub memory_safety_margin: f64,
    /// Static per-GPU system reserve in GB.
    pub reserved_memory_gb: f64,
    /// Stddev multiplier in the calibrated memory estimate.
    pub memory_confidence_factor: f64,
    /// Global scalar applied to every memory estimate.
    pub memory_calibration_factor: f64,
    /// Rolling calibration window capacity per (gpu, model).
    pub calibration_sample_size: usize,
    /// Observations required before the calibrated estimate is used.
    pub calibration_min_samples: usize,
    /// Default retry budget for new tasks.
    pub max_task_retries: u32,
    /// Per-task wall-clock budget.
    pub transcription_timeout: Duration,
    /// Sleep between scheduler cycles.
    pub batch_schedule_interval: Duration,
    /// Tasks dispatched per GPU per cycle.
    pub max_batch_size: usize,
    /// Directory holding cached model weights.
    pub model_base_path: PathBuf,
    /// Base URL model files are fetched from when absent.
    pub model_download_base: String,
    /// Root of uploaded audio files.
    pub upload_folder: PathBuf,
    /// Directory transcripts are written to.
    pub output_folder: PathBuf,
    /// Persistence file for observed memory usage records.
    pub memory_usage_file: PathBuf,
    /// Records older than this many days are pruned from the usage log.
    pub memory_record_retention_days: i64,
    /// Worker executable spawned per task.
    pub worker_binary: PathBuf,
    /// Model used when a submission does not name one.
    pub default_model: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let model_base_path = dirs_next::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("audioscribe")
            .join("models");
        Self {
            max_concurrent_transcriptions: 5,
            max_tasks_per_gpu: 10,
            memory_safety_margin: 0.10,
            reserved_memory_gb: 0.0,
            memory_confidence_factor: 1.0,
            memory_calibration_factor: 1.0,
            calibration_sample_size: 50,
            calibration_min_samples: 5,
            max_task_retries: 3,
            transcription_timeout: Duration::from_secs(3600),
            batch_schedule_interval: Duration::from_secs(2),
            max_batch_size: 1,
            model_base_path,
            model_download_base:
                "https://huggingface.co/ggerganov/whisper.cpp/resolve/main".to_string(),
            upload_folder: PathBuf::from("uploads"),
            output_folder: PathBuf::from("outputs"),
            memory_usage_file: PathBuf::from("data/memory_usage.json"),
            memory_record_retention_days: 30,
            worker_binary: PathBuf::from("audioscribe-worker"),
            default_model: "small".to_string(),
        }
    }
}

impl SystemConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> ScribeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup, defaulting every
    /// missing key.
    pub fn from_lookup<F>(lookup: F) -> ScribeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = SystemConfig::default();

        cfg.max_concurrent_transcriptions =
            parse(&lookup, "MAX_CONCURRENT_TRANSCRIPTIONS", cfg.max_concurrent_transcriptions)?;
        cfg.max_tasks_per_gpu = parse(&lookup, "MAX_TASKS_PER_GPU", cfg.max_tasks_per_gpu)?;
        cfg.memory_safety_margin =
            parse(&lookup, "MEMORY_SAFETY_MARGIN", cfg.memory_safety_margin)?;
        cfg.reserved_memory_gb = parse(&lookup, "RESERVED_MEMORY", cfg.reserved_memory_gb)?;
        cfg.memory_confidence_factor =
            parse(&lookup, "MEMORY_CONFIDENCE_FACTOR", cfg.memory_confidence_factor)?;
        cfg.memory_calibration_factor =
            parse(&lookup, "MEMORY_CALIBRATION_FACTOR", cfg.memory_calibration_factor)?;
        cfg.calibration_sample_size =
            parse(&lookup, "CALIBRATION_SAMPLE_SIZE", cfg.calibration_sample_size)?;
        cfg.calibration_min_samples =
            parse(&lookup, "CALIBRATION_MIN_SAMPLES", cfg.calibration_min_samples)?;
        cfg.max_task_retries = parse(&lookup, "MAX_TASK_RETRIES", cfg.max_task_retries)?;
        cfg.transcription_timeout = Duration::from_secs(parse(
            &lookup,
            "TRANSCRIPTION_TIMEOUT",
            cfg.transcription_timeout.as_secs(),
        )?);
        let interval_secs: f64 = parse(
            &lookup,
            "BATCH_SCHEDULE_INTERVAL",
            cfg.batch_schedule_interval.as_secs_f64(),
        )?;
        if !interval_secs.is_finite() || interval_secs < 0.0 {
            return Err(ScribeError::Config(format!(
                "BATCH_SCHEDULE_INTERVAL must be a non-negative number, got {interval_secs}"
            )));
        }
        cfg.batch_schedule_interval = Duration::from_secs_f64(interval_secs);
        cfg.max_batch_size = parse(&lookup, "MAX_BATCH_SIZE", cfg.max_batch_size)?;
        cfg.memory_record_retention_days = parse(
            &lookup,
            "MEMORY_RECORD_RETENTION_DAYS",
            cfg.memory_record_retention_days,
        )?;

        if let Some(path) = lookup("MODEL_BASE_PATH") {
            cfg.model_base_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("MODEL_DOWNLOAD_BASE") {
            cfg.model_download_base = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = lookup("UPLOAD_FOLDER") {
            cfg.upload_folder = PathBuf::from(path);
        }
        if let Some(path) = lookup("OUTPUT_FOLDER") {
            cfg.output_folder = PathBuf::from(path);
        }
        if let Some(path) = lookup("MEMORY_USAGE_FILE") {
            cfg.memory_usage_file = PathBuf::from(path);
        }
        if let Some(path) = lookup("WORKER_BINARY") {
            cfg.worker_binary = PathBuf::from(path);
        }
        if let Some(model) = lookup("DEFAULT_MODEL") {
            cfg.default_model = model;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> ScribeResult<()> {
        if !(0.0..1.0).contains(&self.memory_safety_margin) {
            return Err(ScribeError::Config(format!(
                "MEMORY_SAFETY_MARGIN must be in [0, 1), got {}",
                self.memory_safety_margin
            )));
        }
        if self.max_concurrent_transcriptions == 0 {
            return Err(ScribeError::Config(
                "MAX_CONCURRENT_TRANSCRIPTIONS must be at least 1".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ScribeError::Config("MAX_BATCH_SIZE must be at least 1".into()));
        }
        if self.calibration_sample_size == 0 {
            return Err(ScribeError::Config(
                "CALIBRATION_SAMPLE_SIZE must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Cache path for a model's weight file.
    pub fn model_path(&self, model: &str) -> PathBuf {
        self.model_base_path.join(format!("ggml-{model}.bin"))
    }

    /// Download URL for a model's weight file.
    pub fn model_url(&self, model: &str) -> String {
        format!("{}/ggml-{model}.bin", self.model_download_base)
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> ScribeResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|err| {
            ScribeError::Config(format!("invalid value for {key} ({raw:?}): {err}"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_env_is_empty() {
        let cfg = SystemConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.max_concurrent_transcriptions, 5);
        assert_eq!(cfg.max_tasks_per_gpu, 10);
        assert_eq!(cfg.memory_safety_margin, 0.10);
        assert_eq!(cfg.max_task_retries, 3);
        assert_eq!(cfg.transcription_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.max_batch_size, 1);
        assert_eq!(cfg.default_model, "small");
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = SystemConfig::from_lookup(lookup_from(&[
            ("MAX_CONCURRENT_TRANSCRIPTIONS", "2"),
            ("MEMORY_SAFETY_MARGIN", "0.2"),
            ("BATCH_SCHEDULE_INTERVAL", "0.5"),
            ("MODEL_BASE_PATH", "/models"),
            ("MODEL_DOWNLOAD_BASE", "https://mirror.example/whisper/"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_concurrent_transcriptions, 2);
        assert_eq!(cfg.memory_safety_margin, 0.2);
        assert_eq!(cfg.batch_schedule_interval, Duration::from_millis(500));
        assert_eq!(cfg.model_path("tiny"), PathBuf::from("/models/ggml-tiny.bin"));
        assert_eq!(
            cfg.model_url("tiny"),
            "https://mirror.example/whisper/ggml-tiny.bin"
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = SystemConfig::from_lookup(lookup_from(&[(
            "MAX_CONCURRENT_TRANSCRIPTIONS",
            "many",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("MAX_CONCURRENT_TRANSCRIPTIONS"));

        let err =
            SystemConfig::from_lookup(lookup_from(&[("MEMORY_SAFETY_MARGIN", "1.5")]))
                .unwrap_err();
        assert!(err.to_string().contains("MEMORY_SAFETY_MARGIN"));
    }
}

//! Durable log of observed memory usage.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use audioscribe_errors::{ScribeError, ScribeResult};

/// Hard cap on retained records regardless of retention window.
pub const MAX_RECORDS: usize = 1000;

/// One observation of a task's device memory usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub gpu_id: u32,
    pub model_name: String,
    pub estimated_memory: f64,
    pub actual_memory: f64,
    /// `actual - estimated`.
    pub difference: f64,
    #[serde(default)]
    pub audio_duration: Option<f64>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub success: bool,
    /// `actual / estimated`, 1.0 when the estimate was zero.
    pub calibration_factor: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UsageLogFile {
    last_updated: DateTime<Utc>,
    total_records: usize,
    records: Vec<UsageRecord>,
}

/// Aggregate statistics for one (model, gpu) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatistics {
    pub model_name: String,
    pub gpu_id: Option<u32>,
    pub total_records: usize,
    pub avg_estimated: f64,
    pub avg_actual: f64,
    pub avg_difference: f64,
    pub calibration_factor: f64,
    /// Share of records whose error stayed within 10% of the estimate.
    pub accuracy_rate: f64,
}

/// Append-only usage log persisted as a single JSON document.
///
/// Writes go to a `.tmp` sibling and are renamed over the target, so a
/// crash mid-save never corrupts the log. Saves run on a short-lived
/// background thread; at most one save is in flight at a time.
#[derive(Debug)]
pub struct UsageLog {
    path: PathBuf,
    retention_days: i64,
    records: Arc<Mutex<Vec<UsageRecord>>>,
    save_pending: Arc<AtomicBool>,
}

impl UsageLog {
    /// Open the log, loading any existing records. A missing file is an
    /// empty log; an unreadable one is logged and discarded.
    pub fn open(path: impl Into<PathBuf>, retention_days: i64) -> Self {
        let path = path.into();
        let records = match Self::load(&path) {
            Ok(records) => {
                info!(count = records.len(), path = %path.display(), "loaded usage log");
                records
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "could not load usage log, starting empty");
                Vec::new()
            }
        };
        Self {
            path,
            retention_days,
            records: Arc::new(Mutex::new(records)),
            save_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    fn load(path: &Path) -> ScribeResult<Vec<UsageRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path)?;
        let file: UsageLogFile = serde_json::from_str(&raw)?;
        Ok(file.records)
    }

    /// Append an observation, enforcing the record cap, and schedule a save.
    pub fn record(
        &self,
        gpu_id: u32,
        model_name: &str,
        estimated_memory: f64,
        actual_memory: f64,
        audio_duration: Option<f64>,
        task_id: Option<&str>,
        success: bool,
    ) {
        let calibration_factor = if estimated_memory > 0.0 {
            actual_memory / estimated_memory
        } else {
            1.0
        };
        let record = UsageRecord {
            timestamp: Utc::now(),
            gpu_id,
            model_name: model_name.to_string(),
            estimated_memory,
            actual_memory,
            difference: actual_memory - estimated_memory,
            audio_duration,
            task_id: task_id.map(str::to_string),
            success,
            calibration_factor,
        };

        {
            let mut records = self.records.lock();
            records.push(record);
            if records.len() > MAX_RECORDS {
                let overflow = records.len() - MAX_RECORDS;
                records.drain(..overflow);
            }
        }
        info!(
            gpu_id,
            model = model_name,
            estimated = estimated_memory,
            actual = actual_memory,
            "recorded memory usage"
        );
        self.schedule_save();
    }

    /// Drop records older than the retention window. Returns how many were
    /// removed.
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let removed = {
            let mut records = self.records.lock();
            let before = records.len();
            records.retain(|r| r.timestamp >= cutoff);
            before - records.len()
        };
        if removed > 0 {
            info!(removed, days = self.retention_days, "pruned old usage records");
            self.schedule_save();
        }
        removed
    }

    fn schedule_save(&self) {
        if self
            .save_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let records = Arc::clone(&self.records);
        let pending = Arc::clone(&self.save_pending);
        let path = self.path.clone();
        std::thread::spawn(move || {
            if let Err(err) = Self::write_atomic(&path, &records.lock()) {
                error!(%err, path = %path.display(), "failed to save usage log");
            }
            pending.store(false, Ordering::SeqCst);
        });
    }

    /// Synchronous atomic save; used on shutdown and by tests.
    pub fn flush(&self) -> ScribeResult<()> {
        Self::write_atomic(&self.path, &self.records.lock())
    }

    fn write_atomic(path: &Path, records: &[UsageRecord]) -> ScribeResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = UsageLogFile {
            last_updated: Utc::now(),
            total_records: records.len(),
            records: records.to_vec(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, path).map_err(|err| {
            ScribeError::Io(std::io::Error::new(
                err.kind(),
                format!("atomic replace of {} failed: {err}", path.display()),
            ))
        })?;
        debug!(count = records.len(), path = %path.display(), "usage log saved");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn recent(&self, limit: usize) -> Vec<UsageRecord> {
        let records = self.records.lock();
        let start = records.len().saturating_sub(limit);
        records[start..].to_vec()
    }

    /// Aggregate statistics for a model, optionally narrowed to one GPU.
    pub fn model_statistics(&self, model_name: &str, gpu_id: Option<u32>) -> ModelStatistics {
        let records = self.records.lock();
        let filtered: Vec<&UsageRecord> = records
            .iter()
            .filter(|r| r.model_name == model_name)
            .filter(|r| gpu_id.map_or(true, |id| r.gpu_id == id))
            .collect();

        if filtered.is_empty() {
            return ModelStatistics {
                model_name: model_name.to_string(),
                gpu_id,
                total_records: 0,
                avg_estimated: 0.0,
                avg_actual: 0.0,
                avg_difference: 0.0,
                calibration_factor: 1.0,
                accuracy_rate: 0.0,
            };
        }

        let n = filtered.len() as f64;
        let avg_estimated = filtered.iter().map(|r| r.estimated_memory).sum::<f64>() / n;
        let avg_actual = filtered.iter().map(|r| r.actual_memory).sum::<f64>() / n;
        let avg_difference = filtered.iter().map(|r| r.difference).sum::<f64>() / n;
        let calibration_factor =
            filtered.iter().map(|r| r.calibration_factor).sum::<f64>() / n;
        let accurate = filtered
            .iter()
            .filter(|r| r.estimated_memory > 0.0)
            .filter(|r| (r.difference / r.estimated_memory).abs() <= 0.1)
            .count() as f64;

        ModelStatistics {
            model_name: model_name.to_string(),
            gpu_id,
            total_records: filtered.len(),
            avg_estimated,
            avg_actual,
            avg_difference,
            calibration_factor,
            accuracy_rate: accurate / n * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");

        let log = UsageLog::open(&path, 30);
        log.record(0, "medium", 5.0, 4.3, Some(120.0), Some("t1"), true);
        log.record(0, "medium", 5.0, 4.5, None, Some("t2"), true);
        log.flush().unwrap();

        let reloaded = UsageLog::open(&path, 30);
        assert_eq!(reloaded.len(), 2);
        let stats = reloaded.model_statistics("medium", Some(0));
        assert_eq!(stats.total_records, 2);
        assert!((stats.avg_actual - 4.4).abs() < 1e-9);
    }

    #[test]
    fn record_count_stays_bounded() {
        let dir = tempdir().unwrap();
        let log = UsageLog::open(dir.path().join("usage.json"), 30);
        for i in 0..(MAX_RECORDS + 25) {
            log.record(0, "tiny", 1.0, 1.0, None, Some(&format!("t{i}")), true);
        }
        assert_eq!(log.len(), MAX_RECORDS);
        // Oldest records were the ones evicted.
        let recent = log.recent(1);
        assert_eq!(recent[0].task_id.as_deref(), Some("t1024"));
    }

    #[test]
    fn statistics_for_unknown_model_are_neutral() {
        let dir = tempdir().unwrap();
        let log = UsageLog::open(dir.path().join("usage.json"), 30);
        let stats = log.model_statistics("nope", None);
        assert_eq!(stats.total_records, 0);
        assert_eq!(stats.calibration_factor, 1.0);
    }

    #[test]
    fn flush_replaces_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let log = UsageLog::open(&path, 30);
        log.record(1, "small", 2.0, 2.2, None, None, true);
        log.flush().unwrap();
        log.record(1, "small", 2.0, 2.1, None, None, true);
        log.flush().unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let reloaded = UsageLog::open(&path, 30);
        assert_eq!(reloaded.len(), 2);
    }
}

//! Wire protocol spoken across the worker process boundary.
//!
//! The parent spawns one `audioscribe-worker` process per task with device
//! visibility restricted to the target GPU. The child writes line-delimited
//! JSON [`WorkerMessage`]s to stdout; the final line is always `done`.
//! Everything on the wire is restricted to plain serializable data.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::task::OutputFormat;
use crate::transcript::Transcript;

/// Coarse failure classification reported by workers alongside the message.
///
/// The queue trusts this kind when deciding retry eligibility and only falls
/// back to message heuristics when a failure arrives without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Memory pressure, driver hiccups, timeouts on I/O, dropped
    /// connections. Worth retrying.
    Transient,
    /// Missing file, unsupported format, invalid parameters. Retrying would
    /// fail identically.
    InvalidInput,
    /// The deployment is misconfigured (no engine built in, bad worker
    /// binary path). Not retried.
    Configuration,
    /// The worker died without a structured error, or hit the per-task
    /// timeout. Not retried.
    Fatal,
    /// Explicit removal by the user. Terminal, but not counted as a failure.
    Cancelled,
}

/// Arguments handed to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: String,
    pub gpu_id: u32,
    pub model: String,
    pub file: PathBuf,
    pub upload_root: PathBuf,
    pub output_formats: Vec<OutputFormat>,
}

/// Final result of a worker run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub task_id: String,
    pub success: bool,
    pub file: PathBuf,
    #[serde(default)]
    pub transcript: Option<Transcript>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<FailureKind>,
    /// Peak device memory observed during the run in GB, when the driver
    /// could be sampled. Only meaningful on success.
    #[serde(default)]
    pub observed_memory_gb: Option<f64>,
}

impl WorkerReply {
    pub fn success(task_id: impl Into<String>, file: PathBuf, transcript: Transcript) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            file,
            transcript: Some(transcript),
            error: None,
            error_kind: None,
            observed_memory_gb: None,
        }
    }

    pub fn failure(
        task_id: impl Into<String>,
        file: PathBuf,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            file,
            transcript: None,
            error: Some(error.into()),
            error_kind: Some(kind),
            observed_memory_gb: None,
        }
    }
}

/// One line of worker stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Smoothed transcription progress, 0–100.
    Progress {
        task_id: String,
        progress: f32,
        message: String,
    },
    /// Model download progress, 0–100, or -1.0 on download failure.
    DownloadProgress {
        task_id: String,
        model: String,
        progress: f32,
        message: String,
    },
    /// Terminal message; the child exits after writing it.
    Done { reply: WorkerReply },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_json() {
        let msg = WorkerMessage::Progress {
            task_id: "t1".into(),
            progress: 42.5,
            message: "analyzing audio".into(),
        };
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains("\"kind\":\"progress\""));
        let back: WorkerMessage = serde_json::from_str(&line).unwrap();
        match back {
            WorkerMessage::Progress { progress, .. } => assert_eq!(progress, 42.5),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn done_carries_structured_failure() {
        let reply = WorkerReply::failure(
            "t2",
            PathBuf::from("a.wav"),
            FailureKind::InvalidInput,
            "file not found: a.wav",
        );
        let line = serde_json::to_string(&WorkerMessage::Done { reply }).unwrap();
        let back: WorkerMessage = serde_json::from_str(&line).unwrap();
        match back {
            WorkerMessage::Done { reply } => {
                assert!(!reply.success);
                assert_eq!(reply.error_kind, Some(FailureKind::InvalidInput));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

//! Event payloads pushed to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use audioscribe_types::{Task, TaskStatus};

/// State or progress change of a single task. This is the primary signal
/// frontends consume to render queue status and progress bars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: String,
    pub status: TaskStatus,
    pub progress: f32,
    #[serde(default)]
    pub message: Option<String>,
    pub model: String,
    pub retry_count: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result_files: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskUpdate {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            progress: task.progress,
            message: task.message.clone(),
            model: task.model.clone(),
            retry_count: task.retry_count,
            error: task.error.clone(),
            result_files: task
                .result
                .as_ref()
                .map(|r| {
                    r.saved_files
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect()
                })
                .unwrap_or_default(),
            updated_at: task.updated_at,
        }
    }
}

/// Model download progress; `progress` is 0–100, or -1.0 when the download
/// failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub task_id: String,
    pub model_name: String,
    pub progress: f32,
    pub message: String,
}

/// Diagnostic line for the client log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything that flows through the fabric, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SystemEvent {
    TaskUpdate(TaskUpdate),
    DownloadProgress(DownloadProgress),
    LogMessage(LogMessage),
}

impl SystemEvent {
    /// Task id the event concerns, when it concerns one.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            SystemEvent::TaskUpdate(u) => Some(&u.id),
            SystemEvent::DownloadProgress(d) => Some(&d.task_id),
            SystemEvent::LogMessage(_) => None,
        }
    }
}

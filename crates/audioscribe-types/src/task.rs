//! Task data structures and lifecycle states.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a transcription task.
///
/// `Completed` and `Failed` are terminal; `Retrying` tasks sit back in their
/// model queue and are picked up by the scheduler's pending scan ahead of
/// fresh `Pending` tasks of equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether the task should be considered by the scheduler's pending scan.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        }
    }
}

/// Task priority; higher values are scheduled first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Output formats a task can request. Defaults to plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Txt,
    Srt,
    Vtt,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Srt => "srt",
            OutputFormat::Vtt => "vtt",
            OutputFormat::Json => "json",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "txt" => Some(OutputFormat::Txt),
            "srt" => Some(OutputFormat::Srt),
            "vtt" => Some(OutputFormat::Vtt),
            "json" => Some(OutputFormat::Json),
            _ => None,
        }
    }
}

/// Summary recorded on a task after its transcript has been saved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    /// Paths returned by the result sink, one per requested format.
    pub saved_files: Vec<PathBuf>,
    /// Language detected by the engine, when available.
    pub language: Option<String>,
    /// Length of the transcribed text in characters.
    pub text_len: usize,
}

/// Submission payload handed in by the upload layer.
///
/// The historical shape carries a `files` list; exactly one entry is
/// accepted. Multi-file uploads are fanned out into one submission per file
/// before they reach the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    #[serde(default)]
    pub task_id: Option<String>,
    pub user_id: String,
    pub files: Vec<PathBuf>,
    pub model: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub output_formats: Option<Vec<OutputFormat>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// The unit of work: one audio file, one model, one lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub file: PathBuf,
    pub model: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub progress: f32,
    pub message: Option<String>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Memory reserved for this task in GB; set only while a reservation is
    /// held, cleared on release.
    pub allocated_memory: Option<f64>,
    /// GPU the reservation was made on; paired with `allocated_memory`.
    pub allocated_gpu: Option<u32>,
    pub output_formats: Vec<OutputFormat>,
}

impl Task {
    /// Build a fresh `Pending` task from a validated submission file.
    pub fn new(
        id: Option<String>,
        user_id: impl Into<String>,
        file: PathBuf,
        model: impl Into<String>,
        priority: TaskPriority,
        output_formats: Vec<OutputFormat>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        let formats = if output_formats.is_empty() {
            vec![OutputFormat::Txt]
        } else {
            output_formats
        };
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: user_id.into(),
            file,
            model: model.into(),
            priority,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            start_time: None,
            end_time: None,
            progress: 0.0,
            message: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            allocated_memory: None,
            allocated_gpu: None,
            output_formats: formats,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn clear_allocation(&mut self) {
        self.allocated_memory = None;
        self.allocated_gpu = None;
    }

    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_defaults() {
        let task = Task::new(
            None,
            "user-1",
            PathBuf::from("a.wav"),
            "small",
            TaskPriority::default(),
            vec![],
            3,
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.output_formats, vec![OutputFormat::Txt]);
        assert_eq!(task.progress, 0.0);
        assert!(task.allocated_memory.is_none());
        assert!(!task.id.is_empty());
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Retrying.is_waiting());
        assert!(!TaskStatus::Processing.is_waiting());
    }

    #[test]
    fn output_format_parse() {
        assert_eq!(OutputFormat::parse("SRT"), Some(OutputFormat::Srt));
        assert_eq!(OutputFormat::parse(" json "), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("docx"), None);
    }
}

//! Shared data model for the AudioScribe transcription core
//!
//! This crate defines the task lifecycle types, the transcript produced by a
//! worker, and the line-delimited JSON protocol spoken across the worker
//! process boundary. Everything here is plain data: no locks, no I/O.

mod protocol;
mod task;
mod transcript;

pub use protocol::{FailureKind, WorkerMessage, WorkerReply, WorkerRequest};
pub use task::{
    OutputFormat, Task, TaskPriority, TaskResult, TaskStatus, TaskSubmission,
};
pub use transcript::{Transcript, TranscriptSegment};

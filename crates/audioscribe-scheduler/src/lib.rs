//! Batch scheduling for the AudioScribe core.
//!
//! [`BatchScheduler`] runs the match-making loop between pending tasks and
//! GPU memory pools; [`runner::ProcessWorkerRunner`] owns the process
//! boundary to the per-task worker; [`TranscriptionSystem`] wires the whole
//! core together as one explicit value — no ambient globals.

pub mod runner;
mod scheduler;
mod system;

pub use runner::{ProcessWorkerRunner, ProgressSink, WorkerRunner};
pub use scheduler::{BatchScheduler, SchedulerStatus};
pub use system::{GpuStatusReport, TranscriptionSystem};

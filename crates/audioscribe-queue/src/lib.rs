//! Per-model task queues and the task state machine.
//!
//! A task lives in exactly one place at any instant: its model's pending
//! queue, the processing map, or the bounded terminal log. All transitions
//! happen under one lock; events describing them are published to the
//! fabric only after the lock is released.

mod queue;
mod stats;

pub use queue::{RemovedTask, TaskQueue};
pub use stats::{ModelQueueStats, QueueCounters, QueueStats};

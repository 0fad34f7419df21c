//! Read-only queue statistics.

use std::collections::HashMap;

use serde::Serialize;

/// Lifetime counters across all models.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueCounters {
    pub total_added: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
}

/// Per-model pending/processing counts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModelQueueStats {
    pub pending: usize,
    pub processing: usize,
}

/// Snapshot of queue shape and counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub models: HashMap<String, ModelQueueStats>,
    pub total_pending: usize,
    pub total_processing: usize,
    pub counters: QueueCounters,
}

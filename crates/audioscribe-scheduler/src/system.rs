//! The assembled transcription core.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use audioscribe_config::SystemConfig;
use audioscribe_errors::{ScribeError, ScribeResult};
use audioscribe_events::EventBus;
use audioscribe_events::RecheckSignal;
use audioscribe_gpu::{GpuProbe, GpuSnapshot, NvmlProbe, PoolSet, PoolStatus};
use audioscribe_memory::MemoryEstimator;
use audioscribe_output::{ResultSink, TranscriptSaver};
use audioscribe_queue::{QueueStats, TaskQueue};
use audioscribe_types::{Task, TaskPriority, TaskSubmission};

use crate::runner::{ProcessWorkerRunner, WorkerRunner};
use crate::scheduler::{BatchScheduler, SchedulerStatus};

/// Device and pool state for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GpuStatusReport {
    pub devices: Vec<GpuSnapshot>,
    pub pools: Vec<PoolStatus>,
    /// Device with the most free memory, for selector UIs.
    pub best_gpu: Option<u32>,
}

/// One explicit value owning the whole scheduling core.
///
/// The application entrypoint builds a `TranscriptionSystem`, hands it to
/// its transport layer (HTTP, RPC, whatever), and calls [`start`]. There
/// are no process-global instances anywhere in the core.
///
/// [`start`]: TranscriptionSystem::start
pub struct TranscriptionSystem {
    config: SystemConfig,
    events: EventBus,
    queue: Arc<TaskQueue>,
    pools: Arc<PoolSet>,
    probe: Arc<dyn GpuProbe>,
    scheduler: Arc<BatchScheduler>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptionSystem {
    /// Build the production wiring: NVML inventory, process workers, the
    /// filesystem transcript sink. Must be called inside a tokio runtime.
    pub fn new(config: SystemConfig) -> ScribeResult<Self> {
        let probe: Arc<dyn GpuProbe> = Arc::new(NvmlProbe::new()?);
        let runner: Arc<dyn WorkerRunner> = Arc::new(ProcessWorkerRunner::new(&config));
        let sink: Arc<dyn ResultSink> =
            Arc::new(TranscriptSaver::new(config.output_folder.clone()));
        Ok(Self::with_parts(config, probe, runner, sink))
    }

    /// Build with injected collaborators. This is also the test seam.
    pub fn with_parts(
        config: SystemConfig,
        probe: Arc<dyn GpuProbe>,
        runner: Arc<dyn WorkerRunner>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let events = EventBus::new();
        let recheck = Arc::new(RecheckSignal::new());
        let queue = Arc::new(TaskQueue::new(
            config.max_concurrent_transcriptions,
            events.clone(),
            Arc::clone(&recheck),
        ));
        let pools = Arc::new(PoolSet::new(
            config.memory_safety_margin,
            config.reserved_memory_gb,
        ));
        let estimator = Arc::new(MemoryEstimator::new(&config));
        let scheduler = Arc::new(BatchScheduler::new(
            config.clone(),
            Arc::clone(&queue),
            Arc::clone(&pools),
            Arc::clone(&estimator),
            Arc::clone(&probe),
            runner,
            sink,
            events.clone(),
            recheck,
        ));

        Self {
            config,
            events,
            queue,
            pools,
            probe,
            scheduler,
            loop_handle: Mutex::new(None),
        }
    }

    /// Start the scheduling loop. Idempotent.
    pub fn start(&self) {
        let mut handle = self.loop_handle.lock();
        if handle.is_none() {
            info!("starting transcription system");
            *handle = Some(Arc::clone(&self.scheduler).start());
        }
    }

    /// Stop the loop and wait for it to wind down. In-flight workers finish
    /// on their own and still clean up after themselves.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("transcription system stopped");
    }

    /// Submit one task. The submission keeps the historical `files` list
    /// shape but exactly one entry is accepted — multi-file uploads are
    /// split into one task per file before they reach the core.
    pub fn submit(&self, submission: TaskSubmission) -> ScribeResult<String> {
        if submission.files.len() != 1 {
            return Err(ScribeError::InvalidInput(format!(
                "expected exactly one file per task, got {}",
                submission.files.len()
            )));
        }
        let Some(file) = submission.files.into_iter().next() else {
            return Err(ScribeError::InvalidInput("submission carries no file".into()));
        };
        let model = if submission.model.trim().is_empty() {
            self.config.default_model.clone()
        } else {
            submission.model
        };

        let task = Task::new(
            submission.task_id,
            submission.user_id,
            file,
            model,
            submission.priority.unwrap_or(TaskPriority::Normal),
            submission.output_formats.unwrap_or_default(),
            submission
                .max_retries
                .unwrap_or(self.config.max_task_retries),
        );
        let task_id = task.id.clone();
        self.queue.add(task)?;
        Ok(task_id)
    }

    /// Cancel a task wherever it is. Pending tasks disappear immediately;
    /// processing tasks get their worker signalled and release resources on
    /// its exit.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.queue.remove(task_id) {
            Some(removed) => {
                if removed.was_processing {
                    self.scheduler.cancel_worker(task_id);
                }
                true
            }
            None => false,
        }
    }

    /// Manually requeue a failed task.
    pub fn retry(&self, task_id: &str) -> bool {
        self.queue.retry(task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.queue.get_task(task_id)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Fresh device snapshots next to the scheduler's pool ledgers.
    pub fn gpu_status(&self) -> ScribeResult<GpuStatusReport> {
        let devices = self.probe.snapshot()?;
        let best_gpu = audioscribe_gpu::best_available(&devices).map(|d| d.id);
        Ok(GpuStatusReport {
            devices,
            pools: self.pools.statuses(),
            best_gpu,
        })
    }

    /// The event fabric; subscribe here for task updates, download
    /// progress and log messages.
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

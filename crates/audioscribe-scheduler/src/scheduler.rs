//! The batch scheduling loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use audioscribe_config::SystemConfig;
use audioscribe_errors::{ScribeError, ScribeResult};
use audioscribe_events::{DownloadProgress, EventBus, RecheckSignal, SystemEvent};
use audioscribe_gpu::{GpuMemoryPool, GpuProbe, PoolSet};
use audioscribe_memory::MemoryEstimator;
use audioscribe_output::ResultSink;
use audioscribe_queue::TaskQueue;
use audioscribe_types::{
    FailureKind, Task, TaskResult, WorkerMessage, WorkerReply, WorkerRequest,
};

use crate::runner::{ProgressSink, WorkerRunner};

/// Pool state is reconciled with the driver every this many cycles, or
/// immediately after a re-check signal.
const HARDWARE_SYNC_CYCLES: u32 = 10;

/// GPUs whose available memory sits at or below this floor are skipped.
const HARD_FLOOR_GB: f64 = 1.0;

/// Operational snapshot of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_workers: usize,
    pub per_gpu_active: HashMap<u32, usize>,
}

/// Matches pending tasks to GPUs under memory and concurrency constraints.
///
/// One long-running loop: poll pool state, pick candidates in retry/priority
/// order, reserve memory, move the task to processing, and hand it to a
/// worker on its own tokio task so the loop never blocks on transcription.
pub struct BatchScheduler {
    config: SystemConfig,
    queue: Arc<TaskQueue>,
    pools: Arc<PoolSet>,
    estimator: Arc<MemoryEstimator>,
    probe: Arc<dyn GpuProbe>,
    runner: Arc<dyn WorkerRunner>,
    sink: Arc<dyn ResultSink>,
    events: EventBus,
    recheck: Arc<RecheckSignal>,
    shutdown: CancellationToken,
    sync_counter: AtomicU32,
    active: Mutex<HashMap<String, CancellationToken>>,
    gpu_active: Mutex<HashMap<u32, usize>>,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SystemConfig,
        queue: Arc<TaskQueue>,
        pools: Arc<PoolSet>,
        estimator: Arc<MemoryEstimator>,
        probe: Arc<dyn GpuProbe>,
        runner: Arc<dyn WorkerRunner>,
        sink: Arc<dyn ResultSink>,
        events: EventBus,
        recheck: Arc<RecheckSignal>,
    ) -> Self {
        Self {
            config,
            queue,
            pools,
            estimator,
            probe,
            runner,
            sink,
            events,
            recheck,
            shutdown: CancellationToken::new(),
            sync_counter: AtomicU32::new(HARDWARE_SYNC_CYCLES),
            active: Mutex::new(HashMap::new()),
            gpu_active: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the scheduling loop. The returned handle finishes after
    /// [`BatchScheduler::stop`].
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("scheduler loop started");
            loop {
                if self.shutdown.is_cancelled() {
                    break;
                }
                if let Err(err) = Arc::clone(&self).run_cycle() {
                    error!(%err, "scheduler cycle failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.batch_schedule_interval) => {}
                    _ = self.recheck.notified() => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
            info!("scheduler loop stopped");
        })
    }

    /// Stop the loop. In-flight workers keep running to completion; their
    /// cleanup paths still release memory and update the queue.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Cancel one in-flight worker.
    pub fn cancel_worker(&self, task_id: &str) {
        if let Some(token) = self.active.lock().get(task_id) {
            token.cancel();
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: !self.shutdown.is_cancelled(),
            active_workers: self.active.lock().len(),
            per_gpu_active: self.gpu_active.lock().clone(),
        }
    }

    /// One pass of the scheduling loop.
    fn run_cycle(self: Arc<Self>) -> ScribeResult<()> {
        self.maybe_sync_hardware()?;

        if self.queue.processing_count() >= self.config.max_concurrent_transcriptions {
            debug!(
                cap = self.config.max_concurrent_transcriptions,
                "global concurrency cap reached, holding pending tasks"
            );
            return Ok(());
        }

        let candidates = self.queue.pending_tasks();
        if candidates.is_empty() {
            return Ok(());
        }

        let mut taken: HashSet<String> = HashSet::new();
        for pool in self.pools.all() {
            Arc::clone(&self).dispatch_for_gpu(&pool, &candidates, &mut taken);
        }
        Ok(())
    }

    /// Reconcile pools with hardware when the periodic counter elapses, a
    /// re-check was requested, or no pools exist yet.
    fn maybe_sync_hardware(&self) -> ScribeResult<()> {
        let forced = self.recheck.take();
        let elapsed =
            self.sync_counter.fetch_add(1, Ordering::SeqCst) + 1 >= HARDWARE_SYNC_CYCLES;
        if !(forced || elapsed || self.pools.is_empty()) {
            return Ok(());
        }
        self.sync_counter.store(0, Ordering::SeqCst);

        match self.probe.snapshot() {
            Ok(snapshots) if snapshots.is_empty() && self.pools.is_empty() => {
                self.fail_pending_without_gpus();
            }
            Ok(snapshots) => self.pools.sync_all(&snapshots),
            Err(err) => warn!(%err, "gpu snapshot failed, keeping pool state"),
        }
        Ok(())
    }

    /// With no devices at all, pending work can never run; fail it with a
    /// configuration error instead of holding it forever.
    fn fail_pending_without_gpus(&self) {
        for task in self.queue.pending_tasks() {
            warn!(task_id = %task.id, "no GPUs available, failing task");
            self.queue.fail(
                &task.id,
                "no GPUs available for transcription",
                Some(FailureKind::Configuration),
            );
        }
    }

    fn gpu_active_count(&self, gpu_id: u32) -> usize {
        self.gpu_active.lock().get(&gpu_id).copied().unwrap_or(0)
    }

    fn dispatch_for_gpu(
        self: Arc<Self>,
        pool: &Arc<GpuMemoryPool>,
        candidates: &[Task],
        taken: &mut HashSet<String>,
    ) {
        let gpu_id = pool.gpu_id();
        let available = pool.available_memory();
        if available <= HARD_FLOOR_GB {
            debug!(gpu_id, available, "below memory floor, skipping gpu");
            return;
        }
        if self.gpu_active_count(gpu_id) >= self.config.max_tasks_per_gpu {
            debug!(gpu_id, "per-gpu task cap reached");
            return;
        }

        let mut dispatched = 0;
        for task in candidates {
            if dispatched >= self.config.max_batch_size {
                break;
            }
            if taken.contains(&task.id) {
                continue;
            }
            if self.queue.processing_count() >= self.config.max_concurrent_transcriptions {
                return;
            }

            let need = self.estimator.estimate(gpu_id, &task.model);
            if !pool.allocate(need) {
                // Memory pressure: nothing smaller-priority gets to jump in
                // this cycle; waiting tasks stay pending/retrying.
                debug!(gpu_id, task_id = %task.id, need, "allocation failed, stopping scan");
                break;
            }
            if !self.queue.move_to_processing(&task.id, gpu_id, need) {
                pool.release(need);
                continue;
            }

            pool.update_model_estimate(&task.model, need);
            taken.insert(task.id.clone());
            dispatched += 1;
            info!(task_id = %task.id, gpu_id, need, "dispatching task");
            Arc::clone(&self).spawn_worker(task.clone(), gpu_id, need);
        }
    }

    fn spawn_worker(self: Arc<Self>, task: Task, gpu_id: u32, reserved_gb: f64) {
        let token = CancellationToken::new();
        self.active.lock().insert(task.id.clone(), token.clone());
        *self.gpu_active.lock().entry(gpu_id).or_insert(0) += 1;

        tokio::spawn(async move {
            self.run_task(task, gpu_id, reserved_gb, token).await;
        });
    }

    /// Supervise one worker from dispatch to terminal state. Every exit
    /// path releases the reservation, drops the bookkeeping and nudges the
    /// scheduler.
    async fn run_task(
        self: Arc<Self>,
        task: Task,
        gpu_id: u32,
        reserved_gb: f64,
        token: CancellationToken,
    ) {
        let request = WorkerRequest {
            task_id: task.id.clone(),
            gpu_id,
            model: task.model.clone(),
            file: task.file.clone(),
            upload_root: self.config.upload_folder.clone(),
            output_formats: task.output_formats.clone(),
        };

        let progress = self.progress_sink();
        let outcome = tokio::select! {
            result = self.runner.run(request, progress) => Some(result),
            _ = token.cancelled() => None,
        };

        // Resource hygiene first, regardless of how the worker ended.
        if let Some(pool) = self.pools.get(gpu_id) {
            pool.release(reserved_gb);
        }
        self.active.lock().remove(&task.id);
        if let Some(count) = self.gpu_active.lock().get_mut(&gpu_id) {
            *count = count.saturating_sub(1);
        }

        match outcome {
            None => {
                info!(task_id = %task.id, "worker cancelled");
                // Usually already removed from the queue by the cancel path;
                // this covers cancellations that raced a dispatch.
                self.queue.fail(
                    &task.id,
                    "cancelled by user",
                    Some(FailureKind::Cancelled),
                );
            }
            Some(Ok(reply)) if reply.success => {
                self.finish_success(&task, gpu_id, reserved_gb, reply).await
            }
            Some(Ok(reply)) => {
                let message = reply
                    .error
                    .unwrap_or_else(|| "worker reported an unspecified failure".to_string());
                warn!(task_id = %task.id, %message, "worker failed");
                self.queue.fail(&task.id, &message, reply.error_kind);
            }
            Some(Err(ScribeError::Timeout(message))) => {
                warn!(task_id = %task.id, %message, "worker timed out");
                self.queue
                    .fail(&task.id, &message, Some(FailureKind::Fatal));
            }
            Some(Err(err)) => {
                warn!(task_id = %task.id, %err, "worker runner failed");
                self.queue
                    .fail(&task.id, &err.to_string(), Some(FailureKind::Fatal));
            }
        }
        self.recheck.trigger();
    }

    async fn finish_success(
        &self,
        task: &Task,
        gpu_id: u32,
        reserved_gb: f64,
        reply: WorkerReply,
    ) {
        let Some(transcript) = reply.transcript else {
            self.queue.fail(
                &task.id,
                "worker reported success without a transcript",
                Some(FailureKind::Fatal),
            );
            return;
        };

        // Feed the observed peak back into calibration.
        if let Some(observed) = reply.observed_memory_gb {
            self.estimator.record_usage(
                gpu_id,
                &task.model,
                reserved_gb,
                observed,
                Some(transcript.duration_secs),
                Some(&task.id),
                true,
            );
        }

        self.queue
            .update_progress(&task.id, 90.0, Some("saving transcript"));
        let language = transcript.language.clone();
        let text_len = transcript.text.chars().count();

        let sink = Arc::clone(&self.sink);
        let snapshot = task.clone();
        let saved = tokio::task::spawn_blocking(move || sink.save(&snapshot, &transcript))
            .await
            .map_err(|err| ScribeError::Worker(format!("save task panicked: {err}")))
            .and_then(|result| result);

        match saved {
            Ok(saved_files) => {
                self.queue
                    .update_progress(&task.id, 95.0, Some("finalizing"));
                self.queue.complete(
                    &task.id,
                    TaskResult {
                        saved_files,
                        language,
                        text_len,
                    },
                );
            }
            Err(err) => {
                warn!(task_id = %task.id, %err, "saving transcript failed");
                self.queue.fail(
                    &task.id,
                    &format!("failed to save transcript: {err}"),
                    Some(FailureKind::Fatal),
                );
            }
        }
    }

    /// Bridge worker protocol messages into the queue and the event fabric.
    fn progress_sink(&self) -> ProgressSink {
        let queue = Arc::clone(&self.queue);
        let events = self.events.clone();
        Arc::new(move |message: WorkerMessage| match message {
            WorkerMessage::Progress {
                task_id,
                progress,
                message,
            } => queue.update_progress(&task_id, progress, Some(&message)),
            WorkerMessage::DownloadProgress {
                task_id,
                model,
                progress,
                message,
            } => events.publish(SystemEvent::DownloadProgress(DownloadProgress {
                task_id,
                model_name: model,
                progress,
                message,
            })),
            WorkerMessage::Done { .. } => {}
        })
    }
}

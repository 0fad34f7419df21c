//! The intelligent task queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use audioscribe_errors::{classify_failure, Retryability, ScribeError, ScribeResult};
use audioscribe_events::{EventBus, RecheckSignal, SystemEvent, TaskUpdate};
use audioscribe_types::{FailureKind, Task, TaskResult, TaskStatus};

use crate::stats::{ModelQueueStats, QueueCounters, QueueStats};

/// Progress changes smaller than this do not emit an update.
const PROGRESS_EPSILON: f32 = 0.1;

/// How many terminal tasks are kept around for status queries.
const FINISHED_CAP: usize = 1000;

/// A task taken out of the queue by user request.
#[derive(Debug, Clone)]
pub struct RemovedTask {
    pub task: Task,
    /// True when the task was actively processing; the caller must signal
    /// its worker.
    pub was_processing: bool,
}

#[derive(Default)]
struct QueueState {
    /// Pending and retrying tasks, per model, in admission order.
    queues: HashMap<String, VecDeque<Task>>,
    processing: HashMap<String, Task>,
    finished: HashMap<String, Task>,
    finished_order: VecDeque<String>,
    current_processing: usize,
    counters: QueueCounters,
}

impl QueueState {
    fn known(&self, task_id: &str) -> bool {
        self.processing.contains_key(task_id)
            || self.finished.contains_key(task_id)
            || self
                .queues
                .values()
                .any(|q| q.iter().any(|t| t.id == task_id))
    }

    fn take_from_queue(&mut self, task_id: &str) -> Option<Task> {
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|t| t.id == task_id) {
                return queue.remove(pos);
            }
        }
        None
    }

    fn finish(&mut self, task: Task) {
        self.finished_order.push_back(task.id.clone());
        self.finished.insert(task.id.clone(), task);
        while self.finished_order.len() > FINISHED_CAP {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

/// Per-model ordered queues plus the processing set.
///
/// Every operation takes the single internal lock, applies the transition,
/// and returns the events to publish; events hit the fabric only after the
/// guard is dropped so subscribers can never re-enter the queue under its
/// own lock.
pub struct TaskQueue {
    max_concurrent: usize,
    state: Mutex<QueueState>,
    events: EventBus,
    recheck: Arc<RecheckSignal>,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize, events: EventBus, recheck: Arc<RecheckSignal>) -> Self {
        Self {
            max_concurrent,
            state: Mutex::new(QueueState::default()),
            events,
            recheck,
        }
    }

    fn publish(&self, task: &Task) {
        self.events
            .publish(SystemEvent::TaskUpdate(TaskUpdate::from_task(task)));
    }

    /// Append a task to its model's queue. Duplicate ids are rejected.
    pub fn add(&self, task: Task) -> ScribeResult<()> {
        let update;
        {
            let mut state = self.state.lock();
            if state.known(&task.id) {
                return Err(ScribeError::Queue(format!(
                    "task {} already exists",
                    task.id
                )));
            }
            update = task.clone();
            let queue = state.queues.entry(task.model.clone()).or_default();
            queue.push_back(task);
            state.counters.total_added += 1;
            info!(
                task_id = %update.id,
                model = %update.model,
                queue_len = queue_len_of(&state, &update.model),
                "task queued"
            );
        }
        self.publish(&update);
        Ok(())
    }

    /// Pop the head of one model's queue.
    pub fn next_for_model(&self, model: &str) -> Option<Task> {
        let mut state = self.state.lock();
        state.queues.get_mut(model).and_then(|q| q.pop_front())
    }

    /// Move a waiting task into the processing set, recording its memory
    /// reservation. Fails when the global concurrency cap is reached or the
    /// task is not waiting in a queue.
    pub fn move_to_processing(&self, task_id: &str, gpu_id: u32, memory_gb: f64) -> bool {
        let update;
        {
            let mut state = self.state.lock();
            if state.current_processing >= self.max_concurrent {
                warn!(
                    task_id,
                    cap = self.max_concurrent,
                    "concurrency cap reached, not dispatching"
                );
                return false;
            }
            let Some(mut task) = state.take_from_queue(task_id) else {
                warn!(task_id, "task not waiting in any queue");
                return false;
            };
            task.status = TaskStatus::Processing;
            task.allocated_gpu = Some(gpu_id);
            task.allocated_memory = Some(memory_gb);
            if task.start_time.is_none() {
                task.start_time = Some(Utc::now());
            }
            task.touch();
            update = task.clone();
            state.processing.insert(task.id.clone(), task);
            state.current_processing += 1;
            info!(
                task_id,
                gpu_id,
                memory_gb,
                processing = state.current_processing,
                "task processing"
            );
        }
        self.publish(&update);
        true
    }

    /// Mark a processing task completed. Only valid for tasks in the
    /// processing set; terminal tasks are left untouched.
    pub fn complete(&self, task_id: &str, result: TaskResult) -> bool {
        let update;
        {
            let mut state = self.state.lock();
            let Some(mut task) = state.processing.remove(task_id) else {
                warn!(task_id, "complete called for a task that is not processing");
                return false;
            };
            state.current_processing -= 1;
            task.status = TaskStatus::Completed;
            task.progress = 100.0;
            task.message = Some("task completed".to_string());
            task.result = Some(result);
            task.end_time = Some(Utc::now());
            task.clear_allocation();
            task.touch();
            update = task.clone();
            state.counters.total_completed += 1;
            state.finish(task);
            info!(
                task_id,
                remaining = state.current_processing,
                "task completed"
            );
        }
        self.publish(&update);
        // Freed capacity: have the scheduler look at pending work promptly.
        self.recheck.trigger();
        true
    }

    /// Record a failure. Retryable failures with retry budget left go back
    /// to the tail of their model queue as `Retrying`; everything else is
    /// terminal.
    pub fn fail(&self, task_id: &str, error: &str, kind: Option<FailureKind>) -> bool {
        let update;
        {
            let mut state = self.state.lock();
            if state.finished.contains_key(task_id) {
                warn!(task_id, "fail called for a task that is already terminal");
                return false;
            }

            let (mut task, was_processing) = match state.processing.remove(task_id) {
                Some(task) => (task, true),
                None => match state.take_from_queue(task_id) {
                    Some(task) => (task, false),
                    None => {
                        warn!(task_id, "fail called for an unknown task");
                        return false;
                    }
                },
            };
            if was_processing {
                state.current_processing -= 1;
            }

            task.error = Some(error.to_string());
            task.clear_allocation();
            task.touch();

            let retryable = classify_failure(kind, error) == Retryability::Retry;
            if retryable && task.retry_count < task.max_retries {
                task.retry_count += 1;
                task.status = TaskStatus::Retrying;
                task.message = Some(format!(
                    "retrying ({}/{})",
                    task.retry_count, task.max_retries
                ));
                state.counters.total_retried += 1;
                update = task.clone();
                info!(
                    task_id,
                    retry = task.retry_count,
                    max = task.max_retries,
                    error,
                    "task requeued for retry"
                );
                state.queues.entry(task.model.clone()).or_default().push_back(task);
            } else {
                task.status = TaskStatus::Failed;
                task.end_time = Some(Utc::now());
                state.counters.total_failed += 1;
                update = task.clone();
                info!(task_id, error, "task failed terminally");
                state.finish(task);
            }
        }
        self.publish(&update);
        self.recheck.trigger();
        true
    }

    /// Update progress for a processing task. Values are clamped and never
    /// regress; sub-epsilon changes are swallowed. 100 is reserved for the
    /// completion transition, so in-flight updates top out just below it.
    pub fn update_progress(&self, task_id: &str, progress: f32, message: Option<&str>) {
        let update;
        {
            let mut state = self.state.lock();
            let Some(task) = state.processing.get_mut(task_id) else {
                return;
            };
            let clamped = progress.clamp(0.0, 99.9).max(task.progress);
            if (clamped - task.progress).abs() < PROGRESS_EPSILON {
                return;
            }
            task.progress = clamped;
            if let Some(message) = message {
                task.message = Some(message.to_string());
            }
            task.touch();
            update = task.clone();
            debug!(task_id, progress = clamped, "progress update");
        }
        self.publish(&update);
    }

    /// User-initiated removal from whichever location the task occupies.
    /// Finished tasks stay in the terminal log.
    pub fn remove(&self, task_id: &str) -> Option<RemovedTask> {
        let removed;
        {
            let mut state = self.state.lock();
            if let Some(mut task) = state.processing.remove(task_id) {
                state.current_processing -= 1;
                task.clear_allocation();
                task.touch();
                removed = RemovedTask {
                    task,
                    was_processing: true,
                };
            } else if let Some(mut task) = state.take_from_queue(task_id) {
                task.touch();
                removed = RemovedTask {
                    task,
                    was_processing: false,
                };
            } else {
                return None;
            }
            info!(task_id, processing = removed.was_processing, "task removed");
        }
        self.publish(&removed.task);
        self.recheck.trigger();
        Some(removed)
    }

    /// Manually requeue a terminally failed task.
    pub fn retry(&self, task_id: &str) -> bool {
        let update;
        {
            let mut state = self.state.lock();
            let Some(mut task) = state.finished.remove(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Failed {
                state.finished.insert(task_id.to_string(), task);
                return false;
            }
            state.finished_order.retain(|id| id != task_id);
            task.status = TaskStatus::Pending;
            task.error = None;
            task.end_time = None;
            task.progress = 0.0;
            task.retry_count += 1;
            task.message = Some("requeued by user".to_string());
            task.touch();
            update = task.clone();
            state.counters.total_retried += 1;
            state.queues.entry(task.model.clone()).or_default().push_back(task);
            info!(task_id, "task manually requeued");
        }
        self.publish(&update);
        self.recheck.trigger();
        true
    }

    /// All waiting (pending + retrying) tasks across models, ordered for
    /// the scheduler: retrying first, then priority descending; admission
    /// order within a class.
    pub fn pending_tasks(&self) -> Vec<Task> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state
            .queues
            .values()
            .flat_map(|q| q.iter())
            .filter(|t| t.status.is_waiting())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            let a_retrying = a.status == TaskStatus::Retrying;
            let b_retrying = b.status == TaskStatus::Retrying;
            b_retrying
                .cmp(&a_retrying)
                .then(b.priority.cmp(&a.priority))
        });
        tasks
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        let state = self.state.lock();
        state
            .processing
            .get(task_id)
            .or_else(|| state.finished.get(task_id))
            .cloned()
            .or_else(|| {
                state
                    .queues
                    .values()
                    .flat_map(|q| q.iter())
                    .find(|t| t.id == task_id)
                    .cloned()
            })
    }

    /// Waiting tasks of one model in admission order.
    pub fn tasks_by_model(&self, model: &str) -> Vec<Task> {
        let state = self.state.lock();
        state
            .queues
            .get(model)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn processing_count(&self) -> usize {
        self.state.lock().current_processing
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut models: HashMap<String, ModelQueueStats> = HashMap::new();
        for (model, queue) in &state.queues {
            models.entry(model.clone()).or_default().pending = queue.len();
        }
        for task in state.processing.values() {
            models.entry(task.model.clone()).or_default().processing += 1;
        }
        QueueStats {
            total_pending: state.queues.values().map(|q| q.len()).sum(),
            total_processing: state.current_processing,
            counters: state.counters,
            models,
        }
    }
}

fn queue_len_of(state: &QueueState, model: &str) -> usize {
    state.queues.get(model).map(|q| q.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audioscribe_types::{OutputFormat, TaskPriority};
    use std::path::PathBuf;

    fn task(id: &str, model: &str, priority: TaskPriority) -> Task {
        Task::new(
            Some(id.to_string()),
            "user",
            PathBuf::from(format!("{id}.wav")),
            model,
            priority,
            vec![OutputFormat::Txt],
            3,
        )
    }

    fn queue(cap: usize) -> TaskQueue {
        TaskQueue::new(cap, EventBus::new(), Arc::new(RecheckSignal::new()))
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        let err = q.add(task("a", "small", TaskPriority::Normal)).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn full_lifecycle_happy_path() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();

        assert!(q.move_to_processing("a", 0, 2.0));
        let processing = q.get_task("a").unwrap();
        assert_eq!(processing.status, TaskStatus::Processing);
        assert_eq!(processing.allocated_gpu, Some(0));
        assert_eq!(processing.allocated_memory, Some(2.0));
        assert!(processing.start_time.is_some());

        assert!(q.complete("a", TaskResult::default()));
        let done = q.get_task("a").unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(done.end_time.unwrap() >= done.start_time.unwrap());
        assert!(done.allocated_memory.is_none());
        assert_eq!(q.processing_count(), 0);
    }

    #[tokio::test]
    async fn concurrency_cap_blocks_moves() {
        let q = queue(1);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        q.add(task("b", "small", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(!q.move_to_processing("b", 0, 2.0));
        // b stays waiting.
        assert_eq!(q.get_task("b").unwrap().status, TaskStatus::Pending);
        assert!(q.complete("a", TaskResult::default()));
        assert!(q.move_to_processing("b", 0, 2.0));
    }

    #[tokio::test]
    async fn transient_failure_requeues_at_tail() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        q.add(task("b", "small", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(q.fail("a", "CUDA out of memory", Some(FailureKind::Transient)));

        let retried = q.get_task("a").unwrap();
        assert_eq!(retried.status, TaskStatus::Retrying);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.allocated_memory.is_none());

        // Tail position: b is still ahead in admission order.
        let small = q.tasks_by_model("small");
        assert_eq!(small.last().unwrap().id, "a");
    }

    #[tokio::test]
    async fn retries_exhaust_into_failed() {
        let q = queue(5);
        let mut t = task("a", "small", TaskPriority::Normal);
        t.max_retries = 1;
        q.add(t).unwrap();

        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(q.fail("a", "gpu hiccup", Some(FailureKind::Transient)));
        assert_eq!(q.get_task("a").unwrap().status, TaskStatus::Retrying);

        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(q.fail("a", "gpu hiccup again", Some(FailureKind::Transient)));
        let failed = q.get_task("a").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.end_time.is_some());
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal_immediately() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(q.fail(
            "a",
            "file not found: a.wav",
            Some(FailureKind::InvalidInput)
        ));
        let failed = q.get_task("a").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn terminal_transitions_are_final() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(q.complete("a", TaskResult::default()));
        // complete then fail: rejected, state unchanged.
        assert!(!q.fail("a", "late failure", None));
        assert_eq!(q.get_task("a").unwrap().status, TaskStatus::Completed);
        // complete twice: rejected.
        assert!(!q.complete("a", TaskResult::default()));
    }

    #[tokio::test]
    async fn progress_is_clamped_monotonic_and_gated() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));

        q.update_progress("a", 42.0, Some("analyzing"));
        assert_eq!(q.get_task("a").unwrap().progress, 42.0);

        // Regressions are ignored.
        q.update_progress("a", 10.0, None);
        assert_eq!(q.get_task("a").unwrap().progress, 42.0);

        // Sub-epsilon changes are swallowed.
        q.update_progress("a", 42.05, None);
        assert_eq!(q.get_task("a").unwrap().progress, 42.0);

        // Out-of-range values are clamped; 100 belongs to completion.
        q.update_progress("a", 250.0, None);
        assert_eq!(q.get_task("a").unwrap().progress, 99.9);
        assert!(q.complete("a", TaskResult::default()));
        assert_eq!(q.get_task("a").unwrap().progress, 100.0);
    }

    #[tokio::test]
    async fn pending_scan_orders_retrying_then_priority() {
        let q = queue(5);
        q.add(task("low", "small", TaskPriority::Low)).unwrap();
        q.add(task("crit", "small", TaskPriority::Critical)).unwrap();
        q.add(task("norm", "medium", TaskPriority::Normal)).unwrap();
        // Push one task through a transient failure so it is retrying.
        q.add(task("retry", "medium", TaskPriority::Low)).unwrap();
        assert!(q.move_to_processing("retry", 0, 5.0));
        assert!(q.fail("retry", "cuda error", Some(FailureKind::Transient)));

        let order: Vec<String> = q.pending_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(order, vec!["retry", "crit", "norm", "low"]);
    }

    #[tokio::test]
    async fn remove_takes_task_from_any_location() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        q.add(task("b", "small", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));

        let removed = q.remove("a").unwrap();
        assert!(removed.was_processing);
        assert_eq!(q.processing_count(), 0);

        let removed = q.remove("b").unwrap();
        assert!(!removed.was_processing);
        assert!(q.remove("b").is_none());
        assert!(q.get_task("b").is_none());
    }

    #[tokio::test]
    async fn manual_retry_requeues_failed_task() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(q.fail("a", "invalid file", Some(FailureKind::InvalidInput)));
        assert_eq!(q.get_task("a").unwrap().status, TaskStatus::Failed);

        assert!(q.retry("a"));
        let requeued = q.get_task("a").unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.error.is_none());

        // Retry of a non-failed task is rejected.
        assert!(!q.retry("a"));
    }

    #[tokio::test]
    async fn stats_track_counters_and_shapes() {
        let q = queue(5);
        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        q.add(task("b", "medium", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(q.complete("a", TaskResult::default()));

        let stats = q.stats();
        assert_eq!(stats.total_pending, 1);
        assert_eq!(stats.total_processing, 0);
        assert_eq!(stats.counters.total_added, 2);
        assert_eq!(stats.counters.total_completed, 1);
        assert_eq!(stats.models["medium"].pending, 1);
    }

    #[tokio::test]
    async fn transitions_publish_updates_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_channel();
        let q = TaskQueue::new(5, bus, Arc::new(RecheckSignal::new()));

        q.add(task("a", "small", TaskPriority::Normal)).unwrap();
        assert!(q.move_to_processing("a", 0, 2.0));
        assert!(q.complete("a", TaskResult::default()));

        let mut statuses = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                SystemEvent::TaskUpdate(update) => statuses.push(update.status),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Pending,
                TaskStatus::Processing,
                TaskStatus::Completed
            ]
        );
    }
}

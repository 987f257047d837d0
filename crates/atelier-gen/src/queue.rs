//! Priority task queue
//!
//! Tasks are ordered by (priority, enqueue sequence): higher bands first,
//! FIFO inside a band so nothing starves behind later arrivals of the same
//! priority. `dequeue` blocks while nothing is ready or while
//! `max_concurrent` tasks are already in progress. A failed task is
//! re-queued after a backoff until it runs out of attempts, then kept as
//! `failed` so its final status can still be queried. Only the most recent
//! `retain_finished` completed or failed tasks are kept.

use atelier_core::{AssetType, GenerationStatus, Priority, TaskId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One asset the caller wants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRequest {
    /// Name used for files, logs and the approval queue
    pub name: String,
    pub prompt: String,
    pub asset_type: AssetType,
    #[serde(default)]
    pub priority: Priority,
    /// Image model override; the provider default otherwise
    #[serde(default)]
    pub model: Option<String>,
}

impl AssetRequest {
    pub fn new(name: &str, prompt: &str, asset_type: AssetType) -> Self {
        Self {
            name: name.to_string(),
            prompt: prompt.to_string(),
            asset_type,
            priority: Priority::default(),
            model: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A queued unit of work
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub id: TaskId,
    pub priority: Priority,
    pub payload: AssetRequest,
    pub status: GenerationStatus,
    /// Times this task has been handed to a worker
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub requeue_backoff: Duration,
    /// Finished tasks kept for status queries before the oldest are dropped
    pub retain_finished: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 3,
            requeue_backoff: Duration::from_secs(2),
            retain_finished: 1024,
        }
    }
}

/// Counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: Priority,
    seq: u64,
    id: TaskId,
}

// BinaryHeap is a max-heap: the "greatest" entry is the most urgent one,
// i.e. the lowest priority band and then the lowest sequence number.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<Entry>,
    /// Requeued tasks waiting out their backoff
    delayed: Vec<(Instant, Entry)>,
    tasks: HashMap<TaskId, GenerationTask>,
    /// Completed and failed tasks, oldest first
    finished: VecDeque<TaskId>,
    next_seq: u64,
    in_progress: usize,
    closed: bool,
}

impl QueueState {
    fn promote_delayed(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.swap_remove(i);
                self.ready.push(entry);
            } else {
                i += 1;
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.in_progress == 0
    }

    fn finish(&mut self, id: TaskId, retain: usize) {
        self.finished.push_back(id);
        while self.finished.len() > retain {
            if let Some(oldest) = self.finished.pop_front() {
                self.tasks.remove(&oldest);
            }
        }
    }

    fn take(&mut self, id: TaskId) -> Option<GenerationTask> {
        let task = self.tasks.get_mut(&id)?;
        task.status = GenerationStatus::Processing;
        task.attempts += 1;
        self.in_progress += 1;
        Some(task.clone())
    }
}

pub struct GenerationQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl GenerationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, payload: AssetRequest) -> TaskId {
        let id = TaskId::new();
        let priority = payload.priority;
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert(
            id,
            GenerationTask {
                id,
                priority,
                payload,
                status: GenerationStatus::Queued,
                attempts: 0,
                last_error: None,
            },
        );
        state.ready.push(Entry { priority, seq, id });
        drop(state);
        self.changed.notify_all();
        tracing::debug!(task_id = %id, priority = %priority, "task enqueued");
        id
    }

    /// Block until a task is ready and a concurrency slot is free. Returns
    /// `None` once the queue is closed.
    pub fn dequeue(&self) -> Option<GenerationTask> {
        self.dequeue_until(None)
    }

    /// As `dequeue`, giving up after `timeout`
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<GenerationTask> {
        self.dequeue_until(Some(Instant::now() + timeout))
    }

    /// Take a ready task without blocking
    pub fn try_dequeue(&self) -> Option<GenerationTask> {
        let mut state = self.lock();
        if state.closed || state.in_progress >= self.config.max_concurrent {
            return None;
        }
        state.promote_delayed(Instant::now());
        let entry = state.ready.pop()?;
        state.take(entry.id)
    }

    fn dequeue_until(&self, deadline: Option<Instant>) -> Option<GenerationTask> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            let now = Instant::now();
            state.promote_delayed(now);

            if state.in_progress < self.config.max_concurrent {
                if let Some(entry) = state.ready.pop() {
                    return state.take(entry.id);
                }
            }

            let mut wake = deadline;
            if let Some(at) = state.next_wakeup() {
                wake = Some(wake.map_or(at, |d| d.min(at)));
            }
            match wake {
                Some(at) => {
                    if deadline.is_some_and(|d| now >= d) {
                        return None;
                    }
                    let wait = at.saturating_duration_since(now).max(Duration::from_millis(1));
                    state = self
                        .changed
                        .wait_timeout(state, wait)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    /// Take up to `max` ready tasks that target the same model as the most
    /// urgent one. Blocks like `dequeue` for the first task only.
    pub fn dequeue_batch(&self, max: usize, default_model: &str) -> Vec<GenerationTask> {
        self.batch_until(None, max, default_model)
    }

    /// As `dequeue_batch`, returning an empty batch after `timeout`
    pub fn dequeue_batch_timeout(&self, max: usize, default_model: &str, timeout: Duration) -> Vec<GenerationTask> {
        self.batch_until(Some(Instant::now() + timeout), max, default_model)
    }

    fn batch_until(&self, deadline: Option<Instant>, max: usize, default_model: &str) -> Vec<GenerationTask> {
        let Some(first) = self.dequeue_until(deadline) else {
            return Vec::new();
        };
        let model = first
            .payload
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string());
        let mut batch = vec![first];

        let mut state = self.lock();
        let mut skipped = Vec::new();
        while batch.len() < max.max(1) {
            let Some(entry) = state.ready.pop() else {
                break;
            };
            let same_model = state
                .tasks
                .get(&entry.id)
                .map(|t| t.payload.model.as_deref().unwrap_or(default_model) == model)
                .unwrap_or(false);
            if same_model {
                if let Some(task) = state.take(entry.id) {
                    batch.push(task);
                }
            } else {
                skipped.push(entry);
            }
        }
        for entry in skipped {
            state.ready.push(entry);
        }
        batch
    }

    pub fn complete(&self, id: TaskId) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(&id) {
            if task.status == GenerationStatus::Processing {
                task.status = GenerationStatus::Completed;
                task.last_error = None;
                state.in_progress = state.in_progress.saturating_sub(1);
                state.finish(id, self.config.retain_finished);
            }
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Record a failure. The task is re-queued after the backoff while it
    /// has attempts left; otherwise it becomes `failed`. Returns the new status.
    pub fn fail(&self, id: TaskId, error: &str) -> GenerationStatus {
        self.finish_failed(id, error, true)
    }

    /// Record a failure that retrying cannot fix
    pub fn fail_permanently(&self, id: TaskId, error: &str) -> GenerationStatus {
        self.finish_failed(id, error, false)
    }

    fn finish_failed(&self, id: TaskId, error: &str, retryable: bool) -> GenerationStatus {
        let mut state = self.lock();
        let now = Instant::now();
        let backoff = self.config.requeue_backoff;
        let max_attempts = self.config.max_attempts.max(1);
        let seq = state.next_seq;

        let Some(task) = state.tasks.get_mut(&id) else {
            return GenerationStatus::Failed;
        };
        if task.status != GenerationStatus::Processing {
            return task.status;
        }
        task.last_error = Some(error.to_string());

        let requeue = retryable && task.attempts < max_attempts;
        let priority = task.priority;
        task.status = if requeue {
            GenerationStatus::Queued
        } else {
            GenerationStatus::Failed
        };
        let status = task.status;
        let attempts = task.attempts;

        state.in_progress = state.in_progress.saturating_sub(1);
        if requeue {
            state.next_seq += 1;
            state.delayed.push((now + backoff, Entry { priority, seq, id }));
            tracing::info!(task_id = %id, attempts, error, "task re-queued");
        } else {
            tracing::warn!(task_id = %id, attempts, error, "task failed");
            state.finish(id, self.config.retain_finished);
        }
        drop(state);
        self.changed.notify_all();
        status
    }

    pub fn status(&self, id: TaskId) -> Option<GenerationStatus> {
        self.lock().tasks.get(&id).map(|t| t.status)
    }

    pub fn task(&self, id: TaskId) -> Option<GenerationTask> {
        self.lock().tasks.get(&id).cloned()
    }

    /// Tasks waiting to run (ready or backing off)
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = QueueStats::default();
        for task in state.tasks.values() {
            match task.status {
                GenerationStatus::Queued => stats.queued += 1,
                GenerationStatus::Processing => stats.processing += 1,
                GenerationStatus::Completed => stats.completed += 1,
                GenerationStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Task ids per status, for reports
    pub fn by_status(&self) -> BTreeMap<String, Vec<TaskId>> {
        let state = self.lock();
        let mut map: BTreeMap<String, Vec<TaskId>> = BTreeMap::new();
        for task in state.tasks.values() {
            map.entry(task.status.to_string()).or_default().push(task.id);
        }
        for ids in map.values_mut() {
            ids.sort();
        }
        map
    }

    /// Nothing ready, nothing backing off, nothing in progress
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Wait up to `timeout` for the queue to drain. Returns whether it did.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    /// Stop handing out work and wake every blocked worker. Tasks still
    /// waiting are marked failed with `reason`.
    pub fn close(&self, reason: &str) -> Vec<TaskId> {
        let mut state = self.lock();
        state.closed = true;
        let mut abandoned: Vec<TaskId> = state.ready.drain().map(|e| e.id).collect();
        abandoned.extend(state.delayed.drain(..).map(|(_, e)| e.id));
        for id in &abandoned {
            if let Some(task) = state.tasks.get_mut(id) {
                task.status = GenerationStatus::Failed;
                task.last_error = Some(reason.to_string());
            }
        }
        // Callers read the abandoned tasks back, so these are not trimmed here
        state.finished.extend(abandoned.iter().copied());
        drop(state);
        self.changed.notify_all();
        abandoned.sort();
        abandoned
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Forget every completed or failed task. Returns how many were dropped.
    pub fn prune_finished(&self) -> usize {
        let mut state = self.lock();
        let finished: Vec<TaskId> = state.finished.drain(..).collect();
        for id in &finished {
            state.tasks.remove(id);
        }
        finished.len()
    }
}

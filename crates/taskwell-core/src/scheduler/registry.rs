use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::debug;

use crate::scheduler::task::{TaskBody, TaskSpec};
use crate::scheduler::types::{
    ExecutionClass, Priority, SchedulerError, TaskId, TaskPayload, TaskStatus,
};

/// The complete in-memory record for one scheduled task.
///
/// Records are owned by the [`TaskRegistry`]; every mutation funnels through
/// it, so bucket membership (pending / running / completed) is always derived
/// from `status` and can never desynchronize.
pub(crate) struct TaskRecord {
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub class: ExecutionClass,
    pub status: TaskStatus,
    pub progress: f32,
    pub progress_text: String,
    pub parent_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub pausable: bool,
    /// The not-yet-started (or re-startable) body.
    pub body: Arc<dyn TaskBody>,
    /// Cancellation signal: value becomes `true` when cancellation is requested.
    pub cancel_tx: watch::Sender<bool>,
    /// Pause signal: value is `true` while the task is paused.
    pub pause_tx: watch::Sender<bool>,
    /// Success payload, present once the task is `Completed` and until taken.
    pub payload: Option<TaskPayload>,
    /// Bumped on every admission; a terminal outcome is only accepted from
    /// the run that owns the current epoch (a pause/resume cycle re-runs the
    /// body, and the stale run's outcome must not finalize the record).
    pub run_epoch: u64,
}

impl TaskRecord {
    fn view(&self) -> TaskView {
        TaskView {
            task_id: self.task_id,
            name: self.name.clone(),
            description: self.description.clone(),
            priority: self.priority,
            class: self.class,
            status: self.status.clone(),
            progress: self.progress,
            progress_text: self.progress_text.clone(),
            parent_id: self.parent_id,
            created_at: self.created_at,
            pausable: self.pausable,
        }
    }
}

/// A read-only snapshot of a task returned to callers and carried by events.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub class: ExecutionClass,
    pub status: TaskStatus,
    pub progress: f32,
    pub progress_text: String,
    pub parent_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub pausable: bool,
}

/// Admission candidate snapshot taken at the start of a dispatch cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub task_id: TaskId,
    pub class: ExecutionClass,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

/// What the dispatch loop hands to the runner after admitting a task.
pub(crate) struct RunBundle {
    pub view: TaskView,
    pub body: Arc<dyn TaskBody>,
    pub cancel_rx: watch::Receiver<bool>,
    pub pause_rx: watch::Receiver<bool>,
    pub epoch: u64,
}

/// Result of a cancellation request.
pub(crate) enum CancelOutcome {
    /// Unknown id or already terminal; nothing to do.
    Ignored,
    /// The task is running; the signal was delivered and the body decides.
    Signalled,
    /// The task was not executing and moved straight to `Cancelled`.
    Finalized(TaskView),
}

/// Centralized, thread-safe store for all task records.
///
/// A `tokio::sync::RwLock<HashMap>` so many readers can observe task state
/// concurrently while mutation stays behind one serialization point. The
/// lock is only ever held across map operations, never across a body await.
#[derive(Clone)]
pub(crate) struct TaskRegistry {
    inner: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
    next_id: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Allocate an id and insert a `Pending` record built from `spec`.
    pub async fn create(&self, spec: TaskSpec) -> Result<TaskView, SchedulerError> {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);

        let record = TaskRecord {
            task_id,
            name: spec.name,
            description: spec.description,
            priority: spec.priority,
            class: spec.class,
            status: TaskStatus::Pending,
            progress: 0.0,
            progress_text: String::new(),
            parent_id: spec.parent,
            created_at: Utc::now(),
            pausable: spec.pausable,
            body: spec.body,
            cancel_tx,
            pause_tx,
            payload: None,
            run_epoch: 0,
        };
        let view = record.view();
        self.insert(record).await?;
        Ok(view)
    }

    /// Insert a record, rejecting a duplicate id.
    pub async fn insert(&self, record: TaskRecord) -> Result<(), SchedulerError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&record.task_id) {
            return Err(SchedulerError::DuplicateTask {
                task_id: record.task_id,
            });
        }
        guard.insert(record.task_id, record);
        Ok(())
    }

    pub async fn view(&self, task_id: TaskId) -> Option<TaskView> {
        self.inner.read().await.get(&task_id).map(TaskRecord::view)
    }

    /// All records, oldest first.
    pub async fn all(&self) -> Vec<TaskView> {
        let guard = self.inner.read().await;
        let mut views: Vec<_> = guard.values().map(TaskRecord::view).collect();
        views.sort_by_key(|v| (v.created_at, v.task_id));
        views
    }

    /// The pending bucket: queued or paused, not yet running, not terminal.
    pub async fn pending(&self) -> Vec<TaskView> {
        self.filtered(|s| !s.is_terminal() && *s != TaskStatus::Running)
            .await
    }

    /// The running bucket.
    pub async fn running(&self) -> Vec<TaskView> {
        self.filtered(|s| *s == TaskStatus::Running).await
    }

    /// The terminal bucket: completed, failed, or cancelled.
    pub async fn completed(&self) -> Vec<TaskView> {
        self.filtered(TaskStatus::is_terminal).await
    }

    async fn filtered(&self, keep: impl Fn(&TaskStatus) -> bool) -> Vec<TaskView> {
        let guard = self.inner.read().await;
        let mut views: Vec<_> = guard
            .values()
            .filter(|r| keep(&r.status))
            .map(TaskRecord::view)
            .collect();
        views.sort_by_key(|v| (v.created_at, v.task_id));
        views
    }

    /// Snapshot of admission candidates in strict evaluation order:
    /// priority descending, then creation time ascending, then id.
    pub async fn schedulable(&self) -> Vec<Candidate> {
        let guard = self.inner.read().await;
        let mut candidates: Vec<_> = guard
            .values()
            .filter(|r| r.status.is_schedulable())
            .map(|r| Candidate {
                task_id: r.task_id,
                class: r.class,
                priority: r.priority,
                created_at: r.created_at,
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.task_id.cmp(&b.task_id))
        });
        candidates
    }

    pub async fn count_running(&self, class: ExecutionClass) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|r| r.status == TaskStatus::Running && r.class == class)
            .count()
    }

    /// Flip an admissible record to `Running` and hand out what the runner
    /// needs. Returns `None` if the record is gone or no longer schedulable
    /// (e.g. it was cancelled between the snapshot and admission).
    pub async fn begin_running(&self, task_id: TaskId) -> Option<RunBundle> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(&task_id)?;
        if !record.status.is_schedulable() {
            return None;
        }
        record.status = TaskStatus::Running;
        record.run_epoch += 1;
        Some(RunBundle {
            view: record.view(),
            body: Arc::clone(&record.body),
            cancel_rx: record.cancel_tx.subscribe(),
            pause_rx: record.pause_tx.subscribe(),
            epoch: record.run_epoch,
        })
    }

    /// Label a refused candidate as still queued. Only writes on the
    /// `Pending -> WaitingOnQueue` edge; a record already labeled stays put.
    pub async fn mark_waiting(&self, task_id: TaskId) {
        let mut guard = self.inner.write().await;
        if let Some(record) = guard.get_mut(&task_id) {
            if record.status == TaskStatus::Pending {
                record.status = TaskStatus::WaitingOnQueue;
            }
        }
    }

    /// Progress write-through from the body's sink. Legal only while the
    /// task is `Running` (or `Paused`, for a body mid-checkpoint).
    pub async fn set_progress(
        &self,
        task_id: TaskId,
        fraction: f32,
        text: String,
    ) -> Option<TaskView> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(&task_id)?;
        if !matches!(record.status, TaskStatus::Running | TaskStatus::Paused) {
            return None;
        }
        record.progress = fraction;
        record.progress_text = text;
        Some(record.view())
    }

    /// Record a terminal outcome from the runner.
    ///
    /// Only a `Running` record can be finalized, and only by the run owning
    /// the current epoch: a record that went `Paused` mid-flight keeps its
    /// status (the outcome is discarded and the body re-runs on resume), a
    /// stale run's late outcome is ignored, and a terminal record is never
    /// overwritten.
    pub async fn record_terminal(
        &self,
        task_id: TaskId,
        epoch: u64,
        status: TaskStatus,
        payload: Option<TaskPayload>,
    ) -> Option<TaskView> {
        debug_assert!(status.is_terminal());
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(&task_id)?;
        if record.status != TaskStatus::Running || record.run_epoch != epoch {
            debug!(
                task_id,
                status = %record.status,
                "ignoring terminal outcome for non-running task"
            );
            return None;
        }
        if status == TaskStatus::Completed {
            record.progress = 1.0;
            record.payload = payload;
        }
        record.status = status;
        Some(record.view())
    }

    /// `Running -> Paused`, only for a pausable record. The status flips
    /// before the signal so the body observes a consistent order.
    pub async fn pause(&self, task_id: TaskId) -> Option<TaskView> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(&task_id)?;
        if record.status != TaskStatus::Running || !record.pausable {
            return None;
        }
        record.status = TaskStatus::Paused;
        record.pause_tx.send_replace(true);
        Some(record.view())
    }

    /// `Paused -> Pending`, re-entering the admission cycle.
    pub async fn resume(&self, task_id: TaskId) -> Option<TaskView> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(&task_id)?;
        if record.status != TaskStatus::Paused {
            return None;
        }
        record.status = TaskStatus::Pending;
        record.pause_tx.send_replace(false);
        Some(record.view())
    }

    /// Deliver a cancellation request.
    pub async fn request_cancel(&self, task_id: TaskId) -> CancelOutcome {
        let mut guard = self.inner.write().await;
        let Some(record) = guard.get_mut(&task_id) else {
            return CancelOutcome::Ignored;
        };
        if record.status.is_terminal() {
            return CancelOutcome::Ignored;
        }
        record.cancel_tx.send_replace(true);
        if record.status == TaskStatus::Running {
            return CancelOutcome::Signalled;
        }
        // Nothing is executing; finalize directly.
        record.status = TaskStatus::Cancelled;
        CancelOutcome::Finalized(record.view())
    }

    /// Cancel everything for shutdown: running records are signalled, the
    /// rest move straight to `Cancelled`. Returns the finalized views.
    pub async fn cancel_all(&self) -> Vec<TaskView> {
        let mut guard = self.inner.write().await;
        let mut finalized = Vec::new();
        for record in guard.values_mut() {
            if record.status.is_terminal() {
                continue;
            }
            record.cancel_tx.send_replace(true);
            if record.status != TaskStatus::Running {
                record.status = TaskStatus::Cancelled;
                finalized.push(record.view());
            }
        }
        finalized
    }

    /// Remove a record. Refused while `Running`; cancel first.
    pub async fn remove(&self, task_id: TaskId) -> bool {
        let mut guard = self.inner.write().await;
        match guard.get(&task_id) {
            Some(record) if record.status != TaskStatus::Running => {
                guard.remove(&task_id);
                true
            }
            _ => false,
        }
    }

    /// Drop every record in the terminal bucket; returns how many went.
    pub async fn clear_completed(&self) -> usize {
        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|_, r| !r.status.is_terminal());
        before - guard.len()
    }

    pub async fn children_of(&self, parent_id: TaskId) -> Vec<TaskView> {
        self.filtered_by(|r| r.parent_id == Some(parent_id)).await
    }

    /// Walk `parent_id` links to the root. Bounded by a visited set so a
    /// malformed cycle terminates at the last sound node.
    pub async fn root_of(&self, task_id: TaskId) -> Option<TaskView> {
        let guard = self.inner.read().await;
        let mut current = guard.get(&task_id)?;
        let mut visited = HashSet::from([current.task_id]);
        while let Some(parent_id) = current.parent_id {
            if !visited.insert(parent_id) {
                debug!(task_id, parent_id, "parent cycle detected; stopping walk");
                break;
            }
            match guard.get(&parent_id) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Some(current.view())
    }

    async fn filtered_by(&self, keep: impl Fn(&TaskRecord) -> bool) -> Vec<TaskView> {
        let guard = self.inner.read().await;
        let mut views: Vec<_> = guard
            .values()
            .filter(|r| keep(r))
            .map(TaskRecord::view)
            .collect();
        views.sort_by_key(|v| (v.created_at, v.task_id));
        views
    }

    /// Consume the success payload of a `Completed` task.
    ///
    /// The status is untouched; taking the payload twice yields `None` the
    /// second time.
    pub async fn take_payload(&self, task_id: TaskId) -> Option<TaskPayload> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(&task_id)?;
        if record.status != TaskStatus::Completed {
            return None;
        }
        record.payload.take()
    }
}

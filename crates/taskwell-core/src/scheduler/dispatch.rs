use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::scheduler::admission::{Admission, AdmissionArbiter};
use crate::scheduler::events::{EventBus, TaskEvent};
use crate::scheduler::registry::{CancelOutcome, RunBundle, TaskRegistry, TaskView};
use crate::scheduler::runner::Runner;
use crate::scheduler::task::TaskSpec;
use crate::scheduler::types::{ExecutionClass, SchedulerError, TaskId, TaskPayload};

/// The scheduling core's public surface.
///
/// `start` spawns the dispatch loop and the affinity lane worker and returns
/// a cloneable handle; every clone talks to the same registry, arbiter, and
/// event bus.
///
/// # Usage
///
/// ```rust,ignore
/// let scheduler = Scheduler::start(SchedulerConfig::default());
/// let id = scheduler.schedule(TaskSpec::from_fn("index", |ctx| async move {
///     ctx.progress.report(1.0, "done").await;
///     TaskOutcome::ok()
/// })).await?;
/// ```
#[derive(Clone)]
pub struct Scheduler {
    registry: TaskRegistry,
    arbiter: AdmissionArbiter,
    events: EventBus,
    runner: Runner,
    /// Wakes the dispatch loop outside its tick; permits coalesce so
    /// concurrent triggers cost one cycle.
    trigger: Arc<Notify>,
    lane_tx: mpsc::UnboundedSender<RunBundle>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    /// Start the scheduler: spawns the dispatch loop and the affinity lane.
    pub fn start(config: SchedulerConfig) -> Self {
        let registry = TaskRegistry::new();
        let events = EventBus::new(config.event_capacity);
        let arbiter = AdmissionArbiter::new(config.max_parallel_tasks);
        let runner = Runner::new(registry.clone(), events.clone());
        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = Self {
            registry,
            arbiter,
            events,
            runner,
            trigger: Arc::new(Notify::new()),
            lane_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        };

        let lane_runner = scheduler.runner.clone();
        let lane_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            Self::affinity_lane(lane_rx, lane_runner, lane_shutdown).await;
        });

        let loop_scheduler = scheduler.clone();
        let tick = config.tick_interval();
        tokio::spawn(async move {
            loop_scheduler.dispatch_loop(shutdown_rx, tick).await;
        });

        scheduler
    }

    // ── Dispatch loop ────────────────────────────────────────────────────────

    async fn dispatch_loop(self, mut shutdown_rx: watch::Receiver<bool>, tick: Duration) {
        info!(
            tick_ms = tick.as_millis() as u64,
            max_parallel = self.arbiter.max_parallel(),
            "dispatch loop started"
        );
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {}
                _ = self.trigger.notified() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }
            // The loop's liveness is an invariant: a cycle that blows up is
            // logged and the next tick proceeds.
            if let Err(panic) = std::panic::AssertUnwindSafe(self.run_cycle())
                .catch_unwind()
                .await
            {
                error!(?panic, "dispatch cycle panicked; continuing");
            }
        }
        info!("dispatch loop stopped");
    }

    /// One dispatch cycle: snapshot schedulable records in admission order,
    /// admit what fits, label the rest as still queued.
    async fn run_cycle(&self) {
        let candidates = self.registry.schedulable().await;
        if candidates.is_empty() {
            return;
        }
        let mut running_parallel = self.registry.count_running(ExecutionClass::Parallel).await;

        for candidate in candidates {
            match self.arbiter.evaluate(candidate.class, running_parallel) {
                Admission::Admitted(permit) => {
                    // Flip to Running before the body starts so a concurrent
                    // cycle can never double-admit. `None` means the record
                    // was cancelled or removed since the snapshot; a permit
                    // acquired for it releases right here.
                    let Some(bundle) = self.registry.begin_running(candidate.task_id).await else {
                        continue;
                    };
                    if candidate.class == ExecutionClass::Parallel {
                        running_parallel += 1;
                    }
                    debug!(
                        task_id = candidate.task_id,
                        class = %candidate.class,
                        "task admitted"
                    );
                    self.events.publish(TaskEvent::Started(bundle.view.clone()));
                    match candidate.class {
                        ExecutionClass::Affinity => {
                            if let Err(send_err) = self.lane_tx.send(bundle) {
                                warn!(
                                    task_id = candidate.task_id,
                                    "affinity lane closed; cancelling task"
                                );
                                self.runner.cancel_unstarted(send_err.0).await;
                            }
                        }
                        _ => {
                            let runner = self.runner.clone();
                            tokio::spawn(async move {
                                runner.run_one(bundle, permit).await;
                            });
                        }
                    }
                }
                Admission::Refused => {
                    self.registry.mark_waiting(candidate.task_id).await;
                }
            }
        }
    }

    /// The single serialized execution lane for `Affinity` tasks: admitted
    /// work runs one-at-a-time in arrival order. On shutdown the queue is
    /// drained and everything still unstarted is finalized as cancelled.
    async fn affinity_lane(
        mut rx: mpsc::UnboundedReceiver<RunBundle>,
        runner: Runner,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                job = rx.recv() => {
                    match job {
                        Some(bundle) => runner.run_one(bundle, None).await,
                        None => break,
                    }
                }
            }
        }
        rx.close();
        while let Ok(bundle) = rx.try_recv() {
            runner.cancel_unstarted(bundle).await;
        }
        debug!("affinity lane stopped");
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Register a task for execution and trigger a dispatch cycle.
    ///
    /// Rejects a spec with an empty name, and everything once the scheduler
    /// is shut down.
    pub async fn schedule(&self, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        if *self.shutdown_tx.borrow() {
            return Err(SchedulerError::ShuttingDown);
        }
        if spec.name.trim().is_empty() {
            return Err(SchedulerError::InvalidTask {
                reason: "task name must not be empty".to_owned(),
            });
        }
        let view = self.registry.create(spec).await?;
        debug!(task_id = view.task_id, name = %view.name, "task scheduled");
        self.trigger.notify_one();
        Ok(view.task_id)
    }

    /// Request best-effort cancellation.
    ///
    /// A running body must observe the signal itself; a task that has not
    /// started is finalized immediately. Returns `false` for an unknown or
    /// already-terminal task.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        match self.registry.request_cancel(task_id).await {
            CancelOutcome::Ignored => false,
            CancelOutcome::Signalled => {
                info!(task_id, "cancellation requested");
                true
            }
            CancelOutcome::Finalized(view) => {
                info!(task_id, "task cancelled before start");
                self.events.publish(TaskEvent::Cancelled(view));
                true
            }
        }
    }

    /// Pause a running, pausable task. The body is responsible for honoring
    /// the signal; the scheduler never suspends a thread.
    pub async fn pause(&self, task_id: TaskId) -> bool {
        if *self.shutdown_tx.borrow() {
            return false;
        }
        match self.registry.pause(task_id).await {
            Some(_) => {
                info!(task_id, "task paused");
                true
            }
            None => false,
        }
    }

    /// Resume a paused task: it re-enters the admission cycle as `Pending`.
    pub async fn resume(&self, task_id: TaskId) -> bool {
        if *self.shutdown_tx.borrow() {
            return false;
        }
        match self.registry.resume(task_id).await {
            Some(_) => {
                info!(task_id, "task resumed");
                self.trigger.notify_one();
                true
            }
            None => false,
        }
    }

    /// Remove a record from the registry. Refused while `Running`.
    pub async fn remove(&self, task_id: TaskId) -> bool {
        self.registry.remove(task_id).await
    }

    /// Drop every record in the terminal bucket; returns how many went.
    pub async fn clear_completed(&self) -> usize {
        self.registry.clear_completed().await
    }

    /// Shut down: cancel every non-terminal task, stop the dispatch loop and
    /// the affinity lane. Idempotent; running bodies finish cooperatively.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("scheduler shutting down");
        for view in self.registry.cancel_all().await {
            self.events.publish(TaskEvent::Cancelled(view));
        }
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub async fn task(&self, task_id: TaskId) -> Option<TaskView> {
        self.registry.view(task_id).await
    }

    pub async fn all_tasks(&self) -> Vec<TaskView> {
        self.registry.all().await
    }

    pub async fn pending_tasks(&self) -> Vec<TaskView> {
        self.registry.pending().await
    }

    pub async fn running_tasks(&self) -> Vec<TaskView> {
        self.registry.running().await
    }

    pub async fn completed_tasks(&self) -> Vec<TaskView> {
        self.registry.completed().await
    }

    /// Direct children of `parent_id`, oldest first.
    pub async fn subtasks(&self, parent_id: TaskId) -> Vec<TaskView> {
        self.registry.children_of(parent_id).await
    }

    /// Walk parent links to the root of `task_id`'s hierarchy.
    pub async fn root_task(&self, task_id: TaskId) -> Option<TaskView> {
        self.registry.root_of(task_id).await
    }

    /// Consume the success payload of a completed task. The terminal status
    /// is untouched; a second take yields `None`.
    pub async fn take_result(&self, task_id: TaskId) -> Option<TaskPayload> {
        self.registry.take_payload(task_id).await
    }

    /// Subscribe to lifecycle events from this point onward.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn max_parallel_tasks(&self) -> usize {
        self.arbiter.max_parallel()
    }

    /// Adjust the parallel bound at runtime. Lowering it never preempts
    /// running tasks; raising it takes effect on the next cycle.
    pub fn set_max_parallel_tasks(&self, max_parallel: usize) {
        self.arbiter.set_max_parallel(max_parallel);
        self.trigger.notify_one();
    }
}

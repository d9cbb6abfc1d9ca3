use tracing::{debug, info, warn};

use crate::scheduler::admission::ExclusivePermit;
use crate::scheduler::events::{EventBus, TaskEvent};
use crate::scheduler::registry::{RunBundle, TaskRegistry};
use crate::scheduler::task::{ProgressSink, TaskContext};
use crate::scheduler::types::{TaskOutcome, TaskStatus};

/// Runs one admitted task body to a terminal state.
///
/// The body executes as its own tokio task so that a panic is contained as a
/// `JoinError` instead of taking the caller down; the terminal transition
/// and its event fire on every path, and the exclusivity permit (when
/// present) is released by RAII no matter how the body exits.
#[derive(Clone)]
pub(crate) struct Runner {
    registry: TaskRegistry,
    events: EventBus,
}

impl Runner {
    pub fn new(registry: TaskRegistry, events: EventBus) -> Self {
        Self { registry, events }
    }

    pub async fn run_one(&self, bundle: RunBundle, permit: Option<ExclusivePermit>) {
        let RunBundle {
            view,
            body,
            cancel_rx,
            pause_rx,
            epoch,
        } = bundle;
        let task_id = view.task_id;

        let ctx = TaskContext::new(
            ProgressSink::new(self.registry.clone(), self.events.clone(), task_id),
            cancel_rx.clone(),
            pause_rx,
        );
        let handle = tokio::spawn(async move { body.run(ctx).await });

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                warn!(task_id, error = %join_err, "task body panicked");
                TaskOutcome::fail(format!("task body panicked: {join_err}"))
            }
        };

        // Cancellation wins over failure: a body that unwound because it
        // observed the signal is cancelled, not failed.
        let cancel_requested = *cancel_rx.borrow();
        let (status, payload) = if outcome.success {
            (TaskStatus::Completed, outcome.payload)
        } else if cancel_requested {
            (TaskStatus::Cancelled, None)
        } else {
            let error = outcome.error.unwrap_or_else(|| "task failed".to_owned());
            (TaskStatus::Failed { error }, None)
        };

        match self
            .registry
            .record_terminal(task_id, epoch, status, payload)
            .await
        {
            Some(view) => match view.status.clone() {
                TaskStatus::Completed => {
                    info!(task_id, "task completed");
                    self.events.publish(TaskEvent::Completed(view));
                }
                TaskStatus::Cancelled => {
                    info!(task_id, "task cancelled");
                    self.events.publish(TaskEvent::Cancelled(view));
                }
                TaskStatus::Failed { error } => {
                    warn!(task_id, error = %error, "task failed");
                    self.events.publish(TaskEvent::Failed(view));
                }
                _ => {}
            },
            // Paused mid-flight: the record keeps its status and the body
            // re-runs on resume.
            None => debug!(task_id, "outcome discarded for non-running task"),
        }

        drop(permit);
    }

    /// Finalize an admitted-but-never-started task as cancelled (shutdown
    /// drained it out of the affinity lane before it ran).
    pub async fn cancel_unstarted(&self, bundle: RunBundle) {
        let task_id = bundle.view.task_id;
        if let Some(view) = self
            .registry
            .record_terminal(task_id, bundle.epoch, TaskStatus::Cancelled, None)
            .await
        {
            info!(task_id, "task cancelled before start");
            self.events.publish(TaskEvent::Cancelled(view));
        }
    }
}

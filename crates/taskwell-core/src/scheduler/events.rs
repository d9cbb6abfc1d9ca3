use tokio::sync::broadcast;

use crate::scheduler::registry::TaskView;

/// Lifecycle notification delivered to subscribers.
///
/// Every variant carries a snapshot of the record at the time the transition
/// was made; `Progress` additionally carries the reported payload.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The task was admitted and handed to its execution context.
    Started(TaskView),
    /// The running body reported progress.
    Progress {
        task: TaskView,
        fraction: f32,
        text: String,
    },
    /// The body returned a success outcome.
    Completed(TaskView),
    /// The body returned a failure outcome or panicked.
    Failed(TaskView),
    /// The task was cancelled, before or during execution.
    Cancelled(TaskView),
}

impl TaskEvent {
    /// The snapshot carried by this event.
    pub fn task(&self) -> &TaskView {
        match self {
            TaskEvent::Started(t)
            | TaskEvent::Completed(t)
            | TaskEvent::Failed(t)
            | TaskEvent::Cancelled(t) => t,
            TaskEvent::Progress { task, .. } => task,
        }
    }
}

/// Broadcast fan-out of [`TaskEvent`]s.
///
/// The scheduler never depends on any specific consumer: publishing to a bus
/// with no subscribers (or with lagging subscribers) is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to lifecycle events from this point onward.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: TaskEvent) {
        // No subscribers is fine; the scheduler does not care who listens.
        let _ = self.tx.send(event);
    }
}

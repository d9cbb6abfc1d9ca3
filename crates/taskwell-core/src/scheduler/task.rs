use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::scheduler::events::{EventBus, TaskEvent};
use crate::scheduler::registry::TaskRegistry;
use crate::scheduler::types::{ExecutionClass, Priority, TaskId, TaskOutcome};

/// The execution contract a collaborator implements to submit work.
///
/// `run` is invoked by the scheduler once the task is admitted. A pausable
/// body that honors a pause signal should checkpoint and return; it will be
/// invoked again when the task is resumed, so implementations must tolerate
/// repeated calls.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome;
}

/// Type alias for the boxed asynchronous work closure used by
/// [`TaskSpec::from_fn`].
pub type BodyFn = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, TaskOutcome> + Send + Sync>;

/// Adapter wrapping a plain async closure as a [`TaskBody`].
pub(crate) struct FnBody {
    work: BodyFn,
}

#[async_trait]
impl TaskBody for FnBody {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        (self.work)(ctx).await
    }
}

/// Everything a running body is handed: the progress sink plus the
/// cancellation and pause signals it must observe.
pub struct TaskContext {
    /// The only legal path for progress mutation.
    pub progress: ProgressSink,
    cancel_rx: watch::Receiver<bool>,
    pause_rx: watch::Receiver<bool>,
}

impl TaskContext {
    pub(crate) fn new(
        progress: ProgressSink,
        cancel_rx: watch::Receiver<bool>,
        pause_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            progress,
            cancel_rx,
            pause_rx,
        }
    }

    /// Poll whether cancellation has been requested for this task.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Wait until cancellation is requested.
    ///
    /// Also resolves if the scheduler side of the channel is dropped, so a
    /// body never waits on a dead scheduler.
    pub async fn cancelled(&mut self) {
        while !*self.cancel_rx.borrow() {
            if self.cancel_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Poll whether a pause has been requested for this task.
    pub fn is_paused(&self) -> bool {
        *self.pause_rx.borrow()
    }

    /// Wait for the pause signal to change; returns the new value.
    pub async fn pause_changed(&mut self) -> bool {
        if self.pause_rx.changed().await.is_err() {
            return *self.pause_rx.borrow();
        }
        *self.pause_rx.borrow()
    }

    /// A clone of the raw cancellation receiver, for bodies that select over
    /// it together with their own channels.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

/// Progress-reporting sink handed to a running body.
///
/// Each report writes through the registry and publishes a
/// [`TaskEvent::Progress`]; fractions are clamped to `[0.0, 1.0]`.
#[derive(Clone)]
pub struct ProgressSink {
    registry: TaskRegistry,
    events: EventBus,
    task_id: TaskId,
}

impl ProgressSink {
    pub(crate) fn new(registry: TaskRegistry, events: EventBus, task_id: TaskId) -> Self {
        Self {
            registry,
            events,
            task_id,
        }
    }

    /// Report progress as a fraction in `[0.0, 1.0]` plus a display string.
    pub async fn report(&self, fraction: f32, text: impl Into<String>) {
        let fraction = fraction.clamp(0.0, 1.0);
        let text = text.into();
        if let Some(view) = self
            .registry
            .set_progress(self.task_id, fraction, text.clone())
            .await
        {
            self.events.publish(TaskEvent::Progress {
                task: view,
                fraction,
                text,
            });
        }
    }
}

/// Description of one schedulable unit of work, built fluently and submitted
/// via [`Scheduler::schedule`].
///
/// [`Scheduler::schedule`]: crate::scheduler::dispatch::Scheduler::schedule
pub struct TaskSpec {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) priority: Priority,
    pub(crate) class: ExecutionClass,
    pub(crate) pausable: bool,
    pub(crate) parent: Option<TaskId>,
    pub(crate) body: Arc<dyn TaskBody>,
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("class", &self.class)
            .field("pausable", &self.pausable)
            .field("parent", &self.parent)
            .finish()
    }
}

impl TaskSpec {
    /// Build a spec around a [`TaskBody`] implementation.
    ///
    /// Defaults: `Normal` priority, `Parallel` class, not pausable, no parent.
    pub fn new(name: impl Into<String>, body: impl TaskBody + 'static) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority: Priority::Normal,
            class: ExecutionClass::Parallel,
            pausable: false,
            parent: None,
            body: Arc::new(body),
        }
    }

    /// Build a spec from a plain async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskOutcome> + Send + 'static,
    {
        let work: BodyFn = Arc::new(move |ctx| Box::pin(work(ctx)));
        Self::new(name, FnBody { work })
    }

    /// Attach display metadata.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the admission priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the concurrency class.
    pub fn class(mut self, class: ExecutionClass) -> Self {
        self.class = class;
        self
    }

    /// Declare whether the body honors the pause signal.
    pub fn pausable(mut self, pausable: bool) -> Self {
        self.pausable = pausable;
        self
    }

    /// Register this task as a child of `parent`.
    ///
    /// The back-reference is used for hierarchy queries only; a parent never
    /// owns its children's lifetime.
    pub fn child_of(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }
}

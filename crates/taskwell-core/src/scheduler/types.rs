use std::any::Any;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a scheduled task.
pub type TaskId = u64;

/// Admission priority. Higher priorities are evaluated first; among equal
/// priorities admission is strict FIFO by creation time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The concurrency policy a task declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ExecutionClass {
    /// Runs alongside other `Parallel` tasks, bounded by `max_parallel_tasks`.
    Parallel,
    /// Runs alone: at most one `Exclusive` task is running process-wide.
    Exclusive,
    /// Runs serialized, in submission order, on the single affinity lane.
    Affinity,
}

/// High-level lifecycle state of a task managed by the [`Scheduler`].
///
/// [`Scheduler`]: crate::scheduler::dispatch::Scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum TaskStatus {
    /// Accepted and waiting for its first admission evaluation.
    Pending,
    /// Evaluated at least once and refused admission; still queued.
    WaitingOnQueue,
    /// Admitted; the body is executing (or its start is in flight).
    Running,
    /// Externally paused; re-enters the admission cycle on resume.
    Paused,
    /// The body returned a success outcome.
    Completed,
    /// The body returned a failure outcome, or its execution panicked.
    Failed { error: String },
    /// The body observed cancellation and unwound.
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` if the task has reached a terminal state.
    ///
    /// Terminal states are stable: the registry refuses any further
    /// transition once one is recorded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Returns `true` if the task is eligible for admission evaluation.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::WaitingOnQueue)
    }
}

/// Opaque success payload returned by a task body.
///
/// Variants use `Arc` so that handing a payload between the runner, the
/// registry, and a consumer never copies large values.
#[derive(Debug, Clone, Default)]
pub enum TaskPayload {
    #[default]
    None,
    /// UTF-8 text.
    Text(Arc<str>),
    /// Structured JSON metadata.
    Json(serde_json::Value),
    /// Escape hatch for arbitrary typed data.
    Any(Arc<dyn Any + Send + Sync>),
}

impl TaskPayload {
    pub fn text(s: impl Into<Arc<str>>) -> Self {
        TaskPayload::Text(s.into())
    }

    pub fn json(v: impl Into<serde_json::Value>) -> Self {
        TaskPayload::Json(v.into())
    }

    pub fn to_str(&self) -> Option<&str> {
        match self {
            TaskPayload::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_json<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        match self {
            TaskPayload::Json(v) => serde_json::from_value(v.clone()).ok(),
            _ => None,
        }
    }
}

impl From<&str> for TaskPayload {
    fn from(s: &str) -> Self {
        TaskPayload::Text(Arc::from(s))
    }
}

impl From<serde_json::Value> for TaskPayload {
    fn from(v: serde_json::Value) -> Self {
        TaskPayload::Json(v)
    }
}

/// What a task body reports back when it returns.
///
/// Expected failures are returned as `success: false` with an error message;
/// a panic is reserved for infrastructure-level failure and is mapped by the
/// runner.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub success: bool,
    pub payload: Option<TaskPayload>,
    pub error: Option<String>,
}

impl TaskOutcome {
    /// Successful outcome with no payload.
    pub fn ok() -> Self {
        Self {
            success: true,
            payload: None,
            error: None,
        }
    }

    /// Successful outcome carrying a payload.
    pub fn ok_with(payload: impl Into<TaskPayload>) -> Self {
        Self {
            success: true,
            payload: Some(payload.into()),
            error: None,
        }
    }

    /// Failed outcome with an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// Errors reported synchronously at the scheduler facade boundary.
///
/// Everything else (body failures, cancellations) is reported asynchronously
/// through task status and the event bus.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// The submitted spec is malformed (e.g. empty name).
    #[error("invalid task: {reason}")]
    InvalidTask { reason: String },

    /// A record with this id is already registered.
    #[error("duplicate task id: {task_id}")]
    DuplicateTask { task_id: TaskId },

    /// The scheduler has been shut down and accepts no new work.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed { error: "x".into() }.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn schedulable_states() {
        assert!(TaskStatus::Pending.is_schedulable());
        assert!(TaskStatus::WaitingOnQueue.is_schedulable());
        assert!(!TaskStatus::Running.is_schedulable());
        assert!(!TaskStatus::Paused.is_schedulable());
    }
}

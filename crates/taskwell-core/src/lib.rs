mod scheduler;

pub mod config;

pub use config::SchedulerConfig;
pub use scheduler::admission::{AdmissionArbiter, ExclusivePermit};
pub use scheduler::dispatch::Scheduler;
pub use scheduler::events::TaskEvent;
pub use scheduler::registry::TaskView;
pub use scheduler::task::{ProgressSink, TaskBody, TaskContext, TaskSpec};
pub use scheduler::types::{
    ExecutionClass, Priority, SchedulerError, TaskId, TaskOutcome, TaskPayload, TaskStatus,
};

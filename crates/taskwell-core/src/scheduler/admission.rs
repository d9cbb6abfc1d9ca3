use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::scheduler::types::ExecutionClass;

/// RAII guard for the process-wide exclusivity lock.
///
/// The dispatch loop acquires it at admission time and hands it to the
/// runner; dropping it on any exit path (success, failure, cancellation,
/// panic) releases the lock.
pub struct ExclusivePermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for ExclusivePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusivePermit").finish()
    }
}

/// Admission decision for one candidate.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Admit; for `Exclusive` tasks the acquired lock travels with the task.
    Admitted(Option<ExclusivePermit>),
    /// No capacity in the candidate's class this cycle.
    Refused,
}

/// Decides whether a pending task may transition to running.
///
/// The exclusivity class is gated by a one-permit semaphore so the admission
/// check and the lock acquisition are a single operation; the parallel class
/// is gated by a count-versus-bound check against a snapshot the dispatch
/// loop maintains within its cycle; the affinity class is always admitted
/// because the lane itself serializes.
#[derive(Debug, Clone)]
pub struct AdmissionArbiter {
    exclusive: Arc<Semaphore>,
    max_parallel: Arc<AtomicUsize>,
}

impl AdmissionArbiter {
    /// `max_parallel = 0` resolves to the host's available parallelism.
    pub fn new(max_parallel: usize) -> Self {
        Self {
            exclusive: Arc::new(Semaphore::new(1)),
            max_parallel: Arc::new(AtomicUsize::new(resolve_parallelism(max_parallel))),
        }
    }

    /// Current bound on concurrently running `Parallel` tasks.
    pub fn max_parallel(&self) -> usize {
        self.max_parallel.load(Ordering::Relaxed)
    }

    /// Adjust the parallel bound at runtime. Lowering it never preempts
    /// already-running tasks; it only throttles future admissions.
    pub fn set_max_parallel(&self, max_parallel: usize) {
        self.max_parallel
            .store(resolve_parallelism(max_parallel), Ordering::Relaxed);
    }

    pub(crate) fn evaluate(&self, class: ExecutionClass, running_parallel: usize) -> Admission {
        match class {
            ExecutionClass::Parallel => {
                if running_parallel < self.max_parallel() {
                    Admission::Admitted(None)
                } else {
                    Admission::Refused
                }
            }
            ExecutionClass::Exclusive => match Arc::clone(&self.exclusive).try_acquire_owned() {
                Ok(permit) => Admission::Admitted(Some(ExclusivePermit { permit })),
                Err(_) => Admission::Refused,
            },
            ExecutionClass::Affinity => Admission::Admitted(None),
        }
    }
}

/// Resolve a configured bound, where 0 means "use the host's logical cores".
fn resolve_parallelism(configured: usize) -> usize {
    if configured == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_permit_is_the_lock() {
        let arbiter = AdmissionArbiter::new(2);
        let first = arbiter.evaluate(ExecutionClass::Exclusive, 0);
        let Admission::Admitted(Some(permit)) = first else {
            panic!("first exclusive admission should hold the lock");
        };
        assert!(matches!(
            arbiter.evaluate(ExecutionClass::Exclusive, 0),
            Admission::Refused
        ));
        drop(permit);
        assert!(matches!(
            arbiter.evaluate(ExecutionClass::Exclusive, 0),
            Admission::Admitted(Some(_))
        ));
    }

    #[test]
    fn parallel_bound_checked_against_snapshot() {
        let arbiter = AdmissionArbiter::new(2);
        assert!(matches!(
            arbiter.evaluate(ExecutionClass::Parallel, 1),
            Admission::Admitted(None)
        ));
        assert!(matches!(
            arbiter.evaluate(ExecutionClass::Parallel, 2),
            Admission::Refused
        ));
    }

    #[test]
    fn affinity_always_admitted() {
        let arbiter = AdmissionArbiter::new(1);
        for _ in 0..8 {
            assert!(matches!(
                arbiter.evaluate(ExecutionClass::Affinity, usize::MAX),
                Admission::Admitted(None)
            ));
        }
    }

    #[test]
    fn zero_resolves_to_host_parallelism() {
        let arbiter = AdmissionArbiter::new(0);
        assert!(arbiter.max_parallel() > 0);
        arbiter.set_max_parallel(3);
        assert_eq!(arbiter.max_parallel(), 3);
    }
}

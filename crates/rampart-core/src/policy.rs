//! Contracts a resilience collaborator implements to take part in a chain.
//!
//! Adapters are cheap handles. All mutable state (counters, permits, tokens)
//! lives in the collaborator they point at, never in the decorated unit.

use rampart_error::CompositionError;

use crate::action::{Action, AsyncAction};
use crate::scheduler::{Scheduler, SchedulerRole};

/// Decorates synchronous work units.
pub trait Policy: Send + Sync {
    /// Name used in logs and in `policies()` listings
    fn name(&self) -> &str;

    /// Wraps `unit`. The returned action must invoke `unit` at most once per
    /// call unless the policy is explicitly a re-invoking one (retry).
    fn decorate<I, T>(&self, unit: Action<I, T>) -> Action<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static;
}

/// Decorates asynchronous work units.
pub trait AsyncPolicy: Send + Sync {
    /// Name used in logs and in `policies()` listings
    fn name(&self) -> &str;

    /// Scheduler role this policy needs on an asynchronous chain, if any.
    ///
    /// The builder records the scheduler under this role and checks it
    /// against the roles already bound before calling
    /// [`decorate_async`](AsyncPolicy::decorate_async).
    fn scheduler_role(&self) -> Option<SchedulerRole> {
        None
    }

    /// Wraps `unit`, failing at wiring time if a required scheduler is absent.
    fn decorate_async<I, T>(
        &self,
        unit: AsyncAction<I, T>,
        scheduler: Option<&Scheduler>,
    ) -> Result<AsyncAction<I, T>, CompositionError>
    where
        I: Clone + Send + 'static,
        T: Send + 'static;
}

/// Moves synchronous work onto a worker pool, bridging a synchronous chain
/// into an asynchronous one.
pub trait Offload: Send + Sync {
    /// Name used in logs and in `policies()` listings
    fn name(&self) -> &str;

    /// The pool the work runs on
    fn work_scheduler(&self) -> &Scheduler;

    /// Wraps `unit` so that invoking it submits the work and returns at once.
    fn offload<I, T>(&self, unit: Action<I, T>) -> AsyncAction<I, T>
    where
        I: Send + 'static,
        T: Send + 'static;
}

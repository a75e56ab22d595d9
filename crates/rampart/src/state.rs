//! Bookkeeping a builder carries between modifiers.

use rampart_core::{Scheduler, SchedulerRole};
use rampart_error::CompositionError;

/// Roles that must never share a scheduler within one chain.
const EXCLUSIVE: [(SchedulerRole, SchedulerRole); 1] = [(SchedulerRole::Work, SchedulerRole::Timeout)];

fn exclusive(a: SchedulerRole, b: SchedulerRole) -> bool {
    EXCLUSIVE
        .iter()
        .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
}

/// Applied policies, innermost first, and the schedulers they bound.
#[derive(Debug, Default, Clone)]
pub(crate) struct Composition {
    policies: Vec<String>,
    schedulers: Vec<(SchedulerRole, Scheduler)>,
}

impl Composition {
    pub(crate) fn record(&mut self, kind: &str, name: &str) {
        tracing::debug!(policy = kind, name, layer = self.policies.len(), "Applying decorator");
        self.policies.push(format!("{}({})", kind, name));
    }

    /// Binds `scheduler` to `role`, rejecting it if it already plays a role
    /// that must stay apart from this one.
    pub(crate) fn bind(&mut self, role: SchedulerRole, scheduler: &Scheduler) -> Result<(), CompositionError> {
        let conflict = self
            .schedulers
            .iter()
            .find(|(bound, existing)| existing.same_as(scheduler) && exclusive(*bound, role));
        if let Some((bound, _)) = conflict {
            tracing::warn!(
                scheduler = %scheduler.name(),
                bound = %bound,
                requested = %role,
                "Rejecting shared scheduler"
            );
            return Err(CompositionError::SharedScheduler {
                scheduler: scheduler.name().to_string(),
                bound: bound.as_str(),
                requested: role.as_str(),
            });
        }
        self.schedulers.push((role, scheduler.clone()));
        Ok(())
    }

    /// Binds the pool a synchronous chain is offloaded to.
    ///
    /// Sync modifiers bind no schedulers, so this is always the chain's
    /// first binding and cannot conflict.
    pub(crate) fn bind_work(&mut self, scheduler: &Scheduler) {
        debug_assert!(self.schedulers.is_empty());
        self.schedulers.push((SchedulerRole::Work, scheduler.clone()));
    }

    pub(crate) fn policies(&self) -> &[String] {
        &self.policies
    }

    pub(crate) fn schedulers(&self) -> impl Iterator<Item = (SchedulerRole, &Scheduler)> {
        self.schedulers.iter().map(|(role, scheduler)| (*role, scheduler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_and_timeout_must_differ() {
        let pool = Scheduler::dedicated("pool", 1).unwrap();
        let mut state = Composition::default();
        state.bind(SchedulerRole::Work, &pool).unwrap();

        let err = state.bind(SchedulerRole::Timeout, &pool.clone()).unwrap_err();
        assert_eq!(
            err,
            CompositionError::SharedScheduler {
                scheduler: "pool".into(),
                bound: "work",
                requested: "timeout",
            }
        );
    }

    #[test]
    fn test_retry_delay_may_share() {
        let shared = Scheduler::dedicated("shared", 1).unwrap();
        let mut state = Composition::default();
        state.bind(SchedulerRole::Timeout, &shared).unwrap();
        state.bind(SchedulerRole::RetryDelay, &shared).unwrap();

        assert_eq!(state.schedulers().count(), 2);
    }

    #[test]
    fn test_records_in_order() {
        let mut state = Composition::default();
        state.record("CircuitBreaker", "backend");
        state.record("Retry", "backend");
        assert_eq!(state.policies(), ["CircuitBreaker(backend)", "Retry(backend)"]);
    }

    #[test]
    fn test_bound_work_conflicts_with_timeout() {
        let pool = Scheduler::dedicated("pool", 1).unwrap();
        let mut state = Composition::default();
        state.bind_work(&pool);

        assert_eq!(state.schedulers().next().map(|(role, _)| role), Some(SchedulerRole::Work));
        assert!(state.bind(SchedulerRole::Timeout, &pool).is_err());
    }
}

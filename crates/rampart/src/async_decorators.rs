//! The asynchronous decorator builder.
//!
//! Policies here wrap a unit returning a [`Pending`] result. Modifiers that
//! need a scheduler take it explicitly and fail at wiring time when it is
//! missing or already bound to a role it must stay apart from.

use std::error::Error as StdError;
use std::fmt;

use rampart_core::{AsyncAction, AsyncPolicy, Pending, Scheduler, SchedulerRole};
use rampart_error::{CompositionError, ErrorClass};
use rampart_resilience::{Bulkhead, CircuitBreaker, RateLimiter, Retry, TimeLimiter};

use crate::fallback::{FallbackDispatcher, ResultFallback};
use crate::state::Composition;

/// Builder for an asynchronous decorator chain.
#[must_use = "a builder does nothing until a terminal such as `decorate` or `get` is called"]
pub struct AsyncDecorate<I, T> {
    unit: AsyncAction<I, T>,
    state: Composition,
}

impl<I, T> AsyncDecorate<I, T>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
{
    pub(crate) fn new(unit: AsyncAction<I, T>, state: Composition) -> Self {
        Self { unit, state }
    }

    /// Circuit breaker around the chain so far; the outcome is recorded
    /// when the pending result settles.
    pub fn with_circuit_breaker(mut self, breaker: &CircuitBreaker) -> Self {
        self.state.record("CircuitBreaker", breaker.name());
        self.unit = breaker.decorate_pending(self.unit);
        self
    }

    /// Semaphore bulkhead around the chain so far; rejects instead of
    /// waiting when no permit is free.
    pub fn with_bulkhead(mut self, bulkhead: &Bulkhead) -> Self {
        self.state.record("Bulkhead", bulkhead.name());
        self.unit = bulkhead.decorate_pending(self.unit);
        self
    }

    /// Rate limiter around the chain so far. Invoking never blocks; the
    /// permission is awaited inside the pending result.
    pub fn with_rate_limiter(mut self, limiter: &RateLimiter) -> Self {
        self.state.record("RateLimiter", limiter.name());
        self.unit = limiter.decorate_pending(self.unit);
        self
    }

    /// Retry without a delay scheduler. Fails unless the retry never waits
    /// between attempts.
    pub fn with_retry(self, retry: &Retry) -> Result<Self, CompositionError> {
        self.layer("Retry", retry, None)
    }

    /// Retry whose waits are scheduled on `scheduler`.
    pub fn with_retry_on(self, retry: &Retry, scheduler: &Scheduler) -> Result<Self, CompositionError> {
        self.layer("Retry", retry, Some(scheduler))
    }

    /// Deadline on the chain so far, enforced from `scheduler`.
    ///
    /// `scheduler` must not be the pool the work runs on.
    pub fn with_time_limiter(
        self,
        limiter: &TimeLimiter,
        scheduler: &Scheduler,
    ) -> Result<Self, CompositionError> {
        self.layer("TimeLimiter", limiter, Some(scheduler))
    }

    /// Any asynchronous policy around the chain so far.
    pub fn with_async_policy<P: AsyncPolicy>(
        self,
        policy: &P,
        scheduler: Option<&Scheduler>,
    ) -> Result<Self, CompositionError> {
        self.layer("AsyncPolicy", policy, scheduler)
    }

    fn layer<P: AsyncPolicy>(
        mut self,
        kind: &str,
        policy: &P,
        scheduler: Option<&Scheduler>,
    ) -> Result<Self, CompositionError> {
        if let (Some(role), Some(scheduler)) = (policy.scheduler_role(), scheduler) {
            self.state.bind(role, scheduler)?;
        }
        self.unit = policy.decorate_async(self.unit, scheduler)?;
        self.state.record(kind, policy.name());
        Ok(self)
    }

    /// Recovers errors of type `E` raised by the chain so far.
    pub fn with_fallback<E, F>(self, recovery: F) -> Self
    where
        E: StdError + 'static,
        F: Fn(&E) -> T + Send + Sync + 'static,
    {
        self.with_fallbacks(FallbackDispatcher::new().on::<E, F>(recovery))
    }

    /// Recovers errors of `class` raised by the chain so far.
    pub fn with_fallback_on_class<F>(self, class: ErrorClass, recovery: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> T + Send + Sync + 'static,
    {
        self.with_fallbacks(FallbackDispatcher::new().on_class(class, recovery))
    }

    /// Recovers errors accepted by `predicate`.
    pub fn with_fallback_matching<P, F>(self, predicate: P, recovery: F) -> Self
    where
        P: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
        F: Fn(&(dyn StdError + 'static)) -> T + Send + Sync + 'static,
    {
        self.with_fallbacks(FallbackDispatcher::new().on_matching(predicate, recovery))
    }

    /// Recovers any error raised by the chain so far.
    pub fn with_fallback_any<F>(self, recovery: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> T + Send + Sync + 'static,
    {
        self.with_fallbacks(FallbackDispatcher::new().on_any(recovery))
    }

    /// Recovers through a multi-entry dispatcher.
    pub fn with_fallbacks(mut self, dispatcher: FallbackDispatcher<T>) -> Self {
        self.state.record("Fallback", &dispatcher.len().to_string());
        self.unit = dispatcher.decorate_async(self.unit);
        self
    }

    /// Replaces successful values accepted by `predicate`.
    pub fn with_result_fallback<P, H>(mut self, predicate: P, handler: H) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        H: Fn(T) -> T + Send + Sync + 'static,
    {
        self.state.record("ResultFallback", "predicate");
        self.unit = ResultFallback::new(predicate, handler).decorate_async(self.unit);
        self
    }

    /// Applied policies, innermost first
    pub fn policies(&self) -> &[String] {
        self.state.policies()
    }

    /// Schedulers bound so far, with their role
    pub fn schedulers(&self) -> Vec<(SchedulerRole, Scheduler)> {
        self.state
            .schedulers()
            .map(|(role, scheduler)| (role, scheduler.clone()))
            .collect()
    }

    /// Finishes the chain.
    pub fn decorate(self) -> AsyncAction<I, T> {
        self.unit
    }

    /// Finishes the chain and starts it once with `input`.
    pub fn apply(self, input: I) -> Pending<T> {
        self.unit.invoke(input)
    }
}

impl<I> AsyncDecorate<I, ()>
where
    I: Clone + Send + 'static,
{
    /// Finishes a consumer chain and starts it once with `input`.
    pub fn accept(self, input: I) -> Pending<()> {
        self.unit.invoke(input)
    }
}

impl<T> AsyncDecorate<(), T>
where
    T: Send + 'static,
{
    /// Finishes a supplier chain and starts it once.
    pub fn get(self) -> Pending<T> {
        self.unit.invoke(())
    }
}

impl AsyncDecorate<(), ()> {
    /// Finishes a runnable chain and starts it once.
    pub fn run(self) -> Pending<()> {
        self.unit.invoke(())
    }
}

impl<I, T> fmt::Debug for AsyncDecorate<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDecorate")
            .field("policies", &self.state.policies())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Decorators;
    use rampart_error::{BoxError, Cancelled, TimeoutExceeded};
    use rampart_resilience::{RetryConfig, ThreadPoolBulkhead, TimeLimiterConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_time_limiter_requires_distinct_scheduler() {
        let bulkhead = ThreadPoolBulkhead::with_name("pool").unwrap();
        let limiter = TimeLimiter::with_name("deadline");

        let err = Decorators::of_supplier(|| 1)
            .with_thread_pool_bulkhead(&bulkhead)
            .with_time_limiter(&limiter, bulkhead.scheduler())
            .unwrap_err();

        assert!(matches!(
            err,
            CompositionError::SharedScheduler { bound: "work", requested: "timeout", .. }
        ));
    }

    #[test]
    fn test_waiting_retry_needs_scheduler() {
        let retry = Retry::new(RetryConfig::new("slow").with_wait_duration(Duration::from_millis(10)));

        let err = Decorators::of_async(AsyncAction::new(|()| Pending::ready(Ok(1))))
            .with_retry(&retry)
            .unwrap_err();
        assert!(matches!(err, CompositionError::MissingScheduler { role: "retry-delay", .. }));
    }

    #[test]
    fn test_timeout_with_fallback() {
        let bulkhead = ThreadPoolBulkhead::with_name("pool").unwrap();
        let timeouts = Scheduler::dedicated("timeouts", 1).unwrap();
        let limiter = TimeLimiter::new(
            TimeLimiterConfig::new("deadline").with_timeout_duration(Duration::from_millis(50)),
        );

        let builder = Decorators::of_supplier(|| {
            std::thread::sleep(Duration::from_millis(500));
            "slow"
        })
        .with_thread_pool_bulkhead(&bulkhead)
        .with_time_limiter(&limiter, &timeouts)
        .unwrap()
        .with_fallback::<TimeoutExceeded, _>(|_| "Fallback");

        assert_eq!(
            builder.policies(),
            ["ThreadPoolBulkhead(pool)", "TimeLimiter(deadline)", "Fallback(1)"]
        );
        assert_eq!(builder.schedulers().len(), 2);
        assert_eq!(builder.get().wait().unwrap(), "Fallback");
    }

    #[tokio::test]
    async fn test_future_entry_point() {
        let breaker = CircuitBreaker::with_name("test");
        let value = Decorators::of_future(|| async { Ok::<_, BoxError>("Hello") })
            .with_circuit_breaker(&breaker)
            .with_bulkhead(&Bulkhead::with_name("test"))
            .get()
            .await
            .unwrap();

        assert_eq!(value, "Hello");
        assert_eq!(breaker.metrics().number_of_successful_calls, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_retry_stops() {
        let retry_scheduler = Scheduler::dedicated("retries", 1).unwrap();
        let retry = Retry::new(RetryConfig::new("r").with_max_attempts(10).with_wait_duration(Duration::from_millis(50)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let pending = Decorators::of_future(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("fail") }
        })
        .with_retry_on(&retry, &retry_scheduler)
        .unwrap()
        .get();

        tokio::time::sleep(Duration::from_millis(20)).await;
        pending.cancel();
        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(calls.load(Ordering::SeqCst), seen);
        assert!(pending.await.unwrap_err().is::<Cancelled>());
    }
}

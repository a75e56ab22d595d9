//! Retry: re-invokes failed work a bounded number of times.
//!
//! Synchronous chains wait between attempts on the calling thread.
//! Asynchronous chains wait on the retry-delay [`Scheduler`] and never block
//! a worker. They stop as soon as the consumer cancels the pending result,
//! or drops it while no outer decorator is still following the outcome.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rampart_core::{
    Action, AsyncAction, AsyncPolicy, CancellationToken, Completion, Pending, Policy, Scheduler,
    SchedulerRole,
};
use rampart_error::{BoxError, Cancelled, CompositionError, Outcome};
use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

type ErrorPredicate = dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync;
type ResultPredicate = dyn Fn(&dyn Any) -> bool + Send + Sync;

/// Decides which errors are worth another attempt. Defaults to all of them.
#[derive(Clone)]
pub struct RetryOn(Arc<ErrorPredicate>);

impl RetryOn {
    fn matches(&self, error: &BoxError) -> bool {
        (self.0)(error.as_ref())
    }
}

impl Default for RetryOn {
    fn default() -> Self {
        Self(Arc::new(|_| true))
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryOn(..)")
    }
}

/// Decides which successful values should be retried anyway.
#[derive(Clone, Default)]
pub struct RetryOnResult(Option<Arc<ResultPredicate>>);

impl fmt::Debug for RetryOnResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("RetryOnResult(..)"),
            None => f.write_str("RetryOnResult(None)"),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Name for logging/metrics
    pub name: String,
    /// Maximum number of attempts, including the first call
    pub max_attempts: u32,
    /// Wait between attempts
    pub backoff: Backoff,
    #[serde(skip)]
    retry_on: RetryOn,
    #[serde(skip)]
    retry_on_result: RetryOnResult,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            backoff: Backoff::default(),
            retry_on: RetryOn::default(),
            retry_on_result: RetryOnResult::default(),
        }
    }
}

impl RetryConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set maximum attempts, counting the first call
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Checks that at least the first attempt is allowed.
    pub fn validate(&self) -> Result<(), CompositionError> {
        if self.max_attempts == 0 {
            return Err(CompositionError::InvalidConfig {
                policy: format!("Retry '{}'", self.name),
                reason: "max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Use a fixed wait between attempts
    pub fn with_wait_duration(mut self, wait: std::time::Duration) -> Self {
        self.backoff = Backoff::fixed(wait);
        self
    }

    /// Set backoff strategy
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Only retry errors accepted by `predicate`
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.retry_on = RetryOn(Arc::new(predicate));
        self
    }

    /// Only retry errors of type `E`
    pub fn retry_on_error<E: StdError + 'static>(self) -> Self {
        self.retry_on(|err| err.is::<E>())
    }

    /// Retry every error except those of type `E`
    pub fn ignore_error<E: StdError + 'static>(self) -> Self {
        self.retry_on(|err| !err.is::<E>())
    }

    /// Also retry successful values of type `T` accepted by `predicate`.
    ///
    /// When attempts run out the last value is returned as is.
    pub fn retry_on_result<T, F>(mut self, predicate: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.retry_on_result = RetryOnResult(Some(Arc::new(move |value: &dyn Any| {
            value.downcast_ref::<T>().is_some_and(&predicate)
        })));
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

struct Shared {
    config: RetryConfig,
    counters: Counters,
}

/// Retry handle
///
/// Cloning yields another handle sharing configuration and metrics.
#[derive(Clone)]
pub struct Retry {
    inner: Arc<Shared>,
}

impl Retry {
    /// Create a retry with config.
    ///
    /// Zero attempts are raised to one with a warning; use
    /// [`Retry::try_new`] to reject them instead.
    pub fn new(mut config: RetryConfig) -> Self {
        if let Err(err) = config.validate() {
            tracing::warn!(retry = %config.name, error = %err, "Clamping retry config");
            config.max_attempts = 1;
        }
        Self::build(config)
    }

    /// Create a retry, rejecting an invalid config
    pub fn try_new(config: RetryConfig) -> Result<Self, CompositionError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                counters: Counters::default(),
            }),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(RetryConfig::new(name))
    }

    /// Retry name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    fn should_retry<T: 'static>(&self, outcome: &Outcome<T>) -> bool {
        match outcome {
            Err(err) => self.inner.config.retry_on.matches(err),
            Ok(value) => self
                .inner
                .config
                .retry_on_result
                .0
                .as_ref()
                .is_some_and(|predicate| predicate(value as &dyn Any)),
        }
    }

    fn finish<T>(&self, outcome: &Outcome<T>, attempts: u32) {
        let counters = &self.inner.counters;
        let counter = match (outcome.is_ok(), attempts > 1) {
            (true, false) => &counters.successful_without_retry,
            (true, true) => &counters.successful_with_retry,
            (false, false) => &counters.failed_without_retry,
            (false, true) => &counters.failed_with_retry,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        if let Err(err) = outcome {
            if attempts > 1 {
                tracing::warn!(retry = %self.name(), attempts, error = %err, "Retry attempts exhausted");
            }
        }
    }

    /// Runs `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. Waits on the calling thread.
    pub fn execute<T, F>(&self, mut f: F) -> Outcome<T>
    where
        T: 'static,
        F: FnMut() -> Outcome<T>,
    {
        let max_attempts = self.inner.config.max_attempts;
        let mut delays = self.inner.config.backoff.delays();
        let mut attempt = 1;
        loop {
            let outcome = f();
            if attempt >= max_attempts || !self.should_retry(&outcome) {
                self.finish(&outcome, attempt);
                return outcome;
            }

            let wait = delays.next().unwrap_or_default();
            tracing::debug!(retry = %self.name(), attempt, wait = ?wait, "Attempt failed, will retry");
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            attempt += 1;
        }
    }

    async fn run_attempts<I, T, A>(
        self,
        unit: AsyncAction<I, T>,
        input: I,
        token: CancellationToken,
        abandoned: A,
    ) -> Outcome<T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        A: Fn() -> bool + Send,
    {
        let max_attempts = self.inner.config.max_attempts;
        let mut delays = self.inner.config.backoff.delays();
        let mut attempt = 1;
        loop {
            if abandoned() {
                return Err(Cancelled::new("retry abandoned by its consumer").into());
            }

            let pending = unit.invoke(input.clone());
            let attempt_token = pending.token().clone();
            let outcome = tokio::select! {
                biased;
                outcome = pending => outcome,
                _ = token.cancelled() => {
                    attempt_token.cancel();
                    return Err(Cancelled::new("retry cancelled during an attempt").into());
                }
            };

            if attempt >= max_attempts || !self.should_retry(&outcome) {
                self.finish(&outcome, attempt);
                return outcome;
            }

            let wait = delays.next().unwrap_or_default();
            tracing::debug!(retry = %self.name(), attempt, wait = ?wait, "Attempt failed, scheduling retry");
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = tokio::time::sleep(wait) => {}
                    _ = token.cancelled() => {
                        return Err(Cancelled::new("retry cancelled while waiting").into());
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> RetryMetrics {
        let c = &self.inner.counters;
        RetryMetrics {
            number_of_successful_calls_without_retry_attempt: c
                .successful_without_retry
                .load(Ordering::SeqCst),
            number_of_successful_calls_with_retry_attempt: c.successful_with_retry.load(Ordering::SeqCst),
            number_of_failed_calls_without_retry_attempt: c.failed_without_retry.load(Ordering::SeqCst),
            number_of_failed_calls_with_retry_attempt: c.failed_with_retry.load(Ordering::SeqCst),
        }
    }
}

fn spawn_on<F>(scheduler: &Scheduler, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    // The completion carries the outcome; the join handle is not needed.
    drop(scheduler.spawn(future));
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.inner.config.name)
            .field("max_attempts", &self.inner.config.max_attempts)
            .finish()
    }
}

impl Policy for Retry {
    fn name(&self) -> &str {
        Retry::name(self)
    }

    fn decorate<I, T>(&self, unit: Action<I, T>) -> Action<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        let retry = self.clone();
        Action::new(move |input: I| retry.execute(|| unit.invoke(input.clone())))
    }
}

impl AsyncPolicy for Retry {
    fn name(&self) -> &str {
        Retry::name(self)
    }

    fn scheduler_role(&self) -> Option<SchedulerRole> {
        Some(SchedulerRole::RetryDelay)
    }

    /// Without a scheduler the attempts run inside the returned pending
    /// result, which is only allowed when no wait is configured.
    fn decorate_async<I, T>(
        &self,
        unit: AsyncAction<I, T>,
        scheduler: Option<&Scheduler>,
    ) -> Result<AsyncAction<I, T>, CompositionError>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        let retry = self.clone();
        match scheduler.cloned() {
            Some(scheduler) => Ok(AsyncAction::new(move |input: I| {
                let (completion, pending) = Completion::pair();
                let watcher = completion.clone();
                let attempts = retry.clone().run_attempts(
                    unit.clone(),
                    input,
                    completion.token().clone(),
                    move || watcher.is_abandoned(),
                );
                spawn_on(&scheduler, async move {
                    completion.complete(attempts.await);
                });
                pending.driven_by(&scheduler)
            })),
            None if self.inner.config.backoff.is_immediate() || self.inner.config.max_attempts == 1 => {
                Ok(AsyncAction::new(move |input: I| {
                    let token = CancellationToken::new();
                    let attempts =
                        retry
                            .clone()
                            .run_attempts(unit.clone(), input, token.clone(), || false);
                    Pending::with_token(attempts, token)
                }))
            }
            None => Err(CompositionError::MissingScheduler {
                policy: format!("Retry '{}'", self.name()),
                role: SchedulerRole::RetryDelay.as_str(),
            }),
        }
    }
}

/// Retry metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMetrics {
    /// Calls that succeeded on the first attempt
    pub number_of_successful_calls_without_retry_attempt: u64,
    /// Calls that succeeded after at least one retry
    pub number_of_successful_calls_with_retry_attempt: u64,
    /// Calls that failed on the first attempt with a non-retryable error
    pub number_of_failed_calls_without_retry_attempt: u64,
    /// Calls that failed after all attempts
    pub number_of_failed_calls_with_retry_attempt: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn immediate(attempts: u32) -> Retry {
        Retry::new(
            RetryConfig::new("test")
                .with_max_attempts(attempts)
                .with_backoff(Backoff::none()),
        )
    }

    fn always_fails(calls: Arc<AtomicU32>) -> Action<(), ()> {
        Action::new(move |()| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), BoxError>(Box::new(io::Error::new(io::ErrorKind::Other, "BAM!")))
        })
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff, Backoff::fixed(Duration::from_millis(500)));
    }

    #[test]
    fn test_retries_until_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = immediate(3);
        let decorated = Policy::decorate(&retry, always_fails(calls.clone()));

        let err = decorated.get().unwrap_err();
        assert!(err.is::<io::Error>());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.metrics().number_of_failed_calls_with_retry_attempt, 1);
    }

    #[test]
    fn test_eventual_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let retry = immediate(5);

        let result = retry.execute(|| {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if count < 3 {
                Err("not yet".into())
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.metrics().number_of_successful_calls_with_retry_attempt, 1);
    }

    #[test]
    fn test_non_retryable_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(
            RetryConfig::new("test")
                .with_backoff(Backoff::none())
                .ignore_error::<io::Error>(),
        );

        let _ = Policy::decorate(&retry, always_fails(calls.clone())).get();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.metrics().number_of_failed_calls_without_retry_attempt, 1);
    }

    #[test]
    fn test_retry_on_result() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let retry = Retry::new(
            RetryConfig::new("test")
                .with_backoff(Backoff::none())
                .retry_on_result(|value: &u32| *value < 2),
        );

        let value = retry
            .execute(|| Ok(counter.fetch_add(1, Ordering::SeqCst)))
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_sync_wait_between_attempts() {
        let retry = Retry::new(
            RetryConfig::new("test")
                .with_max_attempts(2)
                .with_wait_duration(Duration::from_millis(20)),
        );
        let start = std::time::Instant::now();
        let _ = retry.execute(|| Err::<(), BoxError>("boom".into()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_async_requires_scheduler_when_waiting() {
        let retry = Retry::with_name("test");
        let unit: AsyncAction<(), ()> = AsyncAction::new(|()| Pending::ready(Ok(())));

        let err = retry.decorate_async(unit, None).unwrap_err();
        assert_eq!(
            err,
            CompositionError::MissingScheduler {
                policy: "Retry 'test'".into(),
                role: "retry-delay",
            }
        );
    }

    #[test]
    fn test_async_without_scheduler_when_immediate() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let unit: AsyncAction<(), ()> = AsyncAction::new(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
            Pending::failed("boom")
        });

        let decorated = immediate(3).decorate_async(unit, None).unwrap();
        assert!(decorated.get().wait().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_async_retry_on_scheduler() {
        let scheduler = Scheduler::dedicated("retry", 1).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let unit: AsyncAction<(), u32> = AsyncAction::new(move |()| {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if count < 2 {
                Pending::failed("transient")
            } else {
                Pending::ready(Ok(count))
            }
        });
        let retry = Retry::new(
            RetryConfig::new("test").with_wait_duration(Duration::from_millis(10)),
        );

        let decorated = retry.decorate_async(unit, Some(&scheduler)).unwrap();
        assert_eq!(decorated.get().wait().unwrap(), 2);
    }

    #[test]
    fn test_cancel_stops_scheduling() {
        let scheduler = Scheduler::dedicated("retry", 1).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let unit: AsyncAction<(), ()> = AsyncAction::new(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
            Pending::failed("boom")
        });
        let retry = Retry::new(
            RetryConfig::new("test")
                .with_max_attempts(10)
                .with_wait_duration(Duration::from_millis(100)),
        );

        let pending = retry.decorate_async(unit, Some(&scheduler)).unwrap().get();
        std::thread::sleep(Duration::from_millis(30));
        pending.cancel();

        let err = pending.wait().unwrap_err();
        assert!(err.is::<Cancelled>());
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_config_serde_skips_predicates() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts":5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.name, "default");
    }

    #[test]
    fn test_scheduled_retry_is_driven() {
        let scheduler = Scheduler::dedicated("retry", 1).unwrap();
        let unit: AsyncAction<(), u8> = AsyncAction::new(|()| Pending::ready(Ok(1)));
        let decorated = Retry::with_name("test").decorate_async(unit, Some(&scheduler)).unwrap();

        let pending = decorated.get();
        assert!(pending.driver().is_some_and(|d| d.same_as(&scheduler)));
        assert_eq!(pending.wait().unwrap(), 1);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = RetryConfig::new("test").with_max_attempts(0);
        assert!(matches!(
            Retry::try_new(config.clone()),
            Err(CompositionError::InvalidConfig { .. })
        ));
        assert_eq!(Retry::new(config).config().max_attempts, 1);
    }
}

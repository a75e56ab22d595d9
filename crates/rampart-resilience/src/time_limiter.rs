//! Time limiter: puts a deadline on asynchronous work.
//!
//! The deadline is enforced by a watchdog on the timeout [`Scheduler`], so it
//! fires even if the consumer is not polling. Whichever of the watchdog and
//! the work settles first decides the outcome; the other is discarded.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rampart_core::{AsyncAction, AsyncPolicy, Completion, Pending, Scheduler, SchedulerRole};
use rampart_error::{CompositionError, Outcome, TimeoutExceeded};
use serde::{Deserialize, Serialize};

/// Configuration for time limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLimiterConfig {
    /// Name for logging/metrics
    pub name: String,
    /// Deadline measured from invocation
    pub timeout_duration: Duration,
    /// Signal cancellation to the work when the deadline fires
    pub cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            timeout_duration: Duration::from_secs(1),
            cancel_running_future: true,
        }
    }
}

impl TimeLimiterConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set deadline
    pub fn with_timeout_duration(mut self, timeout: Duration) -> Self {
        self.timeout_duration = timeout;
        self
    }

    /// Set whether timed-out work is cancelled
    pub fn with_cancel_running_future(mut self, cancel: bool) -> Self {
        self.cancel_running_future = cancel;
        self
    }
}

#[derive(Default)]
struct Counters {
    successful: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

struct Shared {
    config: TimeLimiterConfig,
    counters: Counters,
}

/// Time limiter handle
#[derive(Clone)]
pub struct TimeLimiter {
    inner: Arc<Shared>,
}

impl TimeLimiter {
    /// Create a new time limiter with config
    pub fn new(config: TimeLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                counters: Counters::default(),
            }),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(TimeLimiterConfig::new(name))
    }

    /// Time limiter name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Time limiter configuration
    pub fn config(&self) -> &TimeLimiterConfig {
        &self.inner.config
    }

    fn record<T>(&self, outcome: &Outcome<T>) {
        let counter = if outcome.is_ok() {
            &self.inner.counters.successful
        } else {
            &self.inner.counters.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Races `work` against a watchdog scheduled on `scheduler`.
    ///
    /// The result is driven by whatever already drives `work`.
    pub fn limit<T: Send + 'static>(&self, work: Pending<T>, scheduler: &Scheduler) -> Pending<T> {
        let config = &self.inner.config;
        let work_token = work.token().clone();
        let driver = work.driver().cloned();
        let (completion, mut timed) = Completion::pair_with_token(work_token.clone());

        let limiter = self.clone();
        let watchdog_completion = completion.clone();
        let watchdog = scheduler.schedule(config.timeout_duration, move || {
            let config = &limiter.inner.config;
            let timeout = TimeoutExceeded::new(&config.name, config.timeout_duration);
            if watchdog_completion.complete(Err(timeout.into())) {
                limiter.inner.counters.timed_out.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    time_limiter = %config.name,
                    timeout = ?config.timeout_duration,
                    "Deadline exceeded"
                );
                if config.cancel_running_future {
                    work_token.cancel();
                }
            }
        });

        let limiter = self.clone();
        let token = timed.token().clone();
        let limited = Pending::with_token(
            async move {
                tokio::select! {
                    biased;
                    outcome = &mut timed => outcome,
                    outcome = work => {
                        watchdog.abort();
                        if completion.complete(outcome) {
                            // Settled before the deadline.
                            let outcome = timed.await;
                            limiter.record(&outcome);
                            outcome
                        } else {
                            tracing::debug!(time_limiter = %limiter.name(), "Discarding late result");
                            timed.await
                        }
                    }
                }
            },
            token,
        );
        match driver {
            Some(driver) => limited.driven_by(&driver),
            None => limited,
        }
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> TimeLimiterMetrics {
        let c = &self.inner.counters;
        TimeLimiterMetrics {
            number_of_successful_calls: c.successful.load(Ordering::SeqCst),
            number_of_failed_calls: c.failed.load(Ordering::SeqCst),
            number_of_timed_out_calls: c.timed_out.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for TimeLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeLimiter")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl AsyncPolicy for TimeLimiter {
    fn name(&self) -> &str {
        TimeLimiter::name(self)
    }

    fn scheduler_role(&self) -> Option<SchedulerRole> {
        Some(SchedulerRole::Timeout)
    }

    fn decorate_async<I, T>(
        &self,
        unit: AsyncAction<I, T>,
        scheduler: Option<&Scheduler>,
    ) -> Result<AsyncAction<I, T>, CompositionError>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        let Some(scheduler) = scheduler.cloned() else {
            return Err(CompositionError::MissingScheduler {
                policy: format!("TimeLimiter '{}'", self.name()),
                role: SchedulerRole::Timeout.as_str(),
            });
        };
        let limiter = self.clone();
        Ok(AsyncAction::new(move |input| {
            limiter.limit(unit.invoke(input), &scheduler)
        }))
    }
}

/// Time limiter metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLimiterMetrics {
    /// Calls that completed successfully before the deadline
    pub number_of_successful_calls: u64,
    /// Calls that failed before the deadline
    pub number_of_failed_calls: u64,
    /// Calls whose deadline fired first
    pub number_of_timed_out_calls: u64,
}

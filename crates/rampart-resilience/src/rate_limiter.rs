//! Rate limiter backed by a `governor` GCRA bucket.
//!
//! `limit_for_period` permissions are available per `limit_refresh_period`,
//! refilling smoothly. A caller that finds the bucket empty waits for the
//! next permission if it arrives within `timeout_duration`, otherwise it is
//! rejected with [`RequestNotPermitted`]. Synchronous callers wait on their
//! own thread; asynchronous callers wait inside the returned [`Pending`].

use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use rampart_core::{Action, AsyncAction, AsyncPolicy, CancellationToken, Pending, Policy, Scheduler};
use rampart_error::{BoxError, Cancelled, CompositionError, RequestNotPermitted};
use serde::{Deserialize, Serialize};

/// Configuration for rate limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Name for logging/metrics
    pub name: String,
    /// Permissions available per refresh period
    pub limit_for_period: u32,
    /// Period over which `limit_for_period` permissions refill
    pub limit_refresh_period: Duration,
    /// Longest a caller waits for a permission
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            limit_for_period: 50,
            limit_refresh_period: Duration::from_nanos(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set permissions per period
    pub fn with_limit_for_period(mut self, limit: u32) -> Self {
        self.limit_for_period = limit;
        self
    }

    /// Set refresh period
    pub fn with_limit_refresh_period(mut self, period: Duration) -> Self {
        self.limit_refresh_period = period;
        self
    }

    /// Set how long callers wait for a permission
    pub fn with_timeout_duration(mut self, timeout: Duration) -> Self {
        self.timeout_duration = timeout;
        self
    }

    /// Checks that at least one permission refills over a non-empty period.
    pub fn validate(&self) -> Result<(), CompositionError> {
        let invalid = |reason: &str| CompositionError::InvalidConfig {
            policy: format!("RateLimiter '{}'", self.name),
            reason: reason.to_string(),
        };
        if self.limit_for_period == 0 {
            return Err(invalid("limit_for_period must be at least 1"));
        }
        if self.limit_refresh_period.is_zero() {
            return Err(invalid("limit_refresh_period must be greater than zero"));
        }
        Ok(())
    }

    fn quota(&self) -> Quota {
        let limit = NonZeroU32::new(self.limit_for_period).unwrap_or(NonZeroU32::MIN);
        let per_cell = (self.limit_refresh_period / limit.get()).max(Duration::from_nanos(1));
        match Quota::with_period(per_cell) {
            Some(quota) => quota.allow_burst(limit),
            None => Quota::per_second(limit),
        }
    }
}

struct Shared {
    config: RateLimiterConfig,
    limiter: Governor<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
    waiting: AtomicUsize,
    permitted: AtomicU64,
    rejected: AtomicU64,
}

/// Counts a caller as waiting until dropped.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Rate limiter handle
///
/// Cloning yields another handle to the same bucket.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Shared>,
}

impl RateLimiter {
    /// Create a new rate limiter with config.
    ///
    /// A zero limit or period falls back to one permission per period with
    /// a warning; use [`RateLimiter::try_new`] to reject it instead.
    pub fn new(mut config: RateLimiterConfig) -> Self {
        if let Err(err) = config.validate() {
            tracing::warn!(rate_limiter = %config.name, error = %err, "Clamping rate limiter config");
            config.limit_for_period = config.limit_for_period.max(1);
            config.limit_refresh_period = config.limit_refresh_period.max(Duration::from_nanos(1));
        }
        Self::build(config)
    }

    /// Create a new rate limiter, rejecting an invalid config
    pub fn try_new(config: RateLimiterConfig) -> Result<Self, CompositionError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RateLimiterConfig) -> Self {
        let limiter = Governor::direct(config.quota());
        Self {
            inner: Arc::new(Shared {
                config,
                limiter,
                clock: DefaultClock::default(),
                waiting: AtomicUsize::new(0),
                permitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(RateLimiterConfig::new(name))
    }

    /// Rate limiter name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Rate limiter configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    /// Takes a permission if one is available right now.
    pub fn try_acquire_permission(&self) -> bool {
        let acquired = self.inner.limiter.check().is_ok();
        if acquired {
            self.inner.permitted.fetch_add(1, Ordering::SeqCst);
        }
        acquired
    }

    fn reject(&self, wait: Duration) -> RequestNotPermitted {
        self.inner.rejected.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            rate_limiter = %self.name(),
            wait = ?wait,
            timeout = ?self.inner.config.timeout_duration,
            "Request not permitted"
        );
        RequestNotPermitted::new(self.name())
    }

    /// Takes a permission, blocking up to `timeout_duration` for one to
    /// become available.
    pub fn acquire_permission(&self) -> Result<(), RequestNotPermitted> {
        let timeout = self.inner.config.timeout_duration;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let not_until = match self.inner.limiter.check() {
                Ok(()) => {
                    self.inner.permitted.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                Err(not_until) => not_until,
            };

            let wait = not_until.wait_time_from(self.inner.clock.now());
            let in_time = deadline.map_or(true, |deadline| Instant::now() + wait <= deadline);
            if !in_time {
                return Err(self.reject(wait));
            }

            let _waiting = Waiting::enter(&self.inner.waiting);
            std::thread::sleep(wait);
        }
    }

    /// Takes a permission without blocking a thread, waiting up to
    /// `timeout_duration` for one to become available.
    ///
    /// The caller is rejected up front when the next permission is due
    /// later than the timeout.
    pub async fn acquire_permission_async(&self) -> Result<(), RequestNotPermitted> {
        match self.inner.limiter.check() {
            Ok(()) => {
                self.inner.permitted.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.inner.clock.now());
                if wait > self.inner.config.timeout_duration {
                    return Err(self.reject(wait));
                }
            }
        }

        let _waiting = Waiting::enter(&self.inner.waiting);
        self.inner.limiter.until_ready().await;
        self.inner.permitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Wraps asynchronous work. Invoking never blocks: the permission is
    /// awaited inside the returned pending result, and the work starts once
    /// it is granted.
    pub fn decorate_pending<I, T>(&self, unit: AsyncAction<I, T>) -> AsyncAction<I, T>
    where
        I: Send + 'static,
        T: Send + 'static,
    {
        let limiter = self.clone();
        AsyncAction::new(move |input| {
            let limiter = limiter.clone();
            let unit = unit.clone();
            let token = CancellationToken::new();
            let cancelled = token.clone();
            Pending::with_token(
                async move {
                    if let Err(rejected) = limiter.acquire_permission_async().await {
                        return Err(BoxError::from(rejected));
                    }
                    if cancelled.is_cancelled() {
                        return Err(Cancelled::new("cancelled while waiting for a permission").into());
                    }
                    let mut work = unit.invoke(input);
                    tokio::select! {
                        biased;
                        outcome = &mut work => outcome,
                        () = cancelled.cancelled() => {
                            work.cancel();
                            work.await
                        }
                    }
                },
                token,
            )
        })
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            number_of_waiting_threads: self.inner.waiting.load(Ordering::SeqCst),
            number_of_permitted_calls: self.inner.permitted.load(Ordering::SeqCst),
            number_of_rejected_calls: self.inner.rejected.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Policy for RateLimiter {
    fn name(&self) -> &str {
        RateLimiter::name(self)
    }

    fn decorate<I, T>(&self, unit: Action<I, T>) -> Action<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        let limiter = self.clone();
        Action::new(move |input| {
            limiter.acquire_permission()?;
            unit.invoke(input)
        })
    }
}

impl AsyncPolicy for RateLimiter {
    fn name(&self) -> &str {
        RateLimiter::name(self)
    }

    fn decorate_async<I, T>(
        &self,
        unit: AsyncAction<I, T>,
        _scheduler: Option<&Scheduler>,
    ) -> Result<AsyncAction<I, T>, CompositionError>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.decorate_pending(unit))
    }
}

/// Rate limiter metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterMetrics {
    /// Callers currently waiting for a permission
    pub number_of_waiting_threads: usize,
    /// Permissions handed out
    pub number_of_permitted_calls: u64,
    /// Callers rejected
    pub number_of_rejected_calls: u64,
}

//! Semaphore bulkhead: limits how many calls run at the same time.
//!
//! Synchronous callers wait up to `max_wait_duration` for a permit.
//! Asynchronous callers never wait; they are rejected at once when no permit
//! is free and keep their permit until the pending result settles or is
//! dropped.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rampart_core::{Action, AsyncAction, AsyncPolicy, Pending, Policy, Scheduler};
use rampart_error::{BulkheadFull, CompositionError};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for bulkhead
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Name for logging/metrics
    pub name: String,
    /// Calls allowed to run concurrently
    pub max_concurrent_calls: usize,
    /// How long a synchronous caller waits for a permit
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set concurrency limit
    pub fn with_max_concurrent_calls(mut self, calls: usize) -> Self {
        self.max_concurrent_calls = calls;
        self
    }

    /// Set how long synchronous callers wait for a permit
    pub fn with_max_wait_duration(mut self, wait: Duration) -> Self {
        self.max_wait_duration = wait;
        self
    }

    /// Checks that the limit admits at least one call.
    pub fn validate(&self) -> Result<(), CompositionError> {
        if self.max_concurrent_calls == 0 || self.max_concurrent_calls > Semaphore::MAX_PERMITS {
            return Err(CompositionError::InvalidConfig {
                policy: format!("Bulkhead '{}'", self.name),
                reason: format!(
                    "max_concurrent_calls must be between 1 and {}, got {}",
                    Semaphore::MAX_PERMITS,
                    self.max_concurrent_calls
                ),
            });
        }
        Ok(())
    }
}

struct Shared {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
}

/// Bulkhead handle
///
/// Cloning yields another handle to the same permit pool.
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<Shared>,
}

/// A held concurrency permit, returned to the pool on drop.
#[must_use = "the permit is released as soon as it is dropped"]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    name: String,
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit")
            .field("bulkhead", &self.name)
            .finish()
    }
}

impl Bulkhead {
    /// Create a new bulkhead with config.
    ///
    /// A zero or oversized limit is clamped with a warning; use
    /// [`Bulkhead::try_new`] to reject it instead.
    pub fn new(mut config: BulkheadConfig) -> Self {
        if let Err(err) = config.validate() {
            tracing::warn!(bulkhead = %config.name, error = %err, "Clamping bulkhead config");
            config.max_concurrent_calls = config.max_concurrent_calls.clamp(1, Semaphore::MAX_PERMITS);
        }
        Self::build(config)
    }

    /// Create a new bulkhead, rejecting an invalid config
    pub fn try_new(config: BulkheadConfig) -> Result<Self, CompositionError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: BulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_calls));
        Self {
            inner: Arc::new(Shared { config, semaphore }),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(BulkheadConfig::new(name))
    }

    /// Bulkhead name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Bulkhead configuration
    pub fn config(&self) -> &BulkheadConfig {
        &self.inner.config
    }

    fn full(&self) -> BulkheadFull {
        tracing::debug!(bulkhead = %self.name(), "Bulkhead full");
        BulkheadFull::new(self.name())
    }

    /// Takes a permit without waiting.
    pub fn try_acquire_permission(&self) -> Result<BulkheadPermit, BulkheadFull> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(BulkheadPermit {
                _permit: permit,
                name: self.inner.config.name.clone(),
            }),
            Err(_) => Err(self.full()),
        }
    }

    /// Takes a permit, waiting up to `max_wait_duration`.
    ///
    /// Blocks the calling thread; asynchronous paths use
    /// [`Bulkhead::try_acquire_permission`].
    pub fn acquire_permission(&self) -> Result<BulkheadPermit, BulkheadFull> {
        let deadline = Instant::now() + self.inner.config.max_wait_duration;
        loop {
            if let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() {
                return Ok(BulkheadPermit {
                    _permit: permit,
                    name: self.inner.config.name.clone(),
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.full());
            }
            std::thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }

    /// Wraps asynchronous work. Never waits for a permit; the permit is
    /// held until the work settles.
    ///
    /// Work already running on a scheduler keeps its permit after the
    /// handle is dropped and returns it when it finishes. Lazy work returns
    /// it as soon as the handle is dropped.
    pub fn decorate_pending<I, T>(&self, unit: AsyncAction<I, T>) -> AsyncAction<I, T>
    where
        I: Send + 'static,
        T: Send + 'static,
    {
        let bulkhead = self.clone();
        AsyncAction::new(move |input| match bulkhead.try_acquire_permission() {
            Ok(permit) => unit.invoke(input).inspect(move |_| drop(permit)),
            Err(full) => Pending::failed(full),
        })
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: self.inner.semaphore.available_permits(),
            max_allowed_concurrent_calls: self.inner.config.max_concurrent_calls,
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.inner.config.name)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl Policy for Bulkhead {
    fn name(&self) -> &str {
        Bulkhead::name(self)
    }

    fn decorate<I, T>(&self, unit: Action<I, T>) -> Action<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        let bulkhead = self.clone();
        Action::new(move |input| {
            let _permit = bulkhead.acquire_permission()?;
            unit.invoke(input)
        })
    }
}

impl AsyncPolicy for Bulkhead {
    fn name(&self) -> &str {
        Bulkhead::name(self)
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

/// Bulkhead metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadMetrics {
    /// Permits currently free
    pub available_concurrent_calls: usize,
    /// Configured concurrency limit
    pub max_allowed_concurrent_calls: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_default_config() {
        let config = BulkheadConfig::default();
        assert_eq!(config.max_concurrent_calls, 25);
        assert_eq!(config.max_wait_duration, Duration::ZERO);
    }

    #[test]
    fn test_permit_released_on_drop() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test").with_max_concurrent_calls(1));

        let permit = bulkhead.try_acquire_permission().unwrap();
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 0);
        assert!(bulkhead.try_acquire_permission().is_err());

        drop(permit);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    }

    #[test]
    fn test_waits_for_freed_permit() {
        let bulkhead = Bulkhead::new(
            BulkheadConfig::new("test")
                .with_max_concurrent_calls(1)
                .with_max_wait_duration(Duration::from_secs(1)),
        );
        let permit = bulkhead.acquire_permission().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = bulkhead.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let acquired = waiter.acquire_permission().is_ok();
            tx.send((acquired, start.elapsed())).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        drop(permit);
        let (acquired, waited) = rx.recv().unwrap();
        handle.join().unwrap();

        assert!(acquired);
        assert!(waited >= Duration::from_millis(40));
    }

    #[test]
    fn test_wait_times_out() {
        let bulkhead = Bulkhead::new(
            BulkheadConfig::new("test")
                .with_max_concurrent_calls(1)
                .with_max_wait_duration(Duration::from_millis(20)),
        );
        let _permit = bulkhead.acquire_permission().unwrap();

        let err = bulkhead.acquire_permission().unwrap_err();
        assert_eq!(err.name, "test");
    }

    #[test]
    fn test_decorate_releases_after_call() {
        let bulkhead = Bulkhead::with_name("test");
        let unit: Action<u32, u32> = Action::infallible(|x| x + 1);
        let decorated = Policy::decorate(&bulkhead, unit);

        assert_eq!(decorated.invoke(1).unwrap(), 2);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 25);
    }

    #[test]
    fn test_async_holds_permit_until_settled() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test").with_max_concurrent_calls(1));
        let unit: AsyncAction<(), u8> = AsyncAction::new(|()| Pending::ready(Ok(7)));
        let decorated = bulkhead.decorate_async(unit, None).unwrap();

        let first = decorated.get();
        let second = decorated.get();
        assert!(second.wait().unwrap_err().is::<BulkheadFull>());

        assert_eq!(first.wait().unwrap(), 7);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    }

    #[test]
    fn test_dropped_pending_returns_permit() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test").with_max_concurrent_calls(1));
        let unit: AsyncAction<(), u8> =
            AsyncAction::new(|()| Pending::new(std::future::pending()));
        let decorated = bulkhead.decorate_async(unit, None).unwrap();

        let stuck = decorated.get();
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 0);
        drop(stuck);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    }

    #[test]
    fn test_driven_pending_keeps_permit_until_done() {
        let scheduler = Scheduler::dedicated("bulkhead-driver", 1).unwrap();
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test").with_max_concurrent_calls(1));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));
        let driver = scheduler.clone();
        let unit: AsyncAction<(), u8> = AsyncAction::new(move |()| {
            let rx = release_rx.clone();
            let (completion, pending) = rampart_core::Completion::pair();
            thread::spawn(move || {
                let _ = rx.lock().unwrap().recv();
                completion.complete(Ok(1));
            });
            pending.driven_by(&driver)
        });
        let decorated = bulkhead.decorate_async(unit, None).unwrap();

        drop(decorated.get());
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 0);

        release_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = BulkheadConfig::new("none").with_max_concurrent_calls(0);
        assert!(matches!(
            Bulkhead::try_new(config.clone()),
            Err(CompositionError::InvalidConfig { .. })
        ));
        assert_eq!(Bulkhead::new(config).metrics().max_allowed_concurrent_calls, 1);
    }
}

//! Thread-pool bulkhead: runs synchronous work on a bounded pool.
//!
//! At most `max_thread_pool_size` calls run at once and up to
//! `queue_capacity` more wait for a thread. Anything beyond that is rejected
//! with [`BulkheadFull`]. The caller never blocks; it gets a [`Pending`]
//! straight away.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rampart_core::{Action, AsyncAction, Completion, Offload, Pending, Scheduler};
use rampart_error::{BulkheadFull, Cancelled, CompositionError, WorkPanicked};
use serde::{Deserialize, Serialize};

fn default_pool_size() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Configuration for thread-pool bulkhead
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolBulkheadConfig {
    /// Name for logging/metrics, also used for the pool's thread names
    pub name: String,
    /// Calls allowed to run at the same time
    pub max_thread_pool_size: usize,
    /// Calls allowed to wait for a thread
    pub queue_capacity: usize,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_thread_pool_size: default_pool_size(),
            queue_capacity: 100,
        }
    }
}

impl ThreadPoolBulkheadConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set pool size
    pub fn with_max_thread_pool_size(mut self, size: usize) -> Self {
        self.max_thread_pool_size = size;
        self
    }

    /// Set queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Checks that the pool can run at least one call.
    pub fn validate(&self) -> Result<(), CompositionError> {
        if self.max_thread_pool_size == 0 {
            return Err(CompositionError::InvalidConfig {
                policy: format!("ThreadPoolBulkhead '{}'", self.name),
                reason: "max_thread_pool_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

struct Shared {
    config: ThreadPoolBulkheadConfig,
    scheduler: Scheduler,
    admitted: AtomicUsize,
    active: AtomicUsize,
}

/// Frees an admission slot when the submitted task ends, even by panic.
struct Admission(Arc<Shared>);

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counts a call as running until dropped.
struct Running(Arc<Shared>);

impl Running {
    fn start(shared: &Arc<Shared>) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(shared))
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Thread-pool bulkhead handle
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ThreadPoolBulkhead {
    inner: Arc<Shared>,
}

impl ThreadPoolBulkhead {
    /// Create a bulkhead with its own pool.
    ///
    /// An invalid configuration is reported as [`std::io::ErrorKind::InvalidInput`].
    pub fn new(config: ThreadPoolBulkheadConfig) -> std::io::Result<Self> {
        config
            .validate()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        let scheduler = Scheduler::blocking_pool(config.name.clone(), config.max_thread_pool_size)?;
        Ok(Self::with_scheduler(config, scheduler))
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> std::io::Result<Self> {
        Self::new(ThreadPoolBulkheadConfig::new(name))
    }

    /// Create a bulkhead that submits to an existing scheduler.
    ///
    /// Concurrency is still bounded by the admission limit, but how many
    /// calls truly run in parallel depends on the scheduler's blocking pool.
    pub fn with_scheduler(config: ThreadPoolBulkheadConfig, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                scheduler,
                admitted: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Bulkhead name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Bulkhead configuration
    pub fn config(&self) -> &ThreadPoolBulkheadConfig {
        &self.inner.config
    }

    /// The pool the work runs on
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    fn admit(&self) -> Option<Admission> {
        let config = &self.inner.config;
        let capacity = config.max_thread_pool_size + config.queue_capacity;
        self.inner
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < capacity).then_some(n + 1))
            .ok()
            .map(|_| Admission(Arc::clone(&self.inner)))
    }

    /// Submits one call and returns its pending result.
    ///
    /// Work whose pending result is cancelled before a thread picks it up
    /// never runs and completes with [`Cancelled`]. A panic in the work
    /// completes the result with [`WorkPanicked`].
    pub fn submit<I, T>(&self, unit: Action<I, T>, input: I) -> Pending<T>
    where
        I: Send + 'static,
        T: Send + 'static,
    {
        let Some(admission) = self.admit() else {
            tracing::debug!(bulkhead = %self.name(), "Thread pool bulkhead full");
            return Pending::failed(BulkheadFull::new(self.name()));
        };

        let (completion, pending) = Completion::pair();
        let name = self.inner.config.name.clone();
        drop(self.inner.scheduler.spawn_blocking(move || {
            if completion.token().is_cancelled() {
                tracing::debug!(bulkhead = %name, "Skipping call cancelled while queued");
                completion.complete(Err(Cancelled::new("cancelled before it started").into()));
                return;
            }

            let running = Running::start(&admission.0);
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| unit.invoke(input))) {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(bulkhead = %name, %message, "Work panicked on pool thread");
                    Err(WorkPanicked::new(name.as_str(), message).into())
                }
            };
            drop(running);
            drop(admission);

            if !completion.complete(outcome) {
                tracing::debug!(bulkhead = %name, "Discarding late result");
            }
        }));
        pending.driven_by(&self.inner.scheduler)
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> ThreadPoolBulkheadMetrics {
        let config = &self.inner.config;
        let admitted = self.inner.admitted.load(Ordering::SeqCst);
        let active = self.inner.active.load(Ordering::SeqCst);
        let queue_depth = admitted.saturating_sub(active);
        ThreadPoolBulkheadMetrics {
            queue_depth,
            remaining_queue_capacity: config.queue_capacity.saturating_sub(queue_depth),
            queue_capacity: config.queue_capacity,
            active_thread_count: active,
            maximum_thread_pool_size: config.max_thread_pool_size,
        }
    }
}

impl fmt::Debug for ThreadPoolBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolBulkhead")
            .field("name", &self.inner.config.name)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl Offload for ThreadPoolBulkhead {
    fn name(&self) -> &str {
        ThreadPoolBulkhead::name(self)
    }

    fn work_scheduler(&self) -> &Scheduler {
        self.scheduler()
    }

    fn offload<I, T>(&self, unit: Action<I, T>) -> AsyncAction<I, T>
    where
        I: Send + 'static,
        T: Send + 'static,
    {
        let bulkhead = self.clone();
        AsyncAction::new(move |input| bulkhead.submit(unit.clone(), input))
    }
}

/// Thread-pool bulkhead metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPoolBulkheadMetrics {
    /// Calls admitted but not yet running
    pub queue_depth: usize,
    /// Free queue slots
    pub remaining_queue_capacity: usize,
    /// Configured queue capacity
    pub queue_capacity: usize,
    /// Calls currently running
    pub active_thread_count: usize,
    /// Configured pool size
    pub maximum_thread_pool_size: usize,
}

//! Executors used by asynchronous policies.
//!
//! A [`Scheduler`] is a named handle to a tokio runtime. It either owns a
//! dedicated multi-threaded runtime or borrows the handle of an existing
//! one. Clones share identity, which is what the builder uses to reject a
//! chain that binds the same scheduler to two roles that must stay apart.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rampart_error::CompositionError;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// What a scheduler is used for within one decorator chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerRole {
    /// Runs protected work (thread-pool bulkhead)
    Work,
    /// Fires time limiter deadlines
    Timeout,
    /// Delays retry attempts
    RetryDelay,
}

impl SchedulerRole {
    /// Lower-case label used in errors and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Timeout => "timeout",
            Self::RetryDelay => "retry-delay",
        }
    }
}

impl fmt::Display for SchedulerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    id: u64,
    name: String,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!(scheduler = %self.name, "Shutting down dedicated scheduler");
            // Never blocks, so the last clone may be dropped inside a task.
            runtime.shutdown_background();
        }
    }
}

/// Named, cheaply cloneable executor handle.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    fn build(name: String, handle: Handle, runtime: Option<Runtime>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
                name,
                handle,
                runtime,
            }),
        }
    }

    /// Creates a scheduler that owns a multi-threaded runtime.
    ///
    /// The runtime shuts down when the last clone is dropped.
    pub fn dedicated(name: impl Into<String>, worker_threads: usize) -> std::io::Result<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(format!("{}-worker", name))
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        debug!(scheduler = %name, worker_threads, "Started dedicated scheduler");
        Ok(Self::build(name, handle, Some(runtime)))
    }

    /// Creates a scheduler for blocking work: `spawn_blocking` runs at most
    /// `max_threads` tasks at once and queues the rest.
    pub fn blocking_pool(name: impl Into<String>, max_threads: usize) -> std::io::Result<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_threads.max(1))
            .thread_name(format!("{}-pool", name))
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        debug!(scheduler = %name, max_threads, "Started blocking pool");
        Ok(Self::build(name, handle, Some(runtime)))
    }

    /// Wraps the handle of a runtime owned elsewhere.
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self::build(name.into(), handle, None)
    }

    /// Wraps the runtime the caller is currently running on.
    pub fn current(name: impl Into<String>) -> Result<Self, CompositionError> {
        let name = name.into();
        match Handle::try_current() {
            Ok(handle) => Ok(Self::from_handle(name, handle)),
            Err(_) => Err(CompositionError::NoRuntime(name)),
        }
    }

    /// Process-unique identity, shared by clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Underlying runtime handle
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Whether both handles refer to the same scheduler.
    pub fn same_as(&self, other: &Scheduler) -> bool {
        self.inner.id == other.inner.id
    }

    /// Runs a future on this scheduler.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Runs blocking work on this scheduler's blocking pool.
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.inner.handle.spawn_blocking(f)
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        })
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("dedicated", &self.inner.runtime.is_some())
            .finish()
    }
}

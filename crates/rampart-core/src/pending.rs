//! Pending results of asynchronous work units.
//!
//! A [`Pending`] is a future carrying a [`CancellationToken`]. Cancelling it
//! is only a request: work that has not started yet completes with
//! [`Cancelled`], work that is already running may still finish. The value
//! the consumer observes is whatever settled first.
//!
//! A [`Completion`] is the producer side, used by policies that run the work
//! on another scheduler and settle the result from there.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use rampart_error::{BoxError, Cancelled, Outcome};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;

/// Handle to the eventual outcome of an asynchronous work unit.
///
/// A pending result whose work is already running elsewhere carries the
/// scheduler driving it. Observers added with [`Pending::inspect`] then see
/// the outcome when the work settles, even if the consumer drops the handle.
#[must_use = "a pending result does nothing unless awaited or waited on"]
pub struct Pending<T> {
    future: BoxFuture<'static, Outcome<T>>,
    token: CancellationToken,
    driver: Option<Scheduler>,
}

impl<T: Send + 'static> Pending<T> {
    /// Wraps a future with a fresh cancellation token.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self::with_token(future, CancellationToken::new())
    }

    /// Wraps a future sharing an existing cancellation token.
    pub fn with_token<F>(future: F, token: CancellationToken) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self {
            future: future.boxed(),
            token,
            driver: None,
        }
    }

    /// An already-settled result.
    pub fn ready(outcome: Outcome<T>) -> Self {
        Self::new(futures::future::ready(outcome))
    }

    /// An already-failed result.
    pub fn failed<E: Into<BoxError>>(error: E) -> Self {
        Self::ready(Err(error.into()))
    }

    /// Marks the work behind this result as running on `scheduler`
    /// regardless of whether anyone awaits it.
    pub fn driven_by(mut self, scheduler: &Scheduler) -> Self {
        self.driver = Some(scheduler.clone());
        self
    }

    /// Transforms the outcome once it settles, keeping the token and driver.
    pub fn then<U, F>(self, f: F) -> Pending<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let future = self.future;
        Pending {
            future: async move { f(future.await) }.boxed(),
            token: self.token,
            driver: self.driver,
        }
    }

    /// Calls `observer` with the outcome as soon as it settles.
    ///
    /// With a driver the outcome is followed on the driver's scheduler, so
    /// the observer runs even if this handle is dropped. Without one the
    /// work only makes progress while polled; if the handle is dropped
    /// first the observer is dropped without being called.
    pub fn inspect<F>(self, observer: F) -> Pending<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let future = self.future;
        match self.driver {
            Some(driver) => {
                let (completion, pending) = Completion::pair_with_token(self.token);
                drop(driver.spawn(async move {
                    let outcome = future.await;
                    observer(&outcome);
                    completion.complete(outcome);
                }));
                pending.driven_by(&driver)
            }
            None => Pending {
                future: async move {
                    let outcome = future.await;
                    observer(&outcome);
                    outcome
                }
                .boxed(),
                token: self.token,
                driver: None,
            },
        }
    }

    /// Blocks the current thread until the outcome settles.
    ///
    /// Must not be called from inside an async task; use `.await` there.
    pub fn wait(self) -> Outcome<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Pending<T> {
    /// Token observed by the work behind this result.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Scheduler already driving the work, if any
    pub fn driver(&self) -> Option<&Scheduler> {
        self.driver.as_ref()
    }

    /// Requests cancellation of the work behind this result.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> Future for Pending<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().future.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("cancelled", &self.token.is_cancelled())
            .field("driver", &self.driver.as_ref().map(Scheduler::name))
            .finish_non_exhaustive()
    }
}

type Slot<T> = Arc<Mutex<Option<oneshot::Sender<Outcome<T>>>>>;

/// Producer side of a [`Pending`]. The first outcome wins.
pub struct Completion<T> {
    sender: Slot<T>,
    token: CancellationToken,
}

impl<T: Send + 'static> Completion<T> {
    /// Creates a linked completion and pending result with a fresh token.
    pub fn pair() -> (Completion<T>, Pending<T>) {
        Self::pair_with_token(CancellationToken::new())
    }

    /// Creates a linked completion and pending result sharing `token`.
    pub fn pair_with_token(token: CancellationToken) -> (Completion<T>, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion {
            sender: Arc::new(Mutex::new(Some(tx))),
            token: token.clone(),
        };
        let pending = Pending::with_token(
            async move {
                match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Box::new(Cancelled::new("completion dropped without an outcome"))
                        as BoxError),
                }
            },
            token,
        );
        (completion, pending)
    }
}

impl<T> Completion<T> {
    fn slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<Outcome<T>>>> {
        self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Settles the result. Returns `false` if it was already settled.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        match self.slot().take() {
            Some(tx) => {
                // A dropped consumer still counts as settled.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Whether an outcome was already delivered.
    pub fn is_completed(&self) -> bool {
        self.slot().is_none()
    }

    /// Whether nobody is waiting any more: the consumer cancelled or dropped
    /// the pending result before it settled.
    pub fn is_abandoned(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        self.slot().as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Token shared with the pending result.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            token: self.token.clone(),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

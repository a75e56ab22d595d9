//! Uniform representation of a protected unit of work.
//!
//! Every shape a caller can hand to the builder (supplier, function,
//! consumer, runnable, fallible or not) is normalized into one generic
//! [`Action<I, T>`]; side-effecting shapes use `()` for the missing input or
//! output. The asynchronous counterpart [`AsyncAction<I, T>`] returns a
//! [`Pending`] handle instead of blocking.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use rampart_error::{BoxError, Outcome};

use crate::pending::Pending;

type ActionFn<I, T> = dyn Fn(I) -> Outcome<T> + Send + Sync;
type AsyncActionFn<I, T> = dyn Fn(I) -> Pending<T> + Send + Sync;

/// Zero-argument work producing a value.
pub type Supplier<T> = Action<(), T>;
/// One-argument work producing a value.
pub type Function<I, T> = Action<I, T>;
/// One-argument side-effecting work.
pub type Consumer<I> = Action<I, ()>;
/// Zero-argument side-effecting work.
pub type Runnable = Action<(), ()>;
/// Zero-argument asynchronous work.
pub type AsyncSupplier<T> = AsyncAction<(), T>;

/// A synchronous, shareable unit of work.
///
/// Cloning is cheap and yields a handle to the same callable. An `Action` is
/// never mutated after construction; decorating one produces a new `Action`.
pub struct Action<I, T> {
    f: Arc<ActionFn<I, T>>,
}

impl<I, T> Action<I, T> {
    /// Wraps a closure that already returns an [`Outcome`].
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(I) -> Outcome<T> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Wraps a closure with its own error type.
    pub fn fallible<F, E>(f: F) -> Self
    where
        F: Fn(I) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::new(move |input| f(input).map_err(Into::into))
    }

    /// Wraps a closure that cannot fail.
    pub fn infallible<F>(f: F) -> Self
    where
        F: Fn(I) -> T + Send + Sync + 'static,
    {
        Self::new(move |input| Ok(f(input)))
    }

    /// Runs the unit of work once.
    pub fn invoke(&self, input: I) -> Outcome<T> {
        (self.f)(input)
    }

    /// Converts into a plain closure with the same shape.
    pub fn into_fn(self) -> impl Fn(I) -> Outcome<T> + Send + Sync + Clone
    where
        I: 'static,
        T: 'static,
    {
        move |input| self.invoke(input)
    }
}

impl<T> Action<(), T> {
    /// Runs a zero-argument unit of work.
    pub fn get(&self) -> Outcome<T> {
        self.invoke(())
    }
}

impl<I, T> Clone for Action<I, T> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<I, T> fmt::Debug for Action<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("input", &std::any::type_name::<I>())
            .field("output", &std::any::type_name::<T>())
            .finish()
    }
}

/// An asynchronous, shareable unit of work.
///
/// Invoking it starts (or schedules) the work and returns a [`Pending`]
/// immediately.
pub struct AsyncAction<I, T> {
    f: Arc<AsyncActionFn<I, T>>,
}

impl<I, T> AsyncAction<I, T> {
    /// Wraps a closure that returns a pending result.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(I) -> Pending<T> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Wraps a closure returning any future of a fallible value.
    pub fn from_future<F, Fut, E>(f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
        T: Send + 'static,
    {
        Self::new(move |input| {
            let fut = f(input);
            Pending::new(async move { fut.await.map_err(Into::into) })
        })
    }

    /// Starts the unit of work once.
    pub fn invoke(&self, input: I) -> Pending<T> {
        (self.f)(input)
    }

    /// Converts into a plain closure with the same shape.
    pub fn into_fn(self) -> impl Fn(I) -> Pending<T> + Send + Sync + Clone
    where
        I: 'static,
        T: 'static,
    {
        move |input| self.invoke(input)
    }
}

impl<T> AsyncAction<(), T> {
    /// Starts a zero-argument unit of work.
    pub fn get(&self) -> Pending<T> {
        self.invoke(())
    }
}

impl<I, T> Clone for AsyncAction<I, T> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<I, T> fmt::Debug for AsyncAction<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncAction")
            .field("input", &std::any::type_name::<I>())
            .field("output", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_infallible_action() {
        let action: Function<u32, u32> = Action::infallible(|x| x * 2);
        assert_eq!(action.invoke(21).unwrap(), 42);
    }

    #[test]
    fn test_fallible_preserves_error_type() {
        let action: Supplier<String> =
            Action::fallible(|()| Err::<String, _>(io::Error::new(io::ErrorKind::Other, "BAM!")));

        let err = action.get().unwrap_err();
        let io_err = err.downcast_ref::<io::Error>().expect("io error survives boxing");
        assert_eq!(io_err.to_string(), "BAM!");
    }

    #[test]
    fn test_clone_shares_callable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action: Runnable = Action::infallible(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let copy = action.clone();
        action.get().unwrap();
        copy.get().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_into_fn() {
        let action: Consumer<&'static str> = Action::infallible(|_name| ());
        let f = action.into_fn();
        assert!(f("test").is_ok());
    }

    #[tokio::test]
    async fn test_async_from_future() {
        let action: AsyncSupplier<&str> =
            AsyncAction::from_future(|()| async { Ok::<_, io::Error>("Hello world") });

        assert_eq!(action.get().await.unwrap(), "Hello world");
    }
}

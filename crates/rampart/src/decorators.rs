//! Entry points and the synchronous decorator builder.
//!
//! Each `with_*` call wraps the chain built so far, so the first policy
//! registered sits closest to the work and the last one is what the caller
//! meets first.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;

use rampart_core::{Action, AsyncAction, Offload, Policy};
use rampart_error::{BoxError, ErrorClass, Outcome};
use rampart_resilience::{
    Bulkhead, Cache, CircuitBreaker, RateLimiter, Retry, ThreadPoolBulkhead,
};

use crate::async_decorators::AsyncDecorate;
use crate::fallback::{FallbackDispatcher, ResultFallback};
use crate::state::Composition;

/// Entry points, one per call shape.
///
/// ```
/// use rampart::prelude::*;
///
/// let breaker = CircuitBreaker::with_name("backend");
/// let value = Decorators::of_supplier(|| "Hello world")
///     .with_circuit_breaker(&breaker)
///     .get()
///     .unwrap();
///
/// assert_eq!(value, "Hello world");
/// assert_eq!(breaker.metrics().number_of_successful_calls, 1);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Decorators;

impl Decorators {
    /// Zero-argument work that cannot fail
    pub fn of_supplier<T, F>(supplier: F) -> Decorate<(), T>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Decorate::new(Action::infallible(move |()| supplier()))
    }

    /// Zero-argument work that may fail
    pub fn of_checked_supplier<T, E, F>(supplier: F) -> Decorate<(), T>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        Decorate::new(Action::fallible(move |()| supplier()))
    }

    /// Zero-argument work that may fail with any error
    pub fn of_callable<T, F>(callable: F) -> Decorate<(), T>
    where
        T: Send + 'static,
        F: Fn() -> Outcome<T> + Send + Sync + 'static,
    {
        Decorate::new(Action::new(move |()| callable()))
    }

    /// Zero-argument side effect that cannot fail
    pub fn of_runnable<F>(runnable: F) -> Decorate<(), ()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Decorate::new(Action::infallible(move |()| runnable()))
    }

    /// Zero-argument side effect that may fail
    pub fn of_checked_runnable<E, F>(runnable: F) -> Decorate<(), ()>
    where
        E: Into<BoxError>,
        F: Fn() -> Result<(), E> + Send + Sync + 'static,
    {
        Decorate::new(Action::fallible(move |()| runnable()))
    }

    /// One-argument work that cannot fail
    pub fn of_function<I, T, F>(function: F) -> Decorate<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> T + Send + Sync + 'static,
    {
        Decorate::new(Action::infallible(function))
    }

    /// One-argument work that may fail
    pub fn of_checked_function<I, T, E, F>(function: F) -> Decorate<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError>,
        F: Fn(I) -> Result<T, E> + Send + Sync + 'static,
    {
        Decorate::new(Action::fallible(function))
    }

    /// One-argument side effect that cannot fail
    pub fn of_consumer<I, F>(consumer: F) -> Decorate<I, ()>
    where
        I: Clone + Send + 'static,
        F: Fn(I) + Send + Sync + 'static,
    {
        Decorate::new(Action::infallible(consumer))
    }

    /// One-argument side effect that may fail
    pub fn of_checked_consumer<I, E, F>(consumer: F) -> Decorate<I, ()>
    where
        I: Clone + Send + 'static,
        E: Into<BoxError>,
        F: Fn(I) -> Result<(), E> + Send + Sync + 'static,
    {
        Decorate::new(Action::fallible(consumer))
    }

    /// An existing synchronous unit
    pub fn of_action<I, T>(action: Action<I, T>) -> Decorate<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        Decorate::new(action)
    }

    /// Zero-argument work producing a future on each call
    pub fn of_future<T, E, F, Fut>(supplier: F) -> AsyncDecorate<(), T>
    where
        T: Send + 'static,
        E: Into<BoxError>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        AsyncDecorate::new(AsyncAction::from_future(move |()| supplier()), Composition::default())
    }

    /// An existing asynchronous unit
    pub fn of_async<I, T>(action: AsyncAction<I, T>) -> AsyncDecorate<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
    {
        AsyncDecorate::new(action, Composition::default())
    }

    /// A synchronous unit run on `offload`'s pool.
    ///
    /// The pool is bound as the chain's work scheduler, so a time limiter
    /// added later must use a different one.
    pub fn of_offload<I, T, O>(offload: &O, action: Action<I, T>) -> AsyncDecorate<I, T>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        O: Offload,
    {
        Decorate::new(action).with_offload(offload)
    }
}

/// Builder for a synchronous decorator chain.
#[must_use = "a builder does nothing until a terminal such as `decorate` or `get` is called"]
pub struct Decorate<I, T> {
    unit: Action<I, T>,
    state: Composition,
}

impl<I, T> Decorate<I, T>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
{
    fn new(unit: Action<I, T>) -> Self {
        Self {
            unit,
            state: Composition::default(),
        }
    }

    fn layer<P: Policy>(mut self, kind: &str, policy: &P) -> Self {
        self.state.record(kind, policy.name());
        self.unit = policy.decorate(self.unit);
        self
    }

    /// Circuit breaker around the chain so far
    pub fn with_circuit_breaker(self, breaker: &CircuitBreaker) -> Self {
        self.layer("CircuitBreaker", breaker)
    }

    /// Semaphore bulkhead around the chain so far
    pub fn with_bulkhead(self, bulkhead: &Bulkhead) -> Self {
        self.layer("Bulkhead", bulkhead)
    }

    /// Rate limiter around the chain so far
    pub fn with_rate_limiter(self, limiter: &RateLimiter) -> Self {
        self.layer("RateLimiter", limiter)
    }

    /// Retry around the chain so far
    pub fn with_retry(self, retry: &Retry) -> Self {
        self.layer("Retry", retry)
    }

    /// Any synchronous policy around the chain so far
    pub fn with_policy<P: Policy>(self, policy: &P) -> Self {
        self.layer("Policy", policy)
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
        self.unit = dispatcher.decorate(self.unit);
        self
    }

    /// Replaces successful values accepted by `predicate`.
    pub fn with_result_fallback<P, H>(mut self, predicate: P, handler: H) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        H: Fn(T) -> T + Send + Sync + 'static,
    {
        self.state.record("ResultFallback", "predicate");
        self.unit = ResultFallback::new(predicate, handler).decorate(self.unit);
        self
    }

    /// Moves the chain onto a thread-pool bulkhead, continuing as an
    /// asynchronous chain.
    pub fn with_thread_pool_bulkhead(self, bulkhead: &ThreadPoolBulkhead) -> AsyncDecorate<I, T> {
        self.offload_to("ThreadPoolBulkhead", bulkhead)
    }

    /// Moves the chain onto any [`Offload`] pool, bound as the work
    /// scheduler.
    pub fn with_offload<O: Offload>(self, offload: &O) -> AsyncDecorate<I, T> {
        self.offload_to("Offload", offload)
    }

    fn offload_to<O: Offload>(mut self, kind: &str, offload: &O) -> AsyncDecorate<I, T> {
        self.state.bind_work(offload.work_scheduler());
        self.state.record(kind, offload.name());
        AsyncDecorate::new(offload.offload(self.unit), self.state)
    }

    /// Applied policies, innermost first
    pub fn policies(&self) -> &[String] {
        self.state.policies()
    }

    /// Finishes the chain.
    pub fn decorate(self) -> Action<I, T> {
        self.unit
    }

    /// Finishes the chain and calls it once with `input`.
    pub fn apply(self, input: I) -> Outcome<T> {
        self.unit.invoke(input)
    }
}

impl<I> Decorate<I, ()>
where
    I: Clone + Send + 'static,
{
    /// Finishes a consumer chain and calls it once with `input`.
    pub fn accept(self, input: I) -> Outcome<()> {
        self.unit.invoke(input)
    }
}

impl<T> Decorate<(), T>
where
    T: Send + 'static,
{
    /// Finishes a supplier chain and calls it once.
    pub fn get(self) -> Outcome<T> {
        self.unit.invoke(())
    }

    /// Answers from `cache` before running the chain so far, turning the
    /// supplier into a function of the cache key.
    pub fn with_cache<K>(mut self, cache: &Cache<K, T>) -> Decorate<K, T>
    where
        K: Clone + Send + Sync + 'static,
        T: Clone + Sync,
    {
        self.state.record("Cache", cache.name());
        Decorate {
            unit: cache.decorate_supplier(self.unit),
            state: self.state,
        }
    }
}

impl Decorate<(), ()> {
    /// Finishes a runnable chain and calls it once.
    pub fn run(self) -> Outcome<()> {
        self.unit.invoke(())
    }
}

impl<I, T> Decorate<I, T>
where
    I: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Answers from `cache`, keyed by the input, before running the chain
    /// so far.
    pub fn with_input_cache(mut self, cache: &Cache<I, T>) -> Self {
        self.state.record("Cache", cache.name());
        self.unit = cache.decorate_function(self.unit);
        self
    }
}

impl<I, T> fmt::Debug for Decorate<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decorate")
            .field("policies", &self.state.policies())
            .finish_non_exhaustive()
    }
}

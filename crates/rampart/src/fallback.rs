//! Error-typed fallback.
//!
//! A [`FallbackDispatcher`] holds recovery entries in registration order.
//! When the wrapped work fails, the first entry whose matcher accepts the
//! error produces the replacement value. An error no entry matches is
//! returned unchanged, as the same boxed value.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use rampart_core::{Action, AsyncAction};
use rampart_error::{classify, BoxError, ErrorClass, Outcome};

type Recover<T> = dyn Fn(&(dyn StdError + 'static)) -> Option<T> + Send + Sync;

/// What an entry matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// A concrete error type
    Type(&'static str),
    /// Every error of a class
    Class(ErrorClass),
    /// A caller-supplied predicate
    Predicate,
    /// Any error
    Any,
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(name) => write!(f, "type {}", name),
            Self::Class(class) => write!(f, "class {}", class),
            Self::Predicate => f.write_str("predicate"),
            Self::Any => f.write_str("any"),
        }
    }
}

struct Entry<T> {
    matcher: Matcher,
    recover: Arc<Recover<T>>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            matcher: self.matcher.clone(),
            recover: Arc::clone(&self.recover),
        }
    }
}

/// Ordered list of recovery entries for one output type.
pub struct FallbackDispatcher<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for FallbackDispatcher<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> Clone for FallbackDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T: Send + 'static> FallbackDispatcher<T> {
    /// Empty dispatcher; recovers nothing
    pub fn new() -> Self {
        Self::default()
    }

    fn push<F>(mut self, matcher: Matcher, recover: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> Option<T> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            matcher,
            recover: Arc::new(recover),
        });
        self
    }

    /// Recovers errors of type `E`.
    pub fn on<E, F>(self, recovery: F) -> Self
    where
        E: StdError + 'static,
        F: Fn(&E) -> T + Send + Sync + 'static,
    {
        self.push(Matcher::Type(std::any::type_name::<E>()), move |error| {
            error.downcast_ref::<E>().map(&recovery)
        })
    }

    /// Recovers every error of `class`, as determined by [`classify`].
    pub fn on_class<F>(self, class: ErrorClass, recovery: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> T + Send + Sync + 'static,
    {
        self.push(Matcher::Class(class), move |error| {
            (classify(error) == class).then(|| recovery(error))
        })
    }

    /// Recovers errors accepted by `predicate`.
    pub fn on_matching<P, F>(self, predicate: P, recovery: F) -> Self
    where
        P: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
        F: Fn(&(dyn StdError + 'static)) -> T + Send + Sync + 'static,
    {
        self.push(Matcher::Predicate, move |error| {
            predicate(error).then(|| recovery(error))
        })
    }

    /// Recovers any error.
    pub fn on_any<F>(self, recovery: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> T + Send + Sync + 'static,
    {
        self.push(Matcher::Any, move |error| Some(recovery(error)))
    }

    /// Matchers in registration order
    pub fn matchers(&self) -> impl Iterator<Item = &Matcher> {
        self.entries.iter().map(|entry| &entry.matcher)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces `error` with the first matching recovery value.
    pub fn recover(&self, error: BoxError) -> Outcome<T> {
        for entry in &self.entries {
            if let Some(value) = (entry.recover)(error.as_ref()) {
                tracing::debug!(matcher = %entry.matcher, %error, "Fallback recovered error");
                return Ok(value);
            }
        }
        Err(error)
    }

    /// Passes successes through and routes failures to [`recover`](Self::recover).
    pub fn apply(&self, outcome: Outcome<T>) -> Outcome<T> {
        outcome.or_else(|error| self.recover(error))
    }

    /// Wraps synchronous work.
    pub fn decorate<I: 'static>(&self, unit: Action<I, T>) -> Action<I, T> {
        let dispatcher = self.clone();
        Action::new(move |input| dispatcher.apply(unit.invoke(input)))
    }

    /// Wraps asynchronous work as a continuation on its pending result.
    pub fn decorate_async<I: 'static>(&self, unit: AsyncAction<I, T>) -> AsyncAction<I, T> {
        let dispatcher = self.clone();
        AsyncAction::new(move |input| {
            let dispatcher = dispatcher.clone();
            unit.invoke(input).then(move |outcome| dispatcher.apply(outcome))
        })
    }
}

impl<T> fmt::Debug for FallbackDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.matcher))
            .finish()
    }
}

type ResultPredicate<T> = dyn Fn(&T) -> bool + Send + Sync;
type ResultHandler<T> = dyn Fn(T) -> T + Send + Sync;

/// Replaces successful values that satisfy a predicate.
pub struct ResultFallback<T> {
    predicate: Arc<ResultPredicate<T>>,
    handler: Arc<ResultHandler<T>>,
}

impl<T> Clone for ResultFallback<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T: Send + 'static> ResultFallback<T> {
    /// Runs `handler` on successful values accepted by `predicate`.
    pub fn new<P, H>(predicate: P, handler: H) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        H: Fn(T) -> T + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            handler: Arc::new(handler),
        }
    }

    /// Applies the replacement to a settled outcome; errors pass through.
    pub fn apply(&self, outcome: Outcome<T>) -> Outcome<T> {
        outcome.map(|value| {
            if (self.predicate)(&value) {
                tracing::debug!("Result fallback replaced value");
                (self.handler)(value)
            } else {
                value
            }
        })
    }

    /// Wraps synchronous work.
    pub fn decorate<I: 'static>(&self, unit: Action<I, T>) -> Action<I, T> {
        let fallback = self.clone();
        Action::new(move |input| fallback.apply(unit.invoke(input)))
    }

    /// Wraps asynchronous work.
    pub fn decorate_async<I: 'static>(&self, unit: AsyncAction<I, T>) -> AsyncAction<I, T> {
        let fallback = self.clone();
        AsyncAction::new(move |input| {
            let fallback = fallback.clone();
            unit.invoke(input).then(move |outcome| fallback.apply(outcome))
        })
    }
}

impl<T> fmt::Debug for ResultFallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResultFallback(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::Pending;
    use rampart_error::{BulkheadFull, CallNotPermitted, TimeoutExceeded};
    use std::io;
    use std::time::Duration;

    fn failing(error: fn() -> BoxError) -> Action<(), String> {
        Action::new(move |()| Err(error()))
    }

    #[test]
    fn test_success_passes_through() {
        let dispatcher = FallbackDispatcher::new().on_any(|_| "fallback".to_string());
        let unit: Action<(), String> = Action::infallible(|()| "ok".to_string());
        assert_eq!(dispatcher.decorate(unit).get().unwrap(), "ok");
    }

    #[test]
    fn test_matches_by_type() {
        let dispatcher = FallbackDispatcher::new()
            .on::<CallNotPermitted, _>(|err| format!("fallback for {}", err.name));
        let unit = failing(|| Box::new(CallNotPermitted::new("backend", "OPEN")));

        assert_eq!(dispatcher.decorate(unit).get().unwrap(), "fallback for backend");
    }

    #[test]
    fn test_unmatched_error_unchanged() {
        let dispatcher = FallbackDispatcher::new().on::<BulkheadFull, _>(|_| "full".to_string());
        let unit = failing(|| Box::new(io::Error::new(io::ErrorKind::Other, "BAM!")));

        let err = dispatcher.decorate(unit).get().unwrap_err();
        let io_err = err.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.to_string(), "BAM!");
    }

    #[test]
    fn test_first_match_in_registration_order_wins() {
        let dispatcher = FallbackDispatcher::new()
            .on_class(ErrorClass::Timeout, |_| "class".to_string())
            .on::<TimeoutExceeded, _>(|_| "type".to_string());
        let unit = failing(|| Box::new(TimeoutExceeded::new("tl", Duration::from_millis(1))));

        assert_eq!(dispatcher.decorate(unit).get().unwrap(), "class");
        assert_eq!(
            dispatcher.matchers().collect::<Vec<_>>(),
            vec![
                &Matcher::Class(ErrorClass::Timeout),
                &Matcher::Type(std::any::type_name::<TimeoutExceeded>())
            ]
        );
    }

    #[test]
    fn test_predicate_matcher() {
        let dispatcher = FallbackDispatcher::new().on_matching(
            |err| err.to_string().contains("retryable"),
            |_| "recovered".to_string(),
        );

        let retryable = failing(|| "retryable failure".into());
        assert_eq!(dispatcher.decorate(retryable).get().unwrap(), "recovered");

        let fatal = failing(|| "fatal".into());
        assert!(dispatcher.decorate(fatal).get().is_err());
    }

    #[test]
    fn test_async_continuation() {
        let dispatcher = FallbackDispatcher::new().on_any(|_| 0u32);
        let unit: AsyncAction<(), u32> = AsyncAction::new(|()| Pending::failed("boom"));

        assert_eq!(dispatcher.decorate_async(unit).get().wait().unwrap(), 0);
    }

    #[test]
    fn test_result_fallback() {
        let fallback = ResultFallback::new(|value: &String| value.is_empty(), |_| "default".to_string());
        let empty: Action<(), String> = Action::infallible(|()| String::new());
        let full: Action<(), String> = Action::infallible(|()| "value".to_string());

        assert_eq!(fallback.decorate(empty).get().unwrap(), "default");
        assert_eq!(fallback.decorate(full).get().unwrap(), "value");
    }
}

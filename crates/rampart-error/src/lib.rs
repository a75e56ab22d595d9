//! # Rampart Error
//!
//! Error types shared by every rampart crate. Each resilience policy signals
//! its rejection with its own distinct type so that a fallback can match on
//! it by identity:
//!
//! - [`CallNotPermitted`] - circuit breaker refused the call
//! - [`BulkheadFull`] - no concurrency permit or queue slot was available
//! - [`RequestNotPermitted`] - rate limiter refused the call
//! - [`TimeoutExceeded`] - time limiter deadline expired
//! - [`Cancelled`] - a pending result was cancelled by its consumer
//! - [`WorkPanicked`] - offloaded work panicked instead of returning
//! - [`CompositionError`] - the decorator chain was assembled incorrectly
//!
//! Errors crossing a work-unit boundary travel as a [`BoxError`]; the concrete
//! type is recovered with `downcast_ref` or classified with [`classify`].
//!
//! ## Example
//!
//! ```
//! use rampart_error::{classify, BoxError, CallNotPermitted, ErrorClass};
//!
//! let err: BoxError = Box::new(CallNotPermitted::new("backend", "OPEN"));
//! assert_eq!(classify(err.as_ref()), ErrorClass::Rejection);
//! assert!(err.is::<CallNotPermitted>());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Type-erased error carried through decorated work units.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result of invoking a work unit.
pub type Outcome<T> = std::result::Result<T, BoxError>;

// ============ Policy rejections ============

/// Raised by a circuit breaker that is not accepting calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("CircuitBreaker '{name}' is {state} and does not permit further calls")]
pub struct CallNotPermitted {
    /// Circuit breaker name
    pub name: String,
    /// State the breaker was in when it refused the call
    pub state: String,
}

impl CallNotPermitted {
    /// Creates the error for the named breaker
    pub fn new(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: state.into(),
        }
    }
}

/// Raised by a bulkhead with no free permit or queue slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Bulkhead '{name}' is full and does not permit further calls")]
pub struct BulkheadFull {
    /// Bulkhead name
    pub name: String,
}

impl BulkheadFull {
    /// Creates the error for the named bulkhead
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Raised by a rate limiter that could not hand out a permission in time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("RateLimiter '{name}' does not permit further calls")]
pub struct RequestNotPermitted {
    /// Rate limiter name
    pub name: String,
}

impl RequestNotPermitted {
    /// Creates the error for the named rate limiter
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// ============ Timeouts and cancellation ============

/// Raised by a time limiter whose deadline fired before the work completed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("TimeLimiter '{name}' recorded a timeout after {timeout:?}")]
pub struct TimeoutExceeded {
    /// Time limiter name
    pub name: String,
    /// The deadline that expired
    pub timeout: Duration,
}

impl TimeoutExceeded {
    /// Creates the error for the named time limiter
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
        }
    }
}

/// Outcome of a pending result whose consumer cancelled it before it ran.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("execution cancelled: {reason}")]
pub struct Cancelled {
    /// What cancelled the execution
    pub reason: String,
}

impl Cancelled {
    /// Creates a cancellation with a reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

// ============ Execution failures ============

/// Work that panicked on a pool thread instead of returning an outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("work on '{name}' panicked: {message}")]
pub struct WorkPanicked {
    /// Name of the pool the work ran on
    pub name: String,
    /// Panic payload, when it was a string
    pub message: String,
}

impl WorkPanicked {
    /// Creates a panic report for the pool `name`
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

// ============ Wiring-time errors ============

/// Misuse detected while assembling a decorator chain.
///
/// These are returned by the builder at wiring time and never deferred to
/// the first invocation of the composed callable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositionError {
    /// A policy needs a scheduler for an asynchronous chain but none was given
    #[error("{policy} needs a {role} scheduler on an asynchronous chain")]
    MissingScheduler {
        /// Name of the policy being applied
        policy: String,
        /// Role the missing scheduler would have played
        role: &'static str,
    },

    /// The same scheduler was bound to two roles that must stay apart
    #[error("scheduler '{scheduler}' is already the {bound} pool and cannot also be the {requested} scheduler")]
    SharedScheduler {
        /// Scheduler name
        scheduler: String,
        /// Role the scheduler already plays in this chain
        bound: &'static str,
        /// Role it was offered for
        requested: &'static str,
    },

    /// A scheduler was requested from the ambient runtime outside of one
    #[error("no tokio runtime available for scheduler '{0}'")]
    NoRuntime(String),

    /// A policy configuration is unusable
    #[error("invalid configuration for {policy}: {reason}")]
    InvalidConfig {
        /// Policy name
        policy: String,
        /// What is wrong with it
        reason: String,
    },
}

// ============ Classification ============

/// Coarse category of a failure, for matching and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorClass {
    /// A policy refused the call; the protected work never ran
    Rejection,
    /// A time limiter deadline expired
    Timeout,
    /// The consumer cancelled the pending result
    Cancelled,
    /// The protected work itself failed
    Execution,
}

impl ErrorClass {
    /// True for the classes where the protected work was never invoked
    pub fn skipped_execution(&self) -> bool {
        matches!(self, ErrorClass::Rejection | ErrorClass::Cancelled)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejection => write!(f, "rejection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Execution => write!(f, "execution"),
        }
    }
}

fn class_of(error: &(dyn StdError + 'static)) -> Option<ErrorClass> {
    if error.is::<CallNotPermitted>()
        || error.is::<BulkheadFull>()
        || error.is::<RequestNotPermitted>()
    {
        Some(ErrorClass::Rejection)
    } else if error.is::<TimeoutExceeded>() {
        Some(ErrorClass::Timeout)
    } else if error.is::<Cancelled>() {
        Some(ErrorClass::Cancelled)
    } else {
        None
    }
}

/// Classifies an error, looking through its `source()` chain so that a
/// rejection wrapped by application code is still recognised.
pub fn classify(error: &(dyn StdError + 'static)) -> ErrorClass {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(class) = class_of(err) {
            return class;
        }
        current = err.source();
    }
    ErrorClass::Execution
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("wrapped: {0}")]
    struct Wrapper(#[source] RequestNotPermitted);

    #[test]
    fn test_error_display() {
        let err = CallNotPermitted::new("backend", "OPEN");
        assert_eq!(
            err.to_string(),
            "CircuitBreaker 'backend' is OPEN and does not permit further calls"
        );

        let err = TimeoutExceeded::new("slow", Duration::from_millis(100));
        assert!(err.to_string().contains("100ms"));
    }

    #[test]
    fn test_classify_policy_errors() {
        let cases: Vec<(BoxError, ErrorClass)> = vec![
            (Box::new(CallNotPermitted::new("a", "OPEN")), ErrorClass::Rejection),
            (Box::new(BulkheadFull::new("b")), ErrorClass::Rejection),
            (Box::new(RequestNotPermitted::new("c")), ErrorClass::Rejection),
            (
                Box::new(TimeoutExceeded::new("d", Duration::from_secs(1))),
                ErrorClass::Timeout,
            ),
            (Box::new(Cancelled::new("consumer")), ErrorClass::Cancelled),
            (Box::new(WorkPanicked::new("pool", "boom")), ErrorClass::Execution),
            ("boom".into(), ErrorClass::Execution),
        ];

        for (err, expected) in cases {
            assert_eq!(classify(err.as_ref()), expected, "for {}", err);
        }
    }

    #[test]
    fn test_classify_follows_source_chain() {
        let err: BoxError = Box::new(Wrapper(RequestNotPermitted::new("rl")));
        assert_eq!(classify(err.as_ref()), ErrorClass::Rejection);
    }

    #[test]
    fn test_skipped_execution() {
        assert!(ErrorClass::Rejection.skipped_execution());
        assert!(ErrorClass::Cancelled.skipped_execution());
        assert!(!ErrorClass::Timeout.skipped_execution());
        assert!(!ErrorClass::Execution.skipped_execution());
    }

    #[test]
    fn test_composition_error_display() {
        let err = CompositionError::SharedScheduler {
            scheduler: "pool".into(),
            bound: "work",
            requested: "timeout",
        };
        assert!(err.to_string().contains("'pool'"));
        assert!(err.to_string().contains("timeout"));
    }
}

//! # Rampart - Composable Resilience Decorators
//!
//! Rampart wraps a unit of work with an ordered chain of fault-tolerance
//! policies and hands back a callable of the same shape. The first policy
//! registered sits closest to the work; the last one is the outermost layer.
//!
//! ## Crates
//!
//! | Crate | Description |
//! |-------|-------------|
//! | `rampart-error` | Rejection, timeout and composition error types |
//! | `rampart-core` | Work units, pending results, schedulers, policy traits |
//! | `rampart-resilience` | Circuit breaker, bulkheads, rate limiter, retry, time limiter, cache |
//! | `rampart` | The decorator builder and fallback dispatcher (this crate) |
//!
//! ## Synchronous chains
//!
//! ```
//! use rampart::prelude::*;
//!
//! let breaker = CircuitBreaker::with_name("backend");
//! breaker.transition_to_open_state();
//!
//! let greeting = Decorators::of_supplier(|| "Hello world")
//!     .with_circuit_breaker(&breaker)
//!     .with_fallback::<CallNotPermitted, _>(|_| "Fallback")
//!     .get()
//!     .unwrap();
//!
//! assert_eq!(greeting, "Fallback");
//! assert_eq!(breaker.metrics().number_of_not_permitted_calls, 1);
//! ```
//!
//! ## Asynchronous chains
//!
//! A thread-pool bulkhead moves a synchronous chain onto its pool and the
//! builder continues asynchronously. Policies that need a scheduler take it
//! explicitly:
//!
//! ```
//! use rampart::prelude::*;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), BoxError> {
//! let pool = ThreadPoolBulkhead::with_name("backend")?;
//! let timeouts = Scheduler::dedicated("timeouts", 1)?;
//! let limiter = TimeLimiter::new(
//!     TimeLimiterConfig::new("backend").with_timeout_duration(Duration::from_millis(50)),
//! );
//!
//! let pending = Decorators::of_supplier(|| {
//!     std::thread::sleep(Duration::from_millis(500));
//!     "too late"
//! })
//! .with_thread_pool_bulkhead(&pool)
//! .with_time_limiter(&limiter, &timeouts)?
//! .with_fallback::<TimeoutExceeded, _>(|_| "Fallback")
//! .get();
//!
//! assert_eq!(pending.wait()?, "Fallback");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod async_decorators;
pub mod decorators;
pub mod fallback;
mod state;

pub use async_decorators::AsyncDecorate;
pub use decorators::{Decorate, Decorators};
pub use fallback::{FallbackDispatcher, Matcher, ResultFallback};

pub use rampart_core as core;
pub use rampart_error as error;
pub use rampart_resilience as resilience;

// ============================================================================
// Prelude - commonly used types
// ============================================================================

/// Prelude module for convenient imports
///
/// ```
/// use rampart::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{AsyncDecorate, Decorate, Decorators, FallbackDispatcher};

    pub use rampart_core::{
        Action, AsyncAction, AsyncPolicy, Completion, Offload, Pending, Policy, Scheduler,
        SchedulerRole,
    };

    pub use rampart_error::{
        classify, BoxError, BulkheadFull, CallNotPermitted, Cancelled, CompositionError,
        ErrorClass, Outcome, RequestNotPermitted, TimeoutExceeded, WorkPanicked,
    };

    pub use rampart_resilience::{
        Backoff, Bulkhead, BulkheadConfig, Cache, CacheStore, CircuitBreaker,
        CircuitBreakerConfig, CircuitState, MemoryStore, RateLimiter, RateLimiterConfig, Retry,
        RetryConfig, ThreadPoolBulkhead, ThreadPoolBulkheadConfig, TimeLimiter,
        TimeLimiterConfig,
    };
}

/// Returns the rampart version
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

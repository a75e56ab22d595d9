//! # Rampart Resilience
//!
//! The collaborators a rampart decorator chain is built from. Each one owns
//! its state behind a cheaply cloneable handle and knows how to wrap a work
//! unit; none of them knows about the others.
//!
//! - **Circuit Breaker**: stops calling a backend whose failure rate is too high
//! - **Bulkhead**: caps concurrent calls with a semaphore
//! - **Thread-Pool Bulkhead**: runs calls on a bounded pool with a bounded queue
//! - **Rate Limiter**: hands out a fixed number of permissions per period
//! - **Retry**: re-invokes failed calls with a configurable backoff
//! - **Time Limiter**: puts a deadline on asynchronous calls
//! - **Cache**: answers repeated calls from a store
//!
//! ## Quick Start
//!
//! ```rust
//! use rampart_core::{Action, Policy};
//! use rampart_resilience::{CircuitBreaker, CircuitBreakerConfig, Retry, RetryConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("backend")
//!         .with_sliding_window_size(10)
//!         .with_minimum_number_of_calls(5),
//! );
//! let retry = Retry::new(
//!     RetryConfig::new("backend").with_wait_duration(Duration::from_millis(1)),
//! );
//!
//! let call: Action<(), &str> = Action::infallible(|()| "pong");
//! let protected = retry.decorate(breaker.decorate(call));
//!
//! assert_eq!(protected.get().unwrap(), "pong");
//! assert_eq!(breaker.metrics().number_of_successful_calls, 1);
//! ```
//!
//! ## Backoff
//!
//! ```rust
//! use rampart_resilience::Backoff;
//! use std::time::Duration;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max_delay(Duration::from_secs(10))
//!     .with_jitter(0.0);
//!
//! let delays: Vec<_> = backoff.delays().take(3).collect();
//! assert_eq!(delays[2].as_millis(), 400);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
pub mod thread_pool_bulkhead;
pub mod time_limiter;

// Re-export main types
pub use backoff::{Backoff, Delays};

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadPermit};

pub use cache::{Cache, CacheMetrics, CacheStore, MemoryStore};

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};

pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterMetrics};

pub use retry::{Retry, RetryConfig, RetryMetrics};

pub use thread_pool_bulkhead::{
    ThreadPoolBulkhead, ThreadPoolBulkheadConfig, ThreadPoolBulkheadMetrics,
};

pub use time_limiter::{TimeLimiter, TimeLimiterConfig, TimeLimiterMetrics};

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{Action, AsyncAction, AsyncPolicy, Pending, Policy};

    #[test]
    fn test_circuit_breaker_creation() {
        let cb = CircuitBreaker::with_name("test");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_backoff_default() {
        assert!(!Backoff::default().is_immediate());
        assert!(Backoff::none().is_immediate());
    }

    #[test]
    fn test_sync_policies_stack() {
        let cb = CircuitBreaker::with_name("test");
        let bulkhead = Bulkhead::with_name("test");
        let limiter = RateLimiter::with_name("test");
        let retry = Retry::with_name("test");

        let unit: Action<u32, u32> = Action::infallible(|x| x + 1);
        let decorated = bulkhead.decorate(limiter.decorate(retry.decorate(cb.decorate(unit))));

        assert_eq!(decorated.invoke(1).unwrap(), 2);
        assert_eq!(cb.metrics().number_of_buffered_calls, 1);
        assert_eq!(limiter.metrics().number_of_permitted_calls, 1);
    }

    #[test]
    fn test_async_policies_stack() {
        let cb = CircuitBreaker::with_name("test");
        let bulkhead = Bulkhead::with_name("test");

        let unit: AsyncAction<(), u8> = AsyncAction::new(|()| Pending::ready(Ok(3)));
        let decorated = cb.decorate_async(unit, None).unwrap();
        let decorated = bulkhead.decorate_async(decorated, None).unwrap();

        let value = tokio_test::block_on(decorated.get());
        assert_eq!(value.unwrap(), 3);
        assert_eq!(cb.metrics().number_of_successful_calls, 1);
    }
}

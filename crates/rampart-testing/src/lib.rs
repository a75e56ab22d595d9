//! # Rampart Testing Infrastructure
//!
//! Helpers for testing decorator chains:
//! - [`Probe`] - a scripted unit of work that counts its invocations
//! - [`MockStore`] - a cache backend that can be told to fail
//! - Property-based strategies over policy orderings
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rampart_testing::*;
//!
//! let probe = Probe::returning("Hello world").then(Step::Fail("BAM!".into()));
//! let unit = probe.action();
//!
//! proptest! {
//!     #[test]
//!     fn test_any_order(order in policy_order()) {
//!         // ...
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use proptest::prelude::*;
use rampart_core::Action;
use rampart_error::{BoxError, Outcome};
use rampart_resilience::CacheStore;
use thiserror::Error;

// ============================================================================
// Probe
// ============================================================================

/// Error raised by a [`Probe`] step that fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProbeError(pub String);

/// One scripted reaction of a [`Probe`].
#[derive(Debug, Clone)]
pub enum Step<T> {
    /// Return the value
    Return(T),
    /// Fail with a [`ProbeError`]
    Fail(String),
    /// Block the calling thread, then return the value
    Sleep(Duration, T),
}

impl<T: Clone> Step<T> {
    fn perform(&self) -> Outcome<T> {
        match self {
            Step::Return(value) => Ok(value.clone()),
            Step::Fail(message) => Err(Box::new(ProbeError(message.clone()))),
            Step::Sleep(delay, value) => {
                std::thread::sleep(*delay);
                Ok(value.clone())
            }
        }
    }
}

struct ProbeState<T> {
    script: Mutex<VecDeque<Step<T>>>,
    otherwise: Step<T>,
    calls: AtomicUsize,
}

/// A scripted unit of work.
///
/// Scripted steps are consumed one per call; once they run out every call
/// performs the default step. Clones share the script and the call count.
pub struct Probe<T> {
    state: Arc<ProbeState<T>>,
}

impl<T> Clone for Probe<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Probe<T> {
    /// Probe performing `otherwise` on every unscripted call
    pub fn new(otherwise: Step<T>) -> Self {
        Self {
            state: Arc::new(ProbeState {
                script: Mutex::new(VecDeque::new()),
                otherwise,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Always returns `value`
    pub fn returning(value: T) -> Self {
        Self::new(Step::Return(value))
    }

    /// Always fails with `message`
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(Step::Fail(message.into()))
    }

    /// Always sleeps for `delay` before returning `value`
    pub fn sleeping(delay: Duration, value: T) -> Self {
        Self::new(Step::Sleep(delay, value))
    }

    /// Queues a step ahead of the default one
    pub fn then(self, step: Step<T>) -> Self {
        self.script().push_back(step);
        self
    }

    fn script(&self) -> MutexGuard<'_, VecDeque<Step<T>>> {
        self.state.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Performs the next step
    pub fn call(&self) -> Outcome<T> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script().pop_front();
        match scripted {
            Some(step) => step.perform(),
            None => self.state.otherwise.perform(),
        }
    }

    /// Number of calls so far
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Work unit ignoring its input
    pub fn action<I: 'static>(&self) -> Action<I, T> {
        let probe = self.clone();
        Action::new(move |_| probe.call())
    }
}

impl<T> fmt::Debug for Probe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("calls", &self.state.calls.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Mock cache store
// ============================================================================

/// Error raised by a [`MockStore`] told to fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cache backend unavailable")]
pub struct StoreUnavailable;

/// Cache backend with programmable failures and operation counters.
pub struct MockStore<K, V> {
    entries: Mutex<HashMap<K, V>>,
    fail_lookups: bool,
    fail_puts: bool,
    lookups: AtomicUsize,
    puts: AtomicUsize,
}

impl<K: Eq + Hash, V> MockStore<K, V> {
    /// Empty, healthy store
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fail_lookups: false,
            fail_puts: false,
            lookups: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    /// Seeds an entry
    pub fn with_entry(self, key: K, value: V) -> Self {
        self.entries().insert(key, value);
        self
    }

    /// Makes every lookup fail
    pub fn failing_lookups(mut self) -> Self {
        self.fail_lookups = true;
        self
    }

    /// Makes every put fail
    pub fn failing_puts(mut self) -> Self {
        self.fail_puts = true;
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Lookups attempted, including failed ones
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Puts attempted, including failed ones
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Entries currently stored
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash, V> Default for MockStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CacheStore<K, V> for MockStore<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    fn contains_key(&self, key: &K) -> Result<bool, BoxError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups {
            return Err(Box::new(StoreUnavailable));
        }
        Ok(self.entries().contains_key(key))
    }

    fn get(&self, key: &K) -> Result<Option<V>, BoxError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups {
            return Err(Box::new(StoreUnavailable));
        }
        Ok(self.entries().get(key).cloned())
    }

    fn put(&self, key: K, value: V) -> Result<(), BoxError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts {
            return Err(Box::new(StoreUnavailable));
        }
        self.entries().insert(key, value);
        Ok(())
    }
}

// ============================================================================
// Property-based Testing Strategies
// ============================================================================

/// Synchronous policies a generated chain may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// Circuit breaker
    CircuitBreaker,
    /// Semaphore bulkhead
    Bulkhead,
    /// Rate limiter
    RateLimiter,
    /// Retry
    Retry,
}

impl PolicyKind {
    /// Every kind, once
    pub const ALL: [PolicyKind; 4] = [
        PolicyKind::CircuitBreaker,
        PolicyKind::Bulkhead,
        PolicyKind::RateLimiter,
        PolicyKind::Retry,
    ];
}

/// Any subset of the policies, in any order
pub fn policy_order() -> impl Strategy<Value = Vec<PolicyKind>> {
    prop::sample::subsequence(PolicyKind::ALL.to_vec(), 0..=PolicyKind::ALL.len()).prop_shuffle()
}

/// Policy orderings that never re-invoke the work
pub fn non_retrying_order() -> impl Strategy<Value = Vec<PolicyKind>> {
    policy_order().prop_map(|order| {
        order
            .into_iter()
            .filter(|kind| *kind != PolicyKind::Retry)
            .collect()
    })
}

/// Number of retry attempts
pub fn retry_attempts() -> impl Strategy<Value = u32> {
    1u32..=6
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_script_then_default() {
        let probe = Probe::returning("default").then(Step::Fail("BAM!".into()));

        let err = probe.call().unwrap_err();
        assert_eq!(err.downcast_ref::<ProbeError>().unwrap().0, "BAM!");
        assert_eq!(probe.call().unwrap(), "default");
        assert_eq!(probe.calls(), 2);
    }

    #[test]
    fn test_probe_action_shares_count() {
        let probe = Probe::returning(1u8);
        let action: Action<String, u8> = probe.action();

        action.invoke("ignored".into()).unwrap();
        action.invoke("ignored".into()).unwrap();
        assert_eq!(probe.calls(), 2);
    }

    #[test]
    fn test_mock_store_failures() {
        let store = MockStore::new().with_entry("k", 1).failing_lookups();

        assert!(store.get(&"k").is_err());
        assert!(store.put("j", 2).is_ok());
        assert_eq!(store.lookups(), 1);
        assert_eq!(store.len(), 2);
    }

    proptest! {
        #[test]
        fn test_policy_order_has_no_duplicates(order in policy_order()) {
            let mut seen = std::collections::HashSet::new();
            for kind in &order {
                prop_assert!(seen.insert(*kind));
            }
        }

        #[test]
        fn test_non_retrying_order_excludes_retry(order in non_retrying_order()) {
            prop_assert!(!order.contains(&PolicyKind::Retry));
        }
    }
}

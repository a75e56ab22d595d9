//! Result cache in front of a work unit.
//!
//! A hit returns the stored value without invoking anything. A miss runs the
//! work once and stores its value if it succeeded. Backend failures never
//! fail the call: a failed lookup counts as a miss and a failed store is
//! only logged.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rampart_core::Action;
use rampart_error::BoxError;
use serde::{Deserialize, Serialize};

/// Storage behind a [`Cache`].
pub trait CacheStore<K, V>: Send + Sync {
    /// Whether a live entry exists for `key`
    fn contains_key(&self, key: &K) -> Result<bool, BoxError>;

    /// Stored value for `key`, if any
    fn get(&self, key: &K) -> Result<Option<V>, BoxError>;

    /// Stores `value` under `key`, replacing any previous entry
    fn put(&self, key: K, value: V) -> Result<(), BoxError>;
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// In-memory store with an optional time-to-live.
pub struct MemoryStore<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Option<Duration>,
}

impl<K: Eq + Hash, V> MemoryStore<K, V> {
    /// Store whose entries never expire
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            ttl: None,
        }
    }

    /// Store whose entries expire `ttl` after they were put
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Some(ttl),
        }
    }

    fn is_expired(&self, entry: &Entry<V>) -> bool {
        self.ttl.is_some_and(|ttl| entry.stored_at.elapsed() > ttl)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !self.is_expired(e.value())).count()
    }

    /// Whether the store has no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<K: Eq + Hash, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CacheStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn contains_key(&self, key: &K) -> Result<bool, BoxError> {
        Ok(self
            .entries
            .get(key)
            .is_some_and(|entry| !self.is_expired(&entry)))
    }

    fn get(&self, key: &K) -> Result<Option<V>, BoxError> {
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !self.is_expired(&entry) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }
        self.entries.remove(key);
        Ok(None)
    }

    fn put(&self, key: K, value: V) -> Result<(), BoxError> {
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

struct Shared<K, V> {
    name: String,
    store: Arc<dyn CacheStore<K, V>>,
    counters: Counters,
}

/// Cache handle
///
/// Cloning yields another handle to the same store and counters.
pub struct Cache<K, V> {
    inner: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Cache over any store
    pub fn new(name: impl Into<String>, store: impl CacheStore<K, V> + 'static) -> Self {
        Self::from_store(name, Arc::new(store))
    }

    /// Cache over a store shared with other code
    pub fn from_store(name: impl Into<String>, store: Arc<dyn CacheStore<K, V>>) -> Self {
        Self {
            inner: Arc::new(Shared {
                name: name.into(),
                store,
                counters: Counters::default(),
            }),
        }
    }

    /// Cache name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Looks `key` up, treating backend errors as a miss.
    ///
    /// Asks the store whether the key is present before fetching it.
    pub fn lookup(&self, key: &K) -> Option<V> {
        let found = match self.inner.store.contains_key(key) {
            Ok(false) => Ok(None),
            Ok(true) => self.inner.store.get(key),
            Err(error) => Err(error),
        };
        let found = found.unwrap_or_else(|error| {
            tracing::warn!(cache = %self.name(), %error, "Cache lookup failed, treating as miss");
            None
        });
        let counter = if found.is_some() {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        counter.fetch_add(1, Ordering::SeqCst);
        found
    }

    /// Stores `value`, logging backend errors.
    pub fn store(&self, key: K, value: V) {
        if let Err(error) = self.inner.store.put(key, value) {
            tracing::warn!(cache = %self.name(), %error, "Cache store failed");
        }
    }

    /// Wraps a supplier into a function keyed by the cache key.
    pub fn decorate_supplier(&self, unit: Action<(), V>) -> Action<K, V> {
        let cache = self.clone();
        Action::new(move |key: K| {
            if let Some(value) = cache.lookup(&key) {
                return Ok(value);
            }
            let value = unit.invoke(())?;
            cache.store(key, value.clone());
            Ok(value)
        })
    }

    /// Wraps a function whose input doubles as the cache key.
    pub fn decorate_function(&self, unit: Action<K, V>) -> Action<K, V> {
        let cache = self.clone();
        Action::new(move |key: K| {
            if let Some(value) = cache.lookup(&key) {
                return Ok(value);
            }
            let value = unit.invoke(key.clone())?;
            cache.store(key, value.clone());
            Ok(value)
        })
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            number_of_cache_hits: self.inner.counters.hits.load(Ordering::SeqCst),
            number_of_cache_misses: self.inner.counters.misses.load(Ordering::SeqCst),
        }
    }
}

impl<K, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// Cache metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Lookups that found a value
    pub number_of_cache_hits: u64,
    /// Lookups that found nothing or failed
    pub number_of_cache_misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Broken;

    impl CacheStore<String, String> for Broken {
        fn contains_key(&self, _: &String) -> Result<bool, BoxError> {
            Err("backend down".into())
        }

        fn get(&self, _: &String) -> Result<Option<String>, BoxError> {
            Err("backend down".into())
        }

        fn put(&self, _: String, _: String) -> Result<(), BoxError> {
            Err("backend down".into())
        }
    }

    /// Memory store that logs which backend calls were made.
    #[derive(Default)]
    struct Recording {
        store: MemoryStore<String, String>,
        calls: std::sync::Mutex<Vec<&'static str>>,
    }

    impl Recording {
        fn log(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn take(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl CacheStore<String, String> for Recording {
        fn contains_key(&self, key: &String) -> Result<bool, BoxError> {
            self.log("contains_key");
            self.store.contains_key(key)
        }

        fn get(&self, key: &String) -> Result<Option<String>, BoxError> {
            self.log("get");
            self.store.get(key)
        }

        fn put(&self, key: String, value: String) -> Result<(), BoxError> {
            self.log("put");
            self.store.put(key, value)
        }
    }

    fn counting(calls: Arc<AtomicUsize>) -> Action<(), String> {
        Action::infallible(move |()| {
            calls.fetch_add(1, Ordering::SeqCst);
            "Hello world".to_string()
        })
    }

    #[test]
    fn test_hit_skips_invocation() {
        let store = MemoryStore::new();
        store.put("testKey".to_string(), "Hello from cache".to_string()).unwrap();
        let cache = Cache::new("cache", store);
        let calls = Arc::new(AtomicUsize::new(0));

        let decorated = cache.decorate_supplier(counting(calls.clone()));
        assert_eq!(decorated.invoke("testKey".into()).unwrap(), "Hello from cache");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.metrics().number_of_cache_hits, 1);
    }

    #[test]
    fn test_miss_invokes_once_and_stores() {
        let cache = Cache::new("cache", MemoryStore::<String, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let decorated = cache.decorate_supplier(counting(calls.clone()));

        assert_eq!(decorated.invoke("k".into()).unwrap(), "Hello world");
        assert_eq!(decorated.invoke("k".into()).unwrap(), "Hello world");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metrics = cache.metrics();
        assert_eq!(metrics.number_of_cache_misses, 1);
        assert_eq!(metrics.number_of_cache_hits, 1);
    }

    #[test]
    fn test_failure_not_stored() {
        let store = Arc::new(MemoryStore::<String, String>::new());
        let cache = Cache::from_store("cache", store.clone());
        let unit: Action<(), String> = Action::fallible(|()| Err::<String, _>("boom"));

        assert!(cache.decorate_supplier(unit).invoke("k".into()).is_err());
        assert!(!store.contains_key(&"k".to_string()).unwrap());
    }

    #[test]
    fn test_backend_errors_do_not_fail_call() {
        let cache = Cache::new("broken", Broken);
        let calls = Arc::new(AtomicUsize::new(0));
        let decorated = cache.decorate_supplier(counting(calls.clone()));

        assert_eq!(decorated.invoke("k".into()).unwrap(), "Hello world");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().number_of_cache_misses, 1);
    }

    #[test]
    fn test_function_keyed_by_input() {
        let cache = Cache::new("squares", MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let square: Action<u64, u64> = Action::infallible(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x * x
        });
        let decorated = cache.decorate_function(square);

        assert_eq!(decorated.invoke(4).unwrap(), 16);
        assert_eq!(decorated.invoke(4).unwrap(), 16);
        assert_eq!(decorated.invoke(5).unwrap(), 25);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let store = MemoryStore::with_ttl(Duration::from_millis(10));
        store.put(1u8, "one").unwrap();
        assert!(store.contains_key(&1).unwrap());

        std::thread::sleep(Duration::from_millis(20));
        assert!(!store.contains_key(&1).unwrap());
        assert_eq!(store.get(&1).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_lookup_checks_presence_before_get() {
        let store = Arc::new(Recording::default());
        let cache = Cache::from_store("recorded", store.clone());

        assert_eq!(cache.lookup(&"k".to_string()), None);
        assert_eq!(store.take(), vec!["contains_key"]);

        cache.store("k".to_string(), "v".to_string());
        assert_eq!(cache.lookup(&"k".to_string()).as_deref(), Some("v"));
        assert_eq!(store.take(), vec!["put", "contains_key", "get"]);
    }
}

//! Decorated Backend Example
//!
//! Wraps a flaky, slow backend call with a circuit breaker, retry, cache,
//! thread-pool bulkhead, time limiter and fallbacks.
//!
//! Run with:
//! ```bash
//! RUST_LOG=debug cargo run -p rampart --example decorated_backend
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rampart::prelude::*;

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Rampart Decorated Backend Example\n");

    sync_chain()?;
    cached_lookup()?;
    async_chain()?;

    Ok(())
}

/// Backend that fails every third call.
fn flaky_backend(calls: Arc<AtomicU32>) -> impl Fn() -> Outcome<String> + Send + Sync + 'static {
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n % 3 == 0 {
            Err(format!("backend hiccup on call {}", n).into())
        } else {
            Ok(format!("response #{}", n))
        }
    }
}

fn sync_chain() -> Result<(), BoxError> {
    println!("--- Synchronous chain ---");

    let calls = Arc::new(AtomicU32::new(0));
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new("backend")
            .with_sliding_window_size(10)
            .with_minimum_number_of_calls(5),
    );
    let retry = Retry::new(RetryConfig::new("backend").with_wait_duration(Duration::from_millis(10)));

    let builder = Decorators::of_callable(flaky_backend(calls.clone()))
        .with_circuit_breaker(&breaker)
        .with_retry(&retry)
        .with_fallback::<CallNotPermitted, _>(|_| "circuit open".to_string());
    println!("Policies: {:?}", builder.policies());
    let decorated = builder.decorate();

    for _ in 0..5 {
        println!("  -> {}", decorated.get()?);
    }

    let metrics = breaker.metrics();
    println!(
        "Backend calls: {}, breaker state: {}, failed in window: {}",
        calls.load(Ordering::SeqCst),
        metrics.state,
        metrics.number_of_failed_calls
    );
    println!();
    Ok(())
}

fn cached_lookup() -> Result<(), BoxError> {
    println!("--- Cached lookup ---");

    let cache = Cache::new("quotes", MemoryStore::with_ttl(Duration::from_secs(60)));
    let lookup = Decorators::of_function(|symbol: String| format!("quote for {}", symbol))
        .with_input_cache(&cache)
        .decorate();

    for symbol in ["ABC", "XYZ", "ABC"] {
        println!("  {} -> {}", symbol, lookup.invoke(symbol.to_string())?);
    }

    let metrics = cache.metrics();
    println!(
        "Cache hits: {}, misses: {}",
        metrics.number_of_cache_hits, metrics.number_of_cache_misses
    );
    println!();
    Ok(())
}

fn async_chain() -> Result<(), BoxError> {
    println!("--- Asynchronous chain ---");

    let pool = ThreadPoolBulkhead::new(
        ThreadPoolBulkheadConfig::new("backend")
            .with_max_thread_pool_size(2)
            .with_queue_capacity(4),
    )?;
    let timeouts = Scheduler::dedicated("timeouts", 1)?;
    let limiter = TimeLimiter::new(
        TimeLimiterConfig::new("backend").with_timeout_duration(Duration::from_millis(100)),
    );
    let breaker = CircuitBreaker::with_name("slow-backend");

    let decorated = Decorators::of_function(|delay_ms: u64| {
        std::thread::sleep(Duration::from_millis(delay_ms));
        format!("answered after {}ms", delay_ms)
    })
    .with_thread_pool_bulkhead(&pool)
    .with_time_limiter(&limiter, &timeouts)?
    .with_circuit_breaker(&breaker)
    .with_fallback::<TimeoutExceeded, _>(|err| format!("gave up: {}", err))
    .decorate();

    for delay_ms in [20, 250] {
        println!("  -> {}", decorated.invoke(delay_ms).wait()?);
    }

    let timed = limiter.metrics();
    println!(
        "Timed out: {}, pool: {:?}",
        timed.number_of_timed_out_calls,
        pool.metrics()
    );
    Ok(())
}

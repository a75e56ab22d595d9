//! Rampart Benchmark Suite
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p rampart
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rampart::prelude::*;

// ============================================================================
// Synchronous Chain Benchmarks
// ============================================================================

fn bench_sync_chains(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sync Chains");

    group.bench_function("undecorated", |b| {
        let unit = Decorators::of_function(|x: u64| x + 1).decorate();
        b.iter(|| unit.invoke(black_box(41)))
    });

    group.bench_function("circuit_breaker", |b| {
        let breaker = CircuitBreaker::with_name("bench");
        let unit = Decorators::of_function(|x: u64| x + 1)
            .with_circuit_breaker(&breaker)
            .decorate();
        b.iter(|| unit.invoke(black_box(41)))
    });

    group.bench_function("full_stack", |b| {
        let unit = Decorators::of_function(|x: u64| x + 1)
            .with_circuit_breaker(&CircuitBreaker::with_name("bench"))
            .with_retry(&Retry::with_name("bench"))
            .with_bulkhead(&Bulkhead::with_name("bench"))
            .with_fallback_any(|_| 0)
            .decorate();
        b.iter(|| unit.invoke(black_box(41)))
    });

    group.bench_function("open_breaker_fallback", |b| {
        let breaker = CircuitBreaker::with_name("bench");
        breaker.transition_to_open_state();
        let unit = Decorators::of_function(|x: u64| x + 1)
            .with_circuit_breaker(&breaker)
            .with_fallback::<CallNotPermitted, _>(|_| 0)
            .decorate();
        b.iter(|| unit.invoke(black_box(41)))
    });

    group.finish();
}

// ============================================================================
// Cache Benchmarks
// ============================================================================

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("Cache");

    for entries in [10u64, 1_000] {
        let cache = Cache::new("bench", MemoryStore::new());
        let unit = Decorators::of_function(|x: u64| x * 2)
            .with_input_cache(&cache)
            .decorate();
        for key in 0..entries {
            let _ = unit.invoke(key);
        }

        group.bench_with_input(BenchmarkId::new("hit", entries), &entries, |b, &n| {
            b.iter(|| unit.invoke(black_box(n / 2)))
        });
    }

    group.finish();
}

// ============================================================================
// Asynchronous Chain Benchmarks
// ============================================================================

fn bench_async_chains(c: &mut Criterion) {
    let mut group = c.benchmark_group("Async Chains");

    group.bench_function("ready_with_breaker", |b| {
        let unit = Decorators::of_async(AsyncAction::new(|x: u64| Pending::ready(Ok(x + 1))))
            .with_circuit_breaker(&CircuitBreaker::with_name("bench"))
            .with_bulkhead(&Bulkhead::with_name("bench"))
            .decorate();
        b.iter(|| unit.invoke(black_box(41)).wait())
    });

    group.bench_function("thread_pool_bulkhead", |b| {
        let pool = match ThreadPoolBulkhead::with_name("bench") {
            Ok(pool) => pool,
            Err(_) => return,
        };
        let unit = Decorators::of_function(|x: u64| x + 1)
            .with_thread_pool_bulkhead(&pool)
            .decorate();
        b.iter(|| unit.invoke(black_box(41)).wait())
    });

    group.finish();
}

criterion_group!(benches, bench_sync_chains, bench_cache, bench_async_chains);
criterion_main!(benches);

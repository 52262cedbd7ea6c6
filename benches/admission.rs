use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mutation_guard::{
    subject_key, CircuitBreaker, CircuitBreakerConfig, Metrics, RateLimitConfig, RateLimiter,
    ShardedStorage, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;

fn limiter(config: RateLimitConfig) -> RateLimiter {
    RateLimiter::new(
        "bench",
        config,
        Arc::new(ShardedStorage::new()),
        Arc::new(SystemClock::new()),
        Metrics::new(),
    )
}

/// Admission decisions on one hot key, mostly denied after the first burst
fn bench_single_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_key");
    group.throughput(Throughput::Elements(1000));

    for (name, config) in [
        ("admin_ops", RateLimitConfig::admin_ops()),
        ("db_ops", RateLimitConfig::db_ops()),
    ] {
        group.bench_with_input(BenchmarkId::new("is_allowed", name), &config, |b, &config| {
            let limiter = limiter(config);
            let key = subject_key(42, "remove_admin");
            b.iter(|| {
                for _ in 0..1000 {
                    black_box(limiter.is_allowed(black_box(&key)));
                }
            })
        });
    }

    group.finish();
}

/// Admission decisions spread over many subjects
fn bench_key_diversity(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_diversity");
    group.throughput(Throughput::Elements(1000));

    for num_keys in [10usize, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("keys", num_keys), num_keys, |b, &num_keys| {
            let limiter = limiter(RateLimitConfig::stats_ops());
            let keys: Vec<String> = (0..num_keys).map(|i| subject_key(i, "stats")).collect();
            b.iter(|| {
                for i in 0..1000 {
                    black_box(limiter.is_allowed(&keys[i % num_keys]));
                }
            })
        });
    }

    group.finish();
}

/// Concurrent admission from several threads, one subject per thread
fn bench_concurrent_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent");

    for num_threads in [2usize, 4, 8].iter() {
        group.throughput(Throughput::Elements((*num_threads as u64) * 1000));
        group.bench_with_input(
            BenchmarkId::new("threads", num_threads),
            num_threads,
            |b, &num_threads| {
                let limiter = Arc::new(limiter(RateLimitConfig::db_ops()));
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|i| {
                            let limiter = Arc::clone(&limiter);
                            std::thread::spawn(move || {
                                let key = subject_key(i, "query");
                                for _ in 0..1000 {
                                    black_box(limiter.is_allowed(&key));
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                })
            },
        );
    }

    group.finish();
}

/// Cost the breaker adds around a trivial dependency call
fn bench_breaker_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    group.bench_function("closed_success", |b| {
        let breaker = CircuitBreaker::new(
            "bench",
            CircuitBreakerConfig::new(5, Duration::from_secs(60)),
            Arc::new(SystemClock::new()),
            Metrics::new(),
        );
        b.iter(|| {
            rt.block_on(async {
                black_box(breaker.call(|| async { Ok::<_, ()>(1u32) }).await).ok()
            })
        })
    });

    group.bench_function("open_rejection", |b| {
        let breaker = CircuitBreaker::new(
            "bench",
            CircuitBreakerConfig::new(1, Duration::from_secs(3600)),
            Arc::new(SystemClock::new()),
            Metrics::new(),
        );
        let _ = rt.block_on(breaker.call(|| async { Err::<u32, _>(()) }));
        b.iter(|| {
            rt.block_on(async {
                black_box(breaker.call(|| async { Ok::<_, ()>(1u32) }).await).ok()
            })
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_key,
    bench_key_diversity,
    bench_concurrent_admission,
    bench_breaker_overhead
);
criterion_main!(benches);

//! Benchmarks for rate limiter admission
//!
//! This benchmark measures:
//! - `consume` throughput per strategy on a single hot key
//! - `consume` across many keys (entry creation and lookup)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use reliability_plane::resilience::{RateLimiter, RateLimiterConfig, StrategyConfig};
use std::time::Duration;

fn strategies() -> Vec<StrategyConfig> {
    vec![
        StrategyConfig::token_bucket(1_000_000.0, 1_000_000.0),
        StrategyConfig::leaky_bucket(1_000_000.0, 1_000_000.0),
        StrategyConfig::fixed_window(1_000_000, Duration::from_secs(1)),
        StrategyConfig::sliding_window(1_000_000, Duration::from_secs(1)),
    ]
}

fn bench_consume_hot_key(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let _guard = rt.enter();

    let mut group = c.benchmark_group("consume_hot_key");
    group.throughput(Throughput::Elements(1));
    for strategy in strategies() {
        let id = strategy.strategy_id();
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_default_strategy(strategy));
        group.bench_with_input(BenchmarkId::from_parameter(id), &limiter, |b, limiter| {
            b.iter(|| black_box(limiter.consume(black_box("tenant-a"), 1)))
        });
    }
    group.finish();
}

fn bench_consume_many_keys(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let _guard = rt.enter();

    let keys: Vec<String> = (0..1024).map(|i| format!("tenant-{i}")).collect();
    let mut group = c.benchmark_group("consume_many_keys");
    group.throughput(Throughput::Elements(keys.len() as u64));
    for strategy in strategies() {
        let id = strategy.strategy_id();
        let limiter = RateLimiter::new(RateLimiterConfig::new().with_default_strategy(strategy));
        group.bench_with_input(BenchmarkId::from_parameter(id), &limiter, |b, limiter| {
            b.iter(|| {
                for key in &keys {
                    black_box(limiter.consume(key, 1).ok());
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_consume_hot_key, bench_consume_many_keys);
criterion_main!(benches);

//! Throughput benchmarks across policies.
//!
//! Measures the single-threaded request path of each policy and the
//! FrozenHot fast-tier hit path against its own dynamic-tier baseline.
//! Run with `cargo bench`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use hotcache::{CacheOptions, PolicyKind, ShardedCache};

const CAPACITY: u64 = 64 * 1024;
const SHARDS: u32 = 8;

fn build(policy: PolicyKind) -> ShardedCache<u64> {
    let mut options = CacheOptions::new(CAPACITY, SHARDS, policy);
    options.monitor.enabled = false;
    options.sample_capacity = 1 << 16;
    ShardedCache::new(options).expect("valid options")
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");
    group.throughput(Throughput::Elements(1));
    for policy in [
        PolicyKind::Fifo,
        PolicyKind::Lru,
        PolicyKind::Segment,
        PolicyKind::FrozenHot,
    ] {
        let cache = build(policy);
        for key in 10..10 + CAPACITY / 2 {
            cache.insert(key, key);
        }
        let mut key = 10u64;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{policy:?}")),
            &cache,
            |b, cache| {
                b.iter(|| {
                    key = 10 + (key + 1) % (CAPACITY / 2);
                    black_box(cache.lookup(black_box(key)))
                })
            },
        );
    }
    group.finish();
}

fn bench_insert_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_churn");
    group.throughput(Throughput::Elements(1));
    for policy in [
        PolicyKind::Fifo,
        PolicyKind::Lru,
        PolicyKind::Segment,
        PolicyKind::FrozenHot,
    ] {
        let cache = build(policy);
        let mut key = 10u64;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{policy:?}")),
            &cache,
            |b, cache| {
                b.iter(|| {
                    key += 1;
                    black_box(cache.insert(black_box(key), key))
                })
            },
        );
    }
    group.finish();
}

fn bench_frozen_fast_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("frozenhot_tiers");
    group.throughput(Throughput::Elements(1));

    let dynamic = build(PolicyKind::FrozenHot);
    for key in 10..10 + CAPACITY / 2 {
        dynamic.insert(key, key);
    }
    let mut key = 10u64;
    group.bench_function("dynamic_hit", |b| {
        b.iter(|| {
            key = 10 + (key + 1) % (CAPACITY / 2);
            black_box(dynamic.lookup(black_box(key)))
        })
    });

    let frozen = build(PolicyKind::FrozenHot);
    for key in 10..10 + CAPACITY / 2 {
        frozen.insert(key, key);
    }
    frozen.construct_tier();
    let mut key = 10u64;
    group.bench_function("fast_tier_hit", |b| {
        b.iter(|| {
            key = 10 + (key + 1) % (CAPACITY / 2);
            black_box(frozen.lookup(black_box(key)))
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lookup_hit,
    bench_insert_churn,
    bench_frozen_fast_path
);
criterion_main!(benches);

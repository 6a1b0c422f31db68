//! Cache Operations Performance Benchmarks
//!
//! Measures the hot paths of the hybrid cache:
//! - Memory tier hits and inserts with eviction
//! - Bloom filter lookups
//! - Disk store point reads
//!
//! Uses criterion.rs for statistical analysis with warm-up runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tokio::runtime::Runtime;

use hcache_core::cache::MemoryTier;
use hcache_core::storage::{BloomFilter, ConnectionOptions, PersistentStore, StoreSettings};
use hcache_core::{KeyCodec, StringSerializer, ValueHolder};

// ============================================================================
// Helpers
// ============================================================================

fn rt() -> Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

fn holder(i: usize) -> Arc<ValueHolder<String>> {
    Arc::new(ValueHolder::new(format!("value-{}", i), Utc::now()))
}

fn filled_tier(entries: usize) -> MemoryTier<String, String> {
    let tier = MemoryTier::new(entries as u64, None, None);
    for i in 0..entries {
        tier.put(format!("key-{}", i), holder(i));
    }
    tier
}

fn filled_store(entries: usize) -> (PersistentStore<String, String>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = PersistentStore::new(
        dir.path(),
        StoreSettings {
            name: "bench".to_string(),
            version: 1,
            disk_limit: u64::MAX,
            expire_after_write: None,
            bloom_filter: true,
        },
        KeyCodec::string(),
        Arc::new(StringSerializer),
        ConnectionOptions::default(),
    );
    store.open();
    for i in 0..entries {
        store.put(&format!("key-{}", i), &ValueHolder::new(format!("value-{}", i), Utc::now()));
    }
    (store, dir)
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_memory_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_get");
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));

    for size in [1_000usize, 10_000, 100_000] {
        let tier = filled_tier(size);
        let key = format!("key-{}", size / 2);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(tier.get_if_present(&key)))
        });
    }
    group.finish();
}

fn bench_memory_put_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_put");
    group.throughput(Throughput::Elements(1));

    let tier = filled_tier(1_000);
    let mut i = 1_000usize;
    group.bench_function("put_evicting", |b| {
        b.iter(|| {
            i += 1;
            tier.put(format!("key-{}", i), holder(i));
        })
    });
    group.finish();
}

fn bench_single_flight_load(c: &mut Criterion) {
    let rt = rt();
    let tier = Arc::new(MemoryTier::<String, String>::new(10_000, None, None));

    c.bench_function("memory_get_or_load", |b| {
        let mut i = 0usize;
        b.to_async(&rt).iter(|| {
            i += 1;
            let tier = Arc::clone(&tier);
            let key = format!("load-{}", i % 5_000);
            async move {
                let loaded = tier
                    .get(key, || async { Ok::<_, String>(holder(0)) })
                    .await;
                black_box(loaded.is_ok())
            }
        })
    });
}

fn bench_bloom_filter(c: &mut Criterion) {
    let mut filter = BloomFilter::sized_for(100_000);
    for i in 0..100_000 {
        filter.put(format!("key-{}", i).as_bytes());
    }

    let mut group = c.benchmark_group("bloom_filter");
    group.bench_function("might_contain_present", |b| {
        b.iter(|| black_box(filter.might_contain(b"key-50000")))
    });
    group.bench_function("might_contain_absent", |b| {
        b.iter(|| black_box(filter.might_contain(b"absent-key")))
    });
    group.finish();
}

fn bench_disk_reads(c: &mut Criterion) {
    let (store, _dir) = filled_store(10_000);
    let present = "key-5000".to_string();
    let absent = "missing".to_string();

    let mut group = c.benchmark_group("disk_get");
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));
    group.bench_function("present", |b| {
        b.iter(|| black_box(store.get_if_present(&present)))
    });
    group.bench_function("filtered_absent", |b| {
        b.iter(|| black_box(store.might_contain(&absent)))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_memory_hits,
    bench_memory_put_with_eviction,
    bench_single_flight_load,
    bench_bloom_filter,
    bench_disk_reads
);
criterion_main!(benches);

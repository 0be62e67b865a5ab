//! Throughput benchmarks for the in-process memory adapter.
//!
//! Run with: `cargo bench --bench leaky_bucket --features memory`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use throttlecask::storage::MemoryAdapter;
use throttlecask::{LeakyBucket, Storage};

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

// ============================================================================
// Single-key contention
// ============================================================================

fn bench_add_tokens_single_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_tokens_single_key");
    let rt = rt();

    group.throughput(Throughput::Elements(1));
    group.bench_function("unconditional", |b| {
        let adapter = MemoryAdapter::new();
        b.to_async(&rt).iter(|| async {
            black_box(adapter.add_tokens("k", 1_000_000.0, 1.0, black_box(0.001)).await.unwrap());
        });
    });

    group.bench_function("conditional", |b| {
        let adapter = MemoryAdapter::new();
        b.to_async(&rt).iter(|| async {
            black_box(
                adapter
                    .add_tokens_conditionally("k", 1_000_000.0, 1.0, black_box(0.001))
                    .await
                    .unwrap(),
            );
        });
    });

    group.finish();
}

// ============================================================================
// Key-space scaling (one bucket per key vs. shared hot key)
// ============================================================================

fn bench_add_tokens_keyspace(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_tokens_keyspace");
    let rt = rt();

    for keyspace in [1usize, 100, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("conditional", keyspace), &keyspace, |b, &keyspace| {
            let adapter = MemoryAdapter::new();
            let mut counter = 0u64;
            b.to_async(&rt).iter(|| {
                let key = format!("k{}", counter % keyspace as u64);
                counter = counter.wrapping_add(1);
                let adapter = &adapter;
                async move {
                    black_box(
                        adapter
                            .add_tokens_conditionally(black_box(&key), 100.0, 10.0, 1.0)
                            .await
                            .unwrap(),
                    );
                }
            });
        });
    }

    group.finish();
}

// ============================================================================
// LeakyBucket wrapper overhead
// ============================================================================

fn bench_leaky_bucket_fillup(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaky_bucket_fillup");
    let rt = rt();

    group.throughput(Throughput::Elements(1));
    group.bench_function("fillup_conditionally", |b| {
        let bucket = LeakyBucket::new("k", 1_000_000.0, 1.0, MemoryAdapter::new()).unwrap();
        b.to_async(&rt).iter(|| async {
            black_box(bucket.fillup_conditionally(black_box(0.001)).await.unwrap());
        });
    });

    group.finish();
}

// ============================================================================
// Concurrent access across threads (shared Arc<MemoryAdapter>)
// ============================================================================

fn bench_concurrent_same_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_same_key");
    let rt = rt();

    for task_count in [2usize, 4, 8] {
        group.throughput(Throughput::Elements(task_count as u64));
        group.bench_with_input(
            BenchmarkId::new("tasks", task_count),
            &task_count,
            |b, &task_count| {
                let adapter = Arc::new(MemoryAdapter::new());
                b.to_async(&rt).iter(|| {
                    let adapter = adapter.clone();
                    async move {
                        let mut handles = Vec::with_capacity(task_count);
                        for _ in 0..task_count {
                            let adapter = adapter.clone();
                            handles.push(tokio::spawn(async move {
                                black_box(
                                    adapter
                                        .add_tokens_conditionally("hot", 1_000_000.0, 1.0, 0.001)
                                        .await
                                        .unwrap(),
                                );
                            }));
                        }
                        for handle in handles {
                            handle.await.unwrap();
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Read path (state())
// ============================================================================

fn bench_state_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_read");
    let rt = rt();

    group.throughput(Throughput::Elements(1));
    group.bench_function("populated_key", |b| {
        let adapter = MemoryAdapter::new();
        rt.block_on(adapter.add_tokens("k", 100.0, 1.0, 50.0)).unwrap();
        b.to_async(&rt).iter(|| async {
            black_box(adapter.state("k", 100.0, 1.0).await.unwrap());
        });
    });

    group.bench_function("empty_key", |b| {
        let adapter = MemoryAdapter::new();
        b.to_async(&rt).iter(|| async {
            black_box(adapter.state("missing", 100.0, 1.0).await.unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    leaky_bucket,
    bench_add_tokens_single_key,
    bench_add_tokens_keyspace,
    bench_leaky_bucket_fillup,
    bench_concurrent_same_key,
    bench_state_read,
);

criterion_main!(leaky_bucket);

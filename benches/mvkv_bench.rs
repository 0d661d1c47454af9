use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use mvkv::{Condition, Engine, EngineConfig, GcConfig, GcMode, MemoryBackend, StorageError};

fn engine(mode: GcMode) -> Engine<MemoryBackend> {
    let config = EngineConfig {
        gc: GcConfig {
            mode,
            ..GcConfig::default()
        },
        ..EngineConfig::default()
    };
    Engine::in_memory(config).expect("open failed")
}

fn preload(engine: &Engine<MemoryBackend>, keys: usize) {
    engine
        .transact(|tx| {
            for i in 0..keys {
                tx.put(format!("test/key{:05}", i), format!("value{}", i))?;
            }
            Ok::<_, StorageError>(())
        })
        .expect("preload failed");
}

// ============================================================================
// Benchmark: Put Operations
// ============================================================================

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_operations");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));

    let db = engine(GcMode::Sync);

    group.bench_function("single_put", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            db.transact(|tx| tx.put(format!("test/key{}", counter % 1000), "value"))
                .unwrap()
        })
    });

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        let value = black_box("x".repeat(*size));
        group.bench_with_input(BenchmarkId::new("put_value_size", size), size, |b, _| {
            let mut counter = 0u64;
            b.iter(|| {
                counter += 1;
                db.transact(|tx| tx.put(format!("size/key{}", counter % 100), value.as_str()))
                    .unwrap()
            })
        });
    }

    // Many writes committed as one batch
    group.throughput(Throughput::Elements(100));
    group.bench_function("batched_puts_100", |b| {
        b.iter(|| {
            db.transact(|tx| {
                for i in 0..100 {
                    tx.put(format!("batch/key{}", i), "v")?;
                }
                Ok::<_, StorageError>(())
            })
            .unwrap()
        })
    });

    group.finish();
}

// ============================================================================
// Benchmark: Read Operations
// ============================================================================

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_operations");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));

    let db = engine(GcMode::Disabled);
    preload(&db, 10_000);

    group.bench_function("snapshot_get", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % 10_000;
            db.snapshot(|snap| snap.get(format!("test/key{:05}", i).as_bytes()))
                .unwrap()
        })
    });

    for limit in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*limit as u64));
        group.bench_with_input(BenchmarkId::new("snapshot_scan", limit), limit, |b, &limit| {
            b.iter(|| {
                db.snapshot(|snap| {
                    snap.query(Condition::gte("test/key05000"))
                        .take(limit)
                        .collect::<Result<Vec<_>, StorageError>>()
                })
                .unwrap()
            })
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Read-modify-write Transactions
// ============================================================================

fn bench_transaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction_operations");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));

    let db = engine(GcMode::Sync);
    preload(&db, 1000);

    group.bench_function("increment", |b| {
        b.iter(|| {
            db.transact(|tx| {
                let current = tx
                    .get(b"counter")?
                    .map(|v| v.len())
                    .unwrap_or(0);
                tx.put("counter", vec![b'x'; (current + 1) % 64])
            })
            .unwrap()
        })
    });

    group.bench_function("scan_then_write", |b| {
        b.iter(|| {
            db.transact(|tx| {
                let seen = tx.query(Condition::gte("test/key00900")).take(50).count();
                tx.put("summary", seen.to_string())
            })
            .unwrap()
        })
    });

    group.finish();
}

// ============================================================================
// Benchmark: Garbage Collection
// ============================================================================

fn bench_gc(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_operations");
    group.sample_size(20);

    group.bench_function("gc_step_after_churn", |b| {
        let db = engine(GcMode::Disabled);
        preload(&db, 1000);
        b.iter(|| {
            for i in 0..100 {
                db.transact(|tx| tx.put(format!("test/key{:05}", i), "churn"))
                    .unwrap();
            }
            db.collect_garbage().unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_read, bench_transaction, bench_gc);
criterion_main!(benches);

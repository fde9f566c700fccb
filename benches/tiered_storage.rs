#![allow(clippy::unwrap_used, unused_must_use)]
//! Tiered Storage Benchmarks for Cinder
//!
//! Measures the cost of reads and writes depending on which tier of the
//! HybridLog serves them.
//!
//! ## Benchmark Groups
//!
//! 1. **hot_tier** - Appends, in-place overwrites and reads in the mutable region
//! 2. **warm_tier** - Reads from memory-mapped segments
//! 3. **cold_tier** - Positional reads from disk segments
//! 4. **cold_batched** - `get_many_async` against cold keys
//! 5. **mixed_workload** - 80/20 hot/cold access pattern
//! 6. **value_size** - Write cost across value sizes

use bytes::Bytes;
use cinder::io::RetryPolicy;
use cinder::{HybridLog, HybridLogConfig, SyncPolicy};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::{tempdir, TempDir};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const VALUE_SIZE: usize = 128;
const KEYS: u64 = 10_000;

/// Generate a key/value pair of a given value size.
fn kv(i: u64, value_size: usize) -> (Bytes, Bytes) {
    let key = Bytes::from(format!("key:{:08}", i));
    let value = Bytes::from(vec![b'x'; value_size]);
    (key, value)
}

fn open(mutable_size: usize, readonly_size: usize) -> (HybridLog, TempDir) {
    let dir = tempdir().expect("failed to create tempdir");
    let config = HybridLogConfig {
        data_dir: dir.path().to_path_buf(),
        mutable_size,
        readonly_size,
        index_buckets: 1 << 15,
        sync_policy: SyncPolicy::No,
        sync_on_flush: false,
        retry: RetryPolicy::no_retry(),
        ..HybridLogConfig::default()
    };
    (HybridLog::open(config).expect("failed to open log"), dir)
}

fn load(log: &HybridLog, range: std::ops::Range<u64>) -> Vec<Bytes> {
    range
        .map(|i| {
            let (k, v) = kv(i, VALUE_SIZE);
            log.set(k.clone(), v).unwrap();
            k
        })
        .collect()
}

/// Keys in a deterministic random order
fn shuffled(mut keys: Vec<Bytes>) -> Vec<Bytes> {
    keys.shuffle(&mut StdRng::seed_from_u64(42));
    keys
}

/// A log whose first `KEYS` keys sit in the cold tier
fn cold_log() -> (HybridLog, TempDir, Vec<Bytes>) {
    let (log, dir) = open(4 * 1024 * 1024, 1024 * 1024);
    let keys = load(&log, 0..KEYS);
    log.shift().unwrap();
    // The next shift pushes warm bytes over the limit and flushes the first segment
    load(&log, KEYS..KEYS + 1);
    log.shift().unwrap();
    assert!(log.stats().cold_segments > 0);
    (log, dir, keys)
}

// ---------------------------------------------------------------------------
// 1. Hot tier
// ---------------------------------------------------------------------------

fn bench_hot_tier(c: &mut Criterion) {
    let mut group = c.benchmark_group("hot_tier");
    group.throughput(Throughput::Elements(1));

    group.bench_function("append", |b| {
        let (log, _dir) = open(64 * 1024 * 1024, 256 * 1024 * 1024);
        let mut i = 0u64;
        b.iter(|| {
            let (k, v) = kv(i, VALUE_SIZE);
            black_box(log.set(k, v));
            i += 1;
        });
    });

    {
        let (log, _dir) = open(64 * 1024 * 1024, 256 * 1024 * 1024);
        let keys = shuffled(load(&log, 0..KEYS));

        group.bench_function("overwrite_in_place", |b| {
            let value = Bytes::from(vec![b'y'; VALUE_SIZE]);
            let mut idx = 0usize;
            b.iter(|| {
                let key = keys[idx % keys.len()].clone();
                black_box(log.set(key, value.clone()));
                idx += 1;
            });
        });

        group.bench_function("read_random", |b| {
            let mut idx = 0usize;
            b.iter(|| {
                black_box(log.get(&keys[idx % keys.len()]));
                idx += 1;
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Warm tier
// ---------------------------------------------------------------------------

fn bench_warm_tier(c: &mut Criterion) {
    let mut group = c.benchmark_group("warm_tier");
    group.throughput(Throughput::Elements(1));

    let (log, _dir) = open(4 * 1024 * 1024, 64 * 1024 * 1024);
    let keys = load(&log, 0..KEYS);
    log.shift().unwrap();
    assert_eq!(log.stats().warm_segments, 1);

    group.bench_function("read_sequential", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            black_box(log.get(&keys[idx % keys.len()]));
            idx += 1;
        });
    });

    let random = shuffled(keys);
    group.bench_function("read_random", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            black_box(log.get(&random[idx % random.len()]));
            idx += 1;
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 3. Cold tier
// ---------------------------------------------------------------------------

fn bench_cold_tier(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_tier");
    group.throughput(Throughput::Elements(1));

    let (log, _dir, keys) = cold_log();

    group.bench_function("read_sequential", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            black_box(log.get(&keys[idx % keys.len()]));
            idx += 1;
        });
    });

    let random = shuffled(keys);
    group.bench_function("read_random", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            black_box(log.get(&random[idx % random.len()]));
            idx += 1;
        });
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    let (log, random) = (&log, random.as_slice());
    group.bench_function("read_async", |b| {
        let mut idx = 0usize;
        b.to_async(&rt).iter(move || {
            let key = random[idx % random.len()].clone();
            idx += 1;
            async move { black_box(log.get_async(&key).await) }
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 4. Batched cold reads
// ---------------------------------------------------------------------------

fn bench_cold_batched(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_batched");
    let (log, _dir, keys) = cold_log();
    let random = shuffled(keys);
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (log, random) = (&log, random.as_slice());

    for batch in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("get_many_async", batch), &batch, |b, &batch| {
            let mut start = 0usize;
            b.to_async(&rt).iter(move || {
                let end = (start + batch).min(random.len());
                let slice = &random[start..end];
                start = if end == random.len() { 0 } else { end };
                async move { black_box(log.get_many_async(slice).await) }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 5. Mixed workload
// ---------------------------------------------------------------------------

fn bench_mixed_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_workload");
    group.throughput(Throughput::Elements(1));

    let (log, _dir, cold) = cold_log();
    let hot = load(&log, KEYS + 1..KEYS + 1 + 2_000);

    // 80% of reads hit the hot working set, 20% go to disk
    let mut pattern: Vec<Bytes> = Vec::with_capacity(10_000);
    for i in 0..10_000usize {
        if i % 5 == 4 {
            pattern.push(cold[(i * 7) % cold.len()].clone());
        } else {
            pattern.push(hot[(i * 13) % hot.len()].clone());
        }
    }
    let pattern = shuffled(pattern);

    group.bench_function("read_80_20", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            black_box(log.get(&pattern[idx % pattern.len()]));
            idx += 1;
        });
    });

    group.bench_function("read_write_90_10", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            let key = &pattern[idx % pattern.len()];
            if idx % 10 == 0 {
                black_box(log.set(key.clone(), Bytes::from_static(b"updated")));
            } else {
                black_box(log.get(key));
            }
            idx += 1;
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 6. Value size
// ---------------------------------------------------------------------------

fn bench_value_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_size");

    for size in [16usize, 256, 4096, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("set", size), &size, |b, &size| {
            let (log, _dir) = open(16 * 1024 * 1024, 64 * 1024 * 1024);
            let value = Bytes::from(vec![b'v'; size]);
            let mut i = 0u64;
            b.iter(|| {
                let key = Bytes::from(format!("key:{:08}", i));
                black_box(log.set(key, value.clone()));
                i += 1;
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_hot_tier,
    bench_warm_tier,
    bench_cold_tier,
    bench_cold_batched,
    bench_mixed_workload,
    bench_value_size,
);

criterion_main!(benches);

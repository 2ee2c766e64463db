//! Benchmarks for last-value query resolution.
//!
//! Run with: cargo bench --package alopex-lastvalue
//!
//! ## Benchmark Categories
//!
//! - **Fast Path**: every series answered by the last cache
//! - **Scan Path**: cache disabled, every series scanned from segments and memtable
//! - **Assembly**: row construction and descending sort

use alopex_lastvalue::storage::CompactionConfig;
use alopex_lastvalue::{
    assemble, DataType, EngineConfig, InMemoryLastCache, LastQueryExecutor, LastQueryPlan,
    QueryContext, ResolverConfig, SeriesKey, StorageEngine, TimeValuePair, TypedValue,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

const POINTS_PER_SERIES: i64 = 100;

fn series_keys(count: usize) -> Vec<SeriesKey> {
    (0..count)
        .map(|i| SeriesKey::new(format!("root.sg.d{}", i % 10), format!("s{}", i)))
        .collect()
}

/// Builds an engine holding `count` series, half flushed to segments.
fn setup_engine(
    count: usize,
) -> (TempDir, Arc<InMemoryLastCache>, Arc<StorageEngine>, Vec<SeriesKey>) {
    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(InMemoryLastCache::default());
    let config = EngineConfig::new(temp_dir.path())
        .with_memtable_flush_points(u64::MAX)
        .with_compaction(CompactionConfig::default().with_max_segments(usize::MAX));
    let engine = StorageEngine::open(config)
        .unwrap()
        .with_last_cache(cache.clone());
    engine.set_storage_group("root.sg").unwrap();

    let keys = series_keys(count);
    for ts in 0..POINTS_PER_SERIES {
        for key in &keys {
            let pair = TimeValuePair::new(ts, TypedValue::Double(ts as f64 * 0.5));
            engine.insert(key, DataType::Double, pair).unwrap();
        }
        if ts == POINTS_PER_SERIES / 2 {
            engine.flush("root.sg").unwrap();
        }
    }
    (temp_dir, cache, Arc::new(engine), keys)
}

fn bench_fast_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("last_query_fast_path");
    for count in [10, 100, 1000] {
        let (_dir, cache, engine, keys) = setup_engine(count);
        let executor = LastQueryExecutor::new(cache, engine, ResolverConfig::default());
        let plan = LastQueryPlan::new(keys, vec![DataType::Double; count]);
        let ctx = QueryContext::new();
        // Warm the cache.
        executor.execute(&ctx, &plan).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(count), &plan, |b, plan| {
            b.iter(|| executor.execute(&ctx, black_box(plan)).unwrap())
        });
    }
    group.finish();
}

fn bench_scan_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("last_query_scan_path");
    group.sample_size(20);
    for count in [10, 100] {
        let (_dir, cache, engine, keys) = setup_engine(count);
        let executor = LastQueryExecutor::new(
            cache,
            engine,
            ResolverConfig::default().with_cache_enabled(false),
        );
        let plan = LastQueryPlan::new(keys, vec![DataType::Double; count]);
        let ctx = QueryContext::new();

        group.bench_with_input(BenchmarkId::from_parameter(count), &plan, |b, plan| {
            b.iter(|| executor.execute(&ctx, black_box(plan)).unwrap())
        });
    }
    group.finish();
}

fn bench_assemble_descending(c: &mut Criterion) {
    let keys = series_keys(1000);
    let slots: Vec<_> = (0..keys.len() as i64)
        .map(|i| Some(TimeValuePair::new((i * 7919) % 1000, TypedValue::Int64(i))))
        .collect();

    c.bench_function("assemble_descending_1k", |b| {
        b.iter(|| assemble(black_box(&keys), slots.clone(), false))
    });
}

criterion_group!(
    benches,
    bench_fast_path,
    bench_scan_path,
    bench_assemble_descending,
);
criterion_main!(benches);

//! Property-based tests for last-value resolution.
//!
//! Random batches of series, each with a random set of points split between
//! flushed segments and the memtable, are resolved and assembled. The result
//! must stay aligned with the input and rows must follow the requested order.

use alopex_lastvalue::{
    assemble, DataType, EngineConfig, InMemoryLastCache, LastQueryExecutor, LastQueryPlan,
    QueryContext, ResolverConfig, SeriesKey, StorageEngine, TimeValuePair, TypedValue,
};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct SeriesCase {
    flushed: Vec<i64>,
    buffered: Vec<i64>,
}

fn series_case_strategy() -> impl Strategy<Value = SeriesCase> {
    (
        prop::collection::vec(0i64..1_000, 0..5),
        prop::collection::vec(0i64..1_000, 0..5),
    )
        .prop_map(|(flushed, buffered)| SeriesCase { flushed, buffered })
}

fn batch_strategy() -> impl Strategy<Value = (Vec<SeriesCase>, Vec<usize>, bool)> {
    prop::collection::vec(series_case_strategy(), 1..6).prop_flat_map(|cases| {
        let len = cases.len();
        (
            Just(cases),
            prop::collection::vec(0..len, 1..8),
            any::<bool>(),
        )
    })
}

fn key(index: usize) -> SeriesKey {
    SeriesKey::new(format!("root.sg.d{}", index % 2), format!("s{}", index))
}

fn value_at(index: usize, ts: i64) -> TypedValue {
    TypedValue::Int64(ts * 100 + index as i64)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Slots stay aligned with the input and hold each series' newest point.
    #[test]
    fn test_resolve_aligned_with_input((cases, positions, ascending) in batch_strategy()) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(InMemoryLastCache::default());
        let engine = StorageEngine::open(EngineConfig::new(dir.path()))
            .unwrap()
            .with_last_cache(cache.clone());
        engine.set_storage_group("root.sg").unwrap();

        for (index, case) in cases.iter().enumerate() {
            for &ts in &case.flushed {
                engine
                    .insert(&key(index), DataType::Int64, TimeValuePair::new(ts, value_at(index, ts)))
                    .unwrap();
            }
        }
        engine.flush_all().unwrap();
        for (index, case) in cases.iter().enumerate() {
            for &ts in &case.buffered {
                engine
                    .insert(&key(index), DataType::Int64, TimeValuePair::new(ts, value_at(index, ts)))
                    .unwrap();
            }
        }

        let series: Vec<SeriesKey> = positions.iter().map(|&index| key(index)).collect();
        let plan = LastQueryPlan::new(series.clone(), vec![DataType::Int64; series.len()])
            .with_ascending(ascending);
        let executor = LastQueryExecutor::new(cache, Arc::new(engine), ResolverConfig::default());
        let ctx = QueryContext::new();

        let scanned = executor.resolver().resolve(&ctx, &plan).unwrap();
        prop_assert_eq!(scanned.len(), positions.len());
        for (slot, &index) in scanned.iter().zip(&positions) {
            let case = &cases[index];
            let expected = case
                .flushed
                .iter()
                .chain(&case.buffered)
                .max()
                .map(|&ts| TimeValuePair::new(ts, value_at(index, ts)));
            prop_assert_eq!(slot, &expected);
        }

        // A second pass is served from the cache and agrees with the scan.
        let cached = executor.resolver().resolve(&ctx, &plan).unwrap();
        prop_assert_eq!(&cached, &scanned);

        let rows = assemble(&series, scanned.clone(), ascending);
        prop_assert_eq!(rows.len(), scanned.iter().filter(|slot| slot.is_some()).count());
        if ascending {
            let expected: Vec<i64> = scanned.iter().flatten().map(|pair| pair.timestamp).collect();
            let actual: Vec<i64> = rows.iter().map(|row| row.timestamp).collect();
            prop_assert_eq!(actual, expected);
        } else {
            prop_assert!(rows.windows(2).all(|pair| pair[0].timestamp >= pair[1].timestamp));
        }
    }
}

//! Last-value resolver: cache first, pinned storage scan for the rest.
//!
//! # Algorithm
//!
//! ```text
//! validate plan ─► read cache per position ─► all resolved? ──yes──► return
//!                                                 │ no
//!                                                 ▼
//!                   acquire(regions of misses) ─► open one reader per miss
//!                                                 │
//!                   release (PinReferences) ◄─────┘
//!                                                 ▼
//!                   scan readers ─► write back to cache ─► return
//! ```
//!
//! The returned list always has one slot per input position.

use crate::cache::{CacheLookup, LastCache};
use crate::context::QueryContext;
use crate::error::Result;
use crate::filter::{satisfy, Filter};
use crate::plan::LastQueryPlan;
use crate::series::{LastSlot, SeriesKey};
use crate::snapshot::{LastPointReader, ReaderRequest, SnapshotCoordinator, SnapshotStrategy};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Configuration for [`LastValueResolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Serve hits from the last cache and write scan results back. Default: true.
    pub cache_enabled: bool,
    /// Lock hold strategy for scans. Default: [`SnapshotStrategy::PinReferences`].
    pub snapshot_strategy: SnapshotStrategy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            snapshot_strategy: SnapshotStrategy::default(),
        }
    }
}

impl ResolverConfig {
    /// Enables or disables the last cache.
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Sets the snapshot strategy.
    pub fn with_snapshot_strategy(mut self, strategy: SnapshotStrategy) -> Self {
        self.snapshot_strategy = strategy;
        self
    }
}

/// Resolves the last point of each series in a batch.
pub struct LastValueResolver<S: SnapshotCoordinator> {
    cache: Arc<dyn LastCache>,
    coordinator: Arc<S>,
    config: ResolverConfig,
}

impl<S: SnapshotCoordinator> LastValueResolver<S> {
    /// Creates a resolver over the given cache and storage coordinator.
    pub fn new(cache: Arc<dyn LastCache>, coordinator: Arc<S>, config: ResolverConfig) -> Self {
        Self {
            cache,
            coordinator,
            config,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolves one slot per series of `plan`, positionally aligned.
    ///
    /// # Errors
    ///
    /// Fails the whole batch on an invalid plan or filter, a snapshot
    /// acquisition failure, a scan failure, or cancellation. Cache read
    /// failures are absorbed as misses.
    pub fn resolve(&self, ctx: &QueryContext, plan: &LastQueryPlan) -> Result<Vec<LastSlot>> {
        plan.validate()?;

        let series = plan.series();
        let (mut slots, missed) = self.read_from_cache(series, plan.filter());
        if missed.is_empty() {
            debug!(
                "Query {}: all {} series resolved from last cache",
                ctx.query_id(),
                series.len()
            );
            return Ok(slots);
        }

        debug!(
            "Query {}: {} of {} series need a storage scan",
            ctx.query_id(),
            missed.len(),
            series.len()
        );
        let scanned = self.scan_missed(ctx, plan, &missed)?;

        let mut written: HashSet<&SeriesKey> = HashSet::new();
        for (index, slot) in missed.into_iter().zip(scanned) {
            let key = &series[index];
            if self.config.cache_enabled && written.insert(key) {
                self.cache.write(key, slot.clone());
            }
            slots[index] = slot;
        }

        Ok(slots)
    }

    /// Reads every position from the cache; returns the slots and the
    /// positions that still need a scan.
    fn read_from_cache(
        &self,
        series: &[SeriesKey],
        filter: Option<&Filter>,
    ) -> (Vec<LastSlot>, Vec<usize>) {
        let mut slots = vec![None; series.len()];
        let mut missed = Vec::new();

        if !self.config.cache_enabled {
            missed.extend(0..series.len());
            return (slots, missed);
        }

        for (index, key) in series.iter().enumerate() {
            match self.cache.read(key) {
                Ok(CacheLookup::Cold) => missed.push(index),
                Ok(CacheLookup::Empty) => {}
                Ok(CacheLookup::Point(pair)) => {
                    // A cached point failing the filter resolves to no row.
                    if satisfy(filter, &pair) {
                        slots[index] = Some(pair);
                    }
                }
                Err(err) => {
                    warn!("Last cache read failed for {}, scanning instead: {}", key, err);
                    missed.push(index);
                }
            }
        }

        (slots, missed)
    }

    fn scan_missed(
        &self,
        ctx: &QueryContext,
        plan: &LastQueryPlan,
        missed: &[usize],
    ) -> Result<Vec<LastSlot>> {
        let series = plan.series();
        let keys: Vec<&SeriesKey> = missed.iter().map(|&index| &series[index]).collect();
        let hold_for_scan = self.config.snapshot_strategy == SnapshotStrategy::HoldForScan
            || !self.coordinator.supports_reference_pinning();

        let locked_at = Instant::now();
        let guard = self.coordinator.acquire(&keys)?;
        let readers = match self.open_readers(&guard, ctx, plan, missed) {
            Ok(readers) => readers,
            Err(err) => {
                self.coordinator.release(guard);
                return Err(err);
            }
        };

        if hold_for_scan {
            let scanned = scan_readers(ctx, readers);
            self.coordinator.release(guard);
            debug!(
                "Query {}: held region lock for {:?} including scan",
                ctx.query_id(),
                locked_at.elapsed()
            );
            return scanned;
        }

        self.coordinator.release(guard);
        debug!(
            "Query {}: pinned {} readers in {:?}",
            ctx.query_id(),
            readers.len(),
            locked_at.elapsed()
        );
        scan_readers(ctx, readers)
    }

    fn open_readers(
        &self,
        guard: &S::Guard,
        ctx: &QueryContext,
        plan: &LastQueryPlan,
        missed: &[usize],
    ) -> Result<Vec<S::Reader>> {
        let mut readers = Vec::with_capacity(missed.len());
        for &index in missed {
            let key = &plan.series()[index];
            let request = ReaderRequest {
                series: key,
                data_type: plan.data_types()[index],
                measurements: plan.device_measurements().get(key.device()),
            };
            readers.push(self.coordinator.open_reader(guard, request, ctx)?);
        }
        Ok(readers)
    }
}

fn scan_readers<R: LastPointReader>(ctx: &QueryContext, readers: Vec<R>) -> Result<Vec<LastSlot>> {
    let mut slots = Vec::with_capacity(readers.len());
    for mut reader in readers {
        ctx.check_aborted()?;
        slots.push(reader.read_last_point()?);
    }
    Ok(slots)
}

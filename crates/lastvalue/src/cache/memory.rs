//! Sharded in-memory last cache.

use super::{CacheLookup, LastCache};
use crate::error::Result;
use crate::series::{SeriesKey, TimeValuePair};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default number of cache shards.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Configuration for [`InMemoryLastCache`].
#[derive(Debug, Clone)]
pub struct LastCacheConfig {
    /// Number of independently locked shards. Default: 16.
    pub shard_count: usize,
    /// Reject writes whose point is older than the cached point. Default: true.
    pub monotonic_writes: bool,
}

impl Default for LastCacheConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            monotonic_writes: true,
        }
    }
}

impl LastCacheConfig {
    /// Sets the shard count.
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Enables or disables the monotonic write guard.
    pub fn with_monotonic_writes(mut self, enabled: bool) -> Self {
        self.monotonic_writes = enabled;
        self
    }
}

/// Counters for cache activity.
#[derive(Debug, Default)]
pub struct LastCacheStats {
    /// Reads that found an entry (point or "no data").
    pub hits: AtomicU64,
    /// Reads that found nothing.
    pub misses: AtomicU64,
    /// Writes that were applied.
    pub writes: AtomicU64,
    /// Writes rejected by the monotonic guard.
    pub rejected_writes: AtomicU64,
}

impl LastCacheStats {
    /// Gets the hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Gets the miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Gets the applied write count.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Gets the rejected write count.
    pub fn rejected_writes(&self) -> u64 {
        self.rejected_writes.load(Ordering::Relaxed)
    }
}

type Shard = RwLock<HashMap<SeriesKey, Option<TimeValuePair>>>;

/// Process-wide last cache keyed by series.
pub struct InMemoryLastCache {
    shards: Vec<Shard>,
    config: LastCacheConfig,
    stats: LastCacheStats,
}

impl InMemoryLastCache {
    /// Creates a cache with the given configuration.
    pub fn new(config: LastCacheConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            config,
            stats: LastCacheStats::default(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LastCacheConfig {
        &self.config
    }

    /// Returns the activity counters.
    pub fn stats(&self) -> &LastCacheStats {
        &self.stats
    }

    /// Returns the number of cached series.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Returns true if no series is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, key: &SeriesKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Decides whether `incoming` may replace `current`.
    fn accepts(&self, current: Option<&Option<TimeValuePair>>, incoming: &Option<TimeValuePair>) -> bool {
        if !self.config.monotonic_writes {
            return true;
        }
        match (current, incoming) {
            (None, _) | (Some(None), _) => true,
            // "No data" never clobbers a known point.
            (Some(Some(_)), None) => false,
            (Some(Some(cached)), Some(point)) => point.timestamp >= cached.timestamp,
        }
    }
}

impl Default for InMemoryLastCache {
    fn default() -> Self {
        Self::new(LastCacheConfig::default())
    }
}

impl LastCache for InMemoryLastCache {
    fn read(&self, key: &SeriesKey) -> Result<CacheLookup> {
        let shard = self.shard(key).read();
        match shard.get(key) {
            Some(slot) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(CacheLookup::from_slot(slot.clone()))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(CacheLookup::Cold)
            }
        }
    }

    fn write(&self, key: &SeriesKey, point: Option<TimeValuePair>) {
        let mut shard = self.shard(key).write();
        if self.accepts(shard.get(key), &point) {
            shard.insert(key.clone(), point);
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.rejected_writes.fetch_add(1, Ordering::Relaxed);
            debug!("Rejected stale last cache write for {}", key);
        }
    }

    fn update_on_ingest(&self, key: &SeriesKey, point: TimeValuePair) {
        let mut shard = self.shard(key).write();
        let replace = match shard.get(key) {
            None => false,
            Some(None) => true,
            Some(Some(cached)) => point.timestamp >= cached.timestamp,
        };
        if replace {
            shard.insert(key.clone(), Some(point));
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn invalidate(&self, key: &SeriesKey) {
        self.shard(key).write().remove(key);
    }

    fn invalidate_storage_group(&self, storage_group: &str) {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            let before = shard.len();
            shard.retain(|key, _| !key.is_under(storage_group));
            removed += before - shard.len();
        }
        debug!(
            "Invalidated {} last cache entries under {}",
            removed, storage_group
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TypedValue;

    fn key(device: &str, measurement: &str) -> SeriesKey {
        SeriesKey::new(device, measurement)
    }

    fn point(ts: i64, v: i64) -> TimeValuePair {
        TimeValuePair::new(ts, TypedValue::Int64(v))
    }

    #[test]
    fn test_read_distinguishes_cold_and_empty() {
        let cache = InMemoryLastCache::default();
        let k = key("root.sg.d1", "s1");
        assert_eq!(cache.read(&k).unwrap(), CacheLookup::Cold);

        cache.write(&k, None);
        assert_eq!(cache.read(&k).unwrap(), CacheLookup::Empty);

        cache.write(&k, Some(point(10, 1)));
        assert_eq!(cache.read(&k).unwrap(), CacheLookup::Point(point(10, 1)));
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 2);
    }

    #[test]
    fn test_monotonic_write_rejects_older_point() {
        let cache = InMemoryLastCache::default();
        let k = key("root.sg.d1", "s1");
        cache.write(&k, Some(point(20, 2)));
        cache.write(&k, Some(point(10, 1)));
        assert_eq!(cache.read(&k).unwrap(), CacheLookup::Point(point(20, 2)));

        cache.write(&k, None);
        assert_eq!(cache.read(&k).unwrap(), CacheLookup::Point(point(20, 2)));
        assert_eq!(cache.stats().rejected_writes(), 2);

        // Equal timestamps are accepted (same point re-observed).
        cache.write(&k, Some(point(20, 3)));
        assert_eq!(cache.read(&k).unwrap(), CacheLookup::Point(point(20, 3)));
    }

    #[test]
    fn test_last_writer_wins_without_monotonic_guard() {
        let cache = InMemoryLastCache::new(LastCacheConfig::default().with_monotonic_writes(false));
        let k = key("root.sg.d1", "s1");
        cache.write(&k, Some(point(20, 2)));
        cache.write(&k, Some(point(10, 1)));
        assert_eq!(cache.read(&k).unwrap(), CacheLookup::Point(point(10, 1)));
    }

    #[test]
    fn test_update_on_ingest_keeps_cold_entries_cold() {
        let cache = InMemoryLastCache::default();
        let cold = key("root.sg.d1", "s1");
        let empty = key("root.sg.d1", "s2");
        let warm = key("root.sg.d1", "s3");
        cache.write(&empty, None);
        cache.write(&warm, Some(point(50, 5)));

        cache.update_on_ingest(&cold, point(60, 6));
        cache.update_on_ingest(&empty, point(60, 6));
        cache.update_on_ingest(&warm, point(40, 4));

        assert_eq!(cache.read(&cold).unwrap(), CacheLookup::Cold);
        assert_eq!(cache.read(&empty).unwrap(), CacheLookup::Point(point(60, 6)));
        assert_eq!(cache.read(&warm).unwrap(), CacheLookup::Point(point(50, 5)));
    }

    #[test]
    fn test_invalidate_storage_group() {
        let cache = InMemoryLastCache::new(LastCacheConfig::default().with_shard_count(4));
        cache.write(&key("root.sg1.d1", "s1"), Some(point(1, 1)));
        cache.write(&key("root.sg1.d2", "s1"), None);
        cache.write(&key("root.sg10.d1", "s1"), Some(point(1, 1)));
        assert_eq!(cache.len(), 3);

        cache.invalidate_storage_group("root.sg1");
        assert_eq!(cache.len(), 1);
        assert!(!cache.read(&key("root.sg10.d1", "s1")).unwrap().is_cold());

        cache.invalidate(&key("root.sg10.d1", "s1"));
        assert!(cache.is_empty());
    }
}

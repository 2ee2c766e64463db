//! Per-series last point cache.
//!
//! The resolver consumes the cache through the [`LastCache`] trait so the
//! cache can be injected (process-wide in production, per-test in tests).
//! [`InMemoryLastCache`] is the sharded in-process implementation.
//!
//! # Concurrency contract
//!
//! Reads and writes of different keys never interfere. Concurrent writers of
//! the same key race and the last write wins; the in-memory cache narrows the
//! race by rejecting writes older than the cached point.

mod memory;

pub use memory::{InMemoryLastCache, LastCacheConfig, LastCacheStats};

use crate::error::Result;
use crate::series::{SeriesKey, TimeValuePair};

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Nothing has ever been cached for the series.
    Cold,
    /// The series was previously determined to have no data.
    Empty,
    /// The cached last point.
    Point(TimeValuePair),
}

impl CacheLookup {
    /// Builds a lookup from a stored slot.
    pub fn from_slot(slot: Option<TimeValuePair>) -> Self {
        match slot {
            Some(pair) => Self::Point(pair),
            None => Self::Empty,
        }
    }

    /// Returns true if nothing was cached.
    pub fn is_cold(&self) -> bool {
        matches!(self, Self::Cold)
    }
}

/// Store of the latest known point per series.
pub trait LastCache: Send + Sync {
    /// Reads the cached state of a series.
    ///
    /// # Errors
    ///
    /// Returns [`crate::LastQueryError::CacheRead`] when the cache slot cannot be
    /// located. Callers treat this as a miss.
    fn read(&self, key: &SeriesKey) -> Result<CacheLookup>;

    /// Records the outcome of a scan. `None` records "no data".
    fn write(&self, key: &SeriesKey, point: Option<TimeValuePair>);

    /// Refreshes a warm entry with a freshly ingested point.
    ///
    /// Cold entries stay cold: an ingested point is not known to be the
    /// latest until a scan has established what storage already holds.
    fn update_on_ingest(&self, key: &SeriesKey, point: TimeValuePair) {
        match self.read(key) {
            Ok(CacheLookup::Empty) => self.write(key, Some(point)),
            Ok(CacheLookup::Point(cached)) if cached.timestamp <= point.timestamp => {
                self.write(key, Some(point))
            }
            _ => {}
        }
    }

    /// Drops the entry of a series.
    fn invalidate(&self, key: &SeriesKey);

    /// Drops every entry whose device lies under `storage_group`.
    fn invalidate_storage_group(&self, storage_group: &str);
}

//! Snapshot coordination between last-value queries and compaction.
//!
//! Compaction rewrites the physical resources of a storage region. A query
//! that has to scan storage first locks the regions backing its missed
//! series, pins the resources they currently consist of into readers, and
//! releases the lock before scanning. The lock is held for the duration of
//! snapshot capture only, unless the strategy is [`SnapshotStrategy::HoldForScan`].

use crate::context::QueryContext;
use crate::error::Result;
use crate::series::{DataType, LastSlot, SeriesKey};
use std::collections::BTreeSet;

/// How long the region lock is held relative to scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotStrategy {
    /// Release after readers are constructed; readers keep their resources
    /// alive by reference. Requires reference-stable pinning.
    #[default]
    PinReferences,
    /// Keep the lock until every reader has been scanned.
    HoldForScan,
}

/// Parameters for constructing one pinned reader.
#[derive(Debug, Clone, Copy)]
pub struct ReaderRequest<'a> {
    /// Series to read.
    pub series: &'a SeriesKey,
    /// Declared data type of the series.
    pub data_type: DataType,
    /// All measurements of the series' device that the batch queries.
    pub measurements: Option<&'a BTreeSet<String>>,
}

/// Reader bound to a pinned snapshot of one series.
pub trait LastPointReader: Send {
    /// Returns the visible point with the greatest timestamp, or `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pinned resources cannot be read.
    fn read_last_point(&mut self) -> Result<LastSlot>;
}

/// Locks storage regions and builds readers over a pinned snapshot.
pub trait SnapshotCoordinator: Send + Sync {
    /// Lock over the regions of a batch. Dropping it releases the lock.
    type Guard;
    /// Reader produced while the guard is held.
    type Reader: LastPointReader;

    /// Locks the regions backing `series` against compaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::LastQueryError::SnapshotAcquisition`] or
    /// [`crate::LastQueryError::StorageGroupNotSet`] if a region cannot be resolved.
    fn acquire(&self, series: &[&SeriesKey]) -> Result<Self::Guard>;

    /// Constructs a reader over the snapshot held by `guard`.
    fn open_reader(
        &self,
        guard: &Self::Guard,
        request: ReaderRequest<'_>,
        ctx: &QueryContext,
    ) -> Result<Self::Reader>;

    /// Releases the lock.
    fn release(&self, guard: Self::Guard) {
        drop(guard);
    }

    /// Returns true if readers stay valid after the guard is released.
    fn supports_reference_pinning(&self) -> bool {
        true
    }
}

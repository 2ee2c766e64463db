//! Last-point readers over a pinned device snapshot.

use crate::error::{LastQueryError, Result};
use crate::series::{DataType, LastSlot, SeriesKey, TimeValuePair, Timestamp};
use crate::snapshot::LastPointReader;
use crate::storage::group::Tombstone;
use crate::storage::memtable::BufferedLast;
use crate::storage::segment::{SegmentFile, SeriesBlockEntry};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Everything a last-point read of one device needs, captured at once.
///
/// Holds buffered last points by value and segments by reference, so it
/// stays readable after the merge lock is released and after compaction
/// replaces the segments.
#[derive(Debug)]
pub struct DeviceSnapshot {
    measurements: BTreeSet<String>,
    memtable: HashMap<String, BufferedLast>,
    segments: Vec<Arc<SegmentFile>>,
    tombstones: Vec<Tombstone>,
}

impl DeviceSnapshot {
    /// Creates a snapshot from captured parts.
    pub fn new(
        measurements: BTreeSet<String>,
        memtable: HashMap<String, BufferedLast>,
        segments: Vec<Arc<SegmentFile>>,
        tombstones: Vec<Tombstone>,
    ) -> Self {
        Self {
            measurements,
            memtable,
            segments,
            tombstones,
        }
    }

    /// Returns true if the snapshot captured `measurement`.
    pub fn covers(&self, measurement: &str) -> bool {
        self.measurements.contains(measurement)
    }

    /// Returns the number of pinned segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn deleted_up_to(&self, series: &SeriesKey, segment_id: u64) -> Option<Timestamp> {
        self.tombstones
            .iter()
            .filter(|t| &t.series == series && t.applies_to(segment_id))
            .map(|t| t.up_to)
            .max()
    }
}

struct Candidate<'a> {
    segment: &'a Arc<SegmentFile>,
    entry: &'a SeriesBlockEntry,
}

/// Reader of one series over a [`DeviceSnapshot`].
#[derive(Debug)]
pub struct SeriesLastReader {
    series: SeriesKey,
    data_type: DataType,
    snapshot: Arc<DeviceSnapshot>,
}

impl SeriesLastReader {
    /// Creates a reader of `series` expecting values of `data_type`.
    pub fn new(series: SeriesKey, data_type: DataType, snapshot: Arc<DeviceSnapshot>) -> Self {
        Self {
            series,
            data_type,
            snapshot,
        }
    }

    /// Returns the pinned snapshot.
    pub fn snapshot(&self) -> &Arc<DeviceSnapshot> {
        &self.snapshot
    }

    fn check_type(&self, actual: DataType) -> Result<()> {
        if actual != self.data_type {
            return Err(LastQueryError::DataTypeMismatch {
                series: self.series.full_path(),
                expected: self.data_type,
                actual,
            });
        }
        Ok(())
    }
}

impl LastPointReader for SeriesLastReader {
    fn read_last_point(&mut self) -> Result<LastSlot> {
        // Buffered data is newer than any segment and wins ties.
        let mut best: Option<(TimeValuePair, u64)> = None;
        if let Some(buffered) = self.snapshot.memtable.get(self.series.measurement()) {
            self.check_type(buffered.data_type)?;
            best = Some((buffered.point.clone(), u64::MAX));
        }

        let mut candidates: Vec<Candidate<'_>> = self
            .snapshot
            .segments
            .iter()
            .filter_map(|segment| {
                segment
                    .entry(&self.series)
                    .map(|entry| Candidate { segment, entry })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.entry
                .max_ts
                .cmp(&a.entry.max_ts)
                .then_with(|| b.segment.id().cmp(&a.segment.id()))
        });

        for candidate in candidates {
            self.check_type(candidate.entry.data_type)?;
            let id = candidate.segment.id();
            if let Some((point, rank)) = &best {
                let max_ts = candidate.entry.max_ts;
                if max_ts < point.timestamp || (max_ts == point.timestamp && id < *rank) {
                    break;
                }
            }

            let deleted = self.snapshot.deleted_up_to(&self.series, id);
            let Some(point) = candidate.segment.last_point(candidate.entry, deleted)? else {
                continue;
            };
            let wins = match &best {
                None => true,
                Some((current, rank)) => {
                    point.timestamp > current.timestamp
                        || (point.timestamp == current.timestamp && id > *rank)
                }
            };
            if wins {
                best = Some((point, id));
            }
        }

        Ok(best.map(|(point, _)| point))
    }
}

//! Per-device time index over segments.
//!
//! Maps each device to the segments holding its data and the time range
//! they cover, so snapshot capture pins only the segments a device needs.

use crate::series::Timestamp;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// First timestamp.
    pub start: Timestamp,
    /// Last timestamp.
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates an inclusive range.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if the two ranges share at least one timestamp.
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= end && start <= self.end
    }
}

/// Time range of one device within one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTimeRange {
    /// Segment id.
    pub segment_id: u64,
    /// First timestamp of the device in the segment.
    pub start: Timestamp,
    /// Last timestamp of the device in the segment.
    pub end: Timestamp,
}

/// Index from devices to the segments holding their data.
pub trait DeviceTimeIndexer: Send + Sync {
    /// Records that `segment_id` holds data of `device` within `[start, end]`.
    fn add_index_for_device(&self, device: &str, segment_id: u64, start: Timestamp, end: Timestamp);

    /// Forgets every range of a segment.
    fn delete_index_for_segment(&self, segment_id: u64);

    /// Returns the segments of `device`, restricted to those overlapping
    /// `time_range` when one is given.
    fn filter_by_device(&self, device: &str, time_range: Option<TimeRange>) -> Vec<SegmentTimeRange>;
}

/// [`DeviceTimeIndexer`] kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeviceTimeIndexer {
    devices: RwLock<HashMap<String, Vec<SegmentTimeRange>>>,
}

impl InMemoryDeviceTimeIndexer {
    /// Creates an empty indexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of indexed devices.
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }
}

impl DeviceTimeIndexer for InMemoryDeviceTimeIndexer {
    fn add_index_for_device(&self, device: &str, segment_id: u64, start: Timestamp, end: Timestamp) {
        let mut devices = self.devices.write();
        let ranges = devices.entry(device.to_string()).or_default();
        match ranges.iter_mut().find(|range| range.segment_id == segment_id) {
            Some(range) => {
                range.start = range.start.min(start);
                range.end = range.end.max(end);
            }
            None => ranges.push(SegmentTimeRange {
                segment_id,
                start,
                end,
            }),
        }
    }

    fn delete_index_for_segment(&self, segment_id: u64) {
        let mut devices = self.devices.write();
        devices.retain(|_, ranges| {
            ranges.retain(|range| range.segment_id != segment_id);
            !ranges.is_empty()
        });
    }

    fn filter_by_device(&self, device: &str, time_range: Option<TimeRange>) -> Vec<SegmentTimeRange> {
        let devices = self.devices.read();
        let Some(ranges) = devices.get(device) else {
            return Vec::new();
        };
        ranges
            .iter()
            .filter(|range| time_range.map_or(true, |t| t.overlaps(range.start, range.end)))
            .copied()
            .collect()
    }
}

/// Registry of one indexer per storage group.
#[derive(Default)]
pub struct IndexerRegistry {
    indexers: RwLock<HashMap<String, Arc<dyn DeviceTimeIndexer>>>,
}

impl IndexerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the indexer of a storage group, replacing any previous one.
    pub fn add_indexer(&self, storage_group: &str, indexer: Arc<dyn DeviceTimeIndexer>) {
        self.indexers
            .write()
            .insert(storage_group.to_string(), indexer);
    }

    /// Removes the indexer of a storage group.
    pub fn remove_indexer(&self, storage_group: &str) -> Option<Arc<dyn DeviceTimeIndexer>> {
        self.indexers.write().remove(storage_group)
    }

    /// Returns the indexer of a storage group.
    ///
    /// Logs a warning and returns `None` when the name is not registered.
    pub fn indexer(&self, storage_group: &str) -> Option<Arc<dyn DeviceTimeIndexer>> {
        let found = self.indexers.read().get(storage_group).cloned();
        if found.is_none() {
            warn!("No time index registered for storage group {}", storage_group);
        }
        found
    }

    /// Returns the number of registered storage groups.
    pub fn len(&self) -> usize {
        self.indexers.read().len()
    }

    /// Returns true if no indexer is registered.
    pub fn is_empty(&self) -> bool {
        self.indexers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_filter() {
        let indexer = InMemoryDeviceTimeIndexer::new();
        indexer.add_index_for_device("root.sg.d1", 1, 0, 100);
        indexer.add_index_for_device("root.sg.d1", 2, 200, 300);
        indexer.add_index_for_device("root.sg.d2", 2, 50, 60);

        assert_eq!(indexer.filter_by_device("root.sg.d1", None).len(), 2);
        let recent = indexer.filter_by_device("root.sg.d1", Some(TimeRange::new(150, 250)));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].segment_id, 2);
        assert!(indexer.filter_by_device("root.sg.d9", None).is_empty());
    }

    #[test]
    fn test_add_widens_existing_range() {
        let indexer = InMemoryDeviceTimeIndexer::new();
        indexer.add_index_for_device("root.sg.d1", 1, 10, 20);
        indexer.add_index_for_device("root.sg.d1", 1, 5, 15);
        let ranges = indexer.filter_by_device("root.sg.d1", None);
        assert_eq!(
            ranges,
            vec![SegmentTimeRange {
                segment_id: 1,
                start: 5,
                end: 20
            }]
        );
    }

    #[test]
    fn test_delete_segment() {
        let indexer = InMemoryDeviceTimeIndexer::new();
        indexer.add_index_for_device("root.sg.d1", 1, 0, 10);
        indexer.add_index_for_device("root.sg.d2", 1, 0, 10);
        indexer.add_index_for_device("root.sg.d2", 3, 20, 30);

        indexer.delete_index_for_segment(1);
        assert_eq!(indexer.device_count(), 1);
        assert_eq!(indexer.filter_by_device("root.sg.d2", None)[0].segment_id, 3);
    }

    #[test]
    fn test_registry_lookup_by_name() {
        let registry = IndexerRegistry::new();
        registry.add_indexer("root.sg", Arc::new(InMemoryDeviceTimeIndexer::new()));
        assert_eq!(registry.len(), 1);

        assert!(registry.indexer("root.sg").is_some());
        assert!(registry.indexer("root.sg.d1").is_none());
        assert!(registry.indexer("root.other").is_none());

        assert!(registry.remove_indexer("root.sg").is_some());
        assert!(registry.indexer("root.sg").is_none());
        assert!(registry.remove_indexer("root.sg").is_none());
        assert!(registry.is_empty());
    }
}

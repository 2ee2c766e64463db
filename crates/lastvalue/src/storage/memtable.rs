//! In-memory buffer of a storage group.
//!
//! Points land here on ingestion and move to an immutable segment file on
//! flush. Deletions are applied to the buffer eagerly.

use crate::error::{LastQueryError, Result};
use crate::series::{DataType, SeriesKey, TimeValuePair, Timestamp, TypedValue};
use crate::storage::segment::SegmentWriter;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Buffered points of one series.
#[derive(Debug, Clone)]
pub struct SeriesBuffer {
    /// Data type of the series.
    pub data_type: DataType,
    /// Points keyed by timestamp; a later insert at the same timestamp wins.
    pub points: BTreeMap<Timestamp, Option<TypedValue>>,
}

impl SeriesBuffer {
    /// Returns the point with the greatest timestamp.
    pub fn last_point(&self) -> Option<TimeValuePair> {
        self.points
            .iter()
            .next_back()
            .map(|(&timestamp, value)| TimeValuePair {
                timestamp,
                value: value.clone(),
            })
    }
}

/// Last buffered point of a series, with its data type.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedLast {
    /// Data type of the series.
    pub data_type: DataType,
    /// Last point.
    pub point: TimeValuePair,
}

/// Mutable in-memory buffer of a storage group.
#[derive(Debug, Default)]
pub struct MemTable {
    series: HashMap<SeriesKey, SeriesBuffer>,
    point_count: u64,
}

impl MemTable {
    /// Creates an empty MemTable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of buffered points.
    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.series.values().all(|buffer| buffer.points.is_empty())
    }

    /// Inserts a point.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::DataTypeMismatch`] if the series already
    /// buffers points of another type.
    pub fn insert(&mut self, key: &SeriesKey, data_type: DataType, pair: TimeValuePair) -> Result<()> {
        let buffer = self
            .series
            .entry(key.clone())
            .or_insert_with(|| SeriesBuffer {
                data_type,
                points: BTreeMap::new(),
            });
        if buffer.data_type != data_type {
            return Err(LastQueryError::DataTypeMismatch {
                series: key.full_path(),
                expected: buffer.data_type,
                actual: data_type,
            });
        }
        if buffer.points.insert(pair.timestamp, pair.value).is_none() {
            self.point_count += 1;
        }
        Ok(())
    }

    /// Removes the points of `key` with timestamp `<= up_to`.
    pub fn delete(&mut self, key: &SeriesKey, up_to: Timestamp) -> usize {
        let Some(buffer) = self.series.get_mut(key) else {
            return 0;
        };
        let before = buffer.points.len();
        buffer.points = match up_to.checked_add(1) {
            Some(first_kept) => buffer.points.split_off(&first_kept),
            None => BTreeMap::new(),
        };
        let removed = before - buffer.points.len();
        self.point_count -= removed as u64;
        removed
    }

    /// Returns the last buffered point of each listed measurement of `device`.
    pub fn last_points_for_device(
        &self,
        device: &str,
        measurements: &BTreeSet<String>,
    ) -> HashMap<String, BufferedLast> {
        let mut lasts = HashMap::with_capacity(measurements.len());
        for measurement in measurements {
            let key = SeriesKey::new(device, measurement.as_str());
            if let Some(buffer) = self.series.get(&key) {
                if let Some(point) = buffer.last_point() {
                    lasts.insert(
                        measurement.clone(),
                        BufferedLast {
                            data_type: buffer.data_type,
                            point,
                        },
                    );
                }
            }
        }
        lasts
    }

    /// Writes all buffered series to a new segment file at `path`.
    ///
    /// Returns the number of series written.
    pub fn write_segment(&self, path: &Path) -> Result<usize> {
        let mut writer = SegmentWriter::new(path)?;
        let mut keys: Vec<&SeriesKey> = self.series.keys().collect();
        keys.sort_by_key(|key| (key.device().to_string(), key.measurement().to_string()));

        let mut written = 0;
        for key in keys {
            let buffer = &self.series[key];
            if buffer.points.is_empty() {
                continue;
            }
            writer.write_series(key, buffer.data_type, &buffer.points)?;
            written += 1;
        }
        writer.finish()?;
        Ok(written)
    }
}

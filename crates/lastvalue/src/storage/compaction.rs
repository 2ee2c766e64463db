//! Segment compaction.
//!
//! Merges every segment of a storage group into one. On duplicate
//! timestamps the segment with the higher id wins. Points hidden by a
//! tombstone are dropped from the output.

use crate::error::{LastQueryError, Result};
use crate::series::{DataType, SeriesKey, Timestamp, TypedValue};
use crate::storage::group::Tombstone;
use crate::storage::segment::{SegmentFile, SegmentWriter};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Default number of segments that triggers compaction.
pub const DEFAULT_MAX_SEGMENTS: usize = 4;

/// Compaction configuration.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Segment count above which a group needs compaction.
    pub max_segments: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_segments: DEFAULT_MAX_SEGMENTS,
        }
    }
}

impl CompactionConfig {
    /// Sets the segment count threshold.
    pub fn with_max_segments(mut self, max_segments: usize) -> Self {
        self.max_segments = max_segments;
        self
    }

    /// Returns true if a group with `segment_count` segments should compact.
    pub fn needs_compaction(&self, segment_count: usize) -> bool {
        segment_count > self.max_segments
    }
}

/// Compaction result metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Ids of the replaced segments.
    pub input_segments: Vec<u64>,
    /// Id of the merged segment.
    pub output_segment: u64,
    /// Total points written to the output.
    pub points_merged: u64,
    /// Duplicate points resolved in favour of the newer segment.
    pub duplicates_resolved: u64,
    /// Points dropped because a tombstone covers them.
    pub points_deleted: u64,
}

#[derive(Debug)]
struct BlockPoints {
    segment_id: u64,
    points: Vec<(Timestamp, Option<TypedValue>)>,
}

struct SeriesBlocks {
    data_type: DataType,
    blocks: Vec<BlockPoints>,
}

fn merge_blocks(blocks: &[BlockPoints]) -> (BTreeMap<Timestamp, Option<TypedValue>>, usize) {
    let mut merged: BTreeMap<Timestamp, (Option<TypedValue>, u64)> = BTreeMap::new();
    let mut duplicates = 0;

    for block in blocks {
        for (ts, value) in &block.points {
            match merged.get(ts) {
                Some((_, existing_id)) => {
                    if block.segment_id > *existing_id {
                        merged.insert(*ts, (value.clone(), block.segment_id));
                    }
                    duplicates += 1;
                }
                None => {
                    merged.insert(*ts, (value.clone(), block.segment_id));
                }
            }
        }
    }

    let final_map = merged
        .into_iter()
        .map(|(ts, (value, _))| (ts, value))
        .collect();
    (final_map, duplicates)
}

fn deleted_up_to(tombstones: &[&Tombstone], segment_id: u64) -> Option<Timestamp> {
    tombstones
        .iter()
        .filter(|tombstone| tombstone.applies_to(segment_id))
        .map(|tombstone| tombstone.up_to)
        .max()
}

/// Merges `inputs` into a new segment at `output_path`.
///
/// # Errors
///
/// Returns [`LastQueryError::CompactionError`] if the inputs disagree on the
/// data type of a series, or any error raised while reading or writing.
pub fn merge_segments(
    inputs: &[Arc<SegmentFile>],
    tombstones: &[Tombstone],
    output_path: &Path,
) -> Result<CompactionResult> {
    let mut by_series: HashMap<SeriesKey, SeriesBlocks> = HashMap::new();
    let mut result = CompactionResult::default();

    for segment in inputs {
        result.input_segments.push(segment.id());
        for entry in segment.entries() {
            let key = entry.series_key();
            let series_tombstones: Vec<&Tombstone> =
                tombstones.iter().filter(|t| t.series == key).collect();
            let deleted = deleted_up_to(&series_tombstones, segment.id());

            let mut points = segment.read_points(entry)?;
            if let Some(up_to) = deleted {
                let before = points.len();
                points.retain(|(ts, _)| *ts > up_to);
                result.points_deleted += (before - points.len()) as u64;
            }

            let series = by_series.entry(key).or_insert_with(|| SeriesBlocks {
                data_type: entry.data_type,
                blocks: Vec::new(),
            });
            if series.data_type != entry.data_type {
                return Err(LastQueryError::CompactionError(format!(
                    "Data type mismatch for series {}.{}: {:?} vs {:?}",
                    entry.device, entry.measurement, series.data_type, entry.data_type
                )));
            }
            series.blocks.push(BlockPoints {
                segment_id: segment.id(),
                points,
            });
        }
    }

    let mut keys: Vec<SeriesKey> = by_series.keys().cloned().collect();
    keys.sort_by(|a, b| {
        a.device()
            .cmp(b.device())
            .then_with(|| a.measurement().cmp(b.measurement()))
    });

    let mut writer = SegmentWriter::new(output_path)?;
    for key in keys {
        let Some(series) = by_series.get(&key) else {
            continue;
        };
        let (merged, duplicates) = merge_blocks(&series.blocks);
        if merged.is_empty() {
            continue;
        }
        writer.write_series(&key, series.data_type, &merged)?;
        result.points_merged += merged.len() as u64;
        result.duplicates_resolved += duplicates as u64;
    }
    writer.finish()?;

    Ok(result)
}

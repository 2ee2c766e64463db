//! Storage groups.
//!
//! A storage group owns a directory of segments, a memtable, the
//! tombstones of pending deletions and the merge lock. Queries hold the
//! merge lock shared while they pin a snapshot; compaction takes it
//! exclusively to swap its output in.

use crate::error::{LastQueryError, Result};
use crate::series::{DataType, SeriesKey, TimeValuePair, Timestamp};
use crate::storage::compaction::{merge_segments, CompactionResult};
use crate::storage::index::DeviceTimeIndexer;
use crate::storage::memtable::MemTable;
use crate::storage::reader::DeviceSnapshot;
use crate::storage::segment::{parse_segment_id, segment_file_name, SegmentFile, SEGMENT_EXTENSION};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deletion marker for segment data.
///
/// Hides points of `series` with timestamp `<= up_to` in every segment whose
/// id is at most `max_segment_id`. Segments created after the deletion are
/// not affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// Deleted series.
    pub series: SeriesKey,
    /// Greatest deleted timestamp.
    pub up_to: Timestamp,
    /// Greatest segment id allocated when the deletion happened.
    pub max_segment_id: u64,
}

impl Tombstone {
    /// Returns true if this tombstone hides data of the given segment.
    pub fn applies_to(&self, segment_id: u64) -> bool {
        segment_id <= self.max_segment_id
    }
}

#[derive(Debug)]
struct GroupState {
    memtable: MemTable,
    segments: Vec<Arc<SegmentFile>>,
    tombstones: Vec<Tombstone>,
    schema: HashMap<SeriesKey, DataType>,
    next_segment_id: u64,
    retired: bool,
}

impl GroupState {
    fn allocate_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }
}

/// A storage group: the unit of data placement and of the merge lock.
pub struct StorageGroup {
    name: String,
    dir: PathBuf,
    merge_lock: Arc<RwLock<()>>,
    state: RwLock<GroupState>,
    compacting: Mutex<()>,
    indexer: Arc<dyn DeviceTimeIndexer>,
}

impl StorageGroup {
    /// Opens the group at `dir`, loading any segments already present.
    ///
    /// Leftover temporary files from an interrupted flush or compaction are
    /// removed.
    pub fn open(name: &str, dir: &Path, indexer: Arc<dyn DeviceTimeIndexer>) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if let Some(id) = parse_segment_id(&path) {
                let segment = SegmentFile::open(&path, id)?;
                for (device, (start, end)) in segment.device_ranges() {
                    indexer.add_index_for_device(&device, id, start, end);
                }
                segments.push(Arc::new(segment));
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&format!(".{}.tmp", SEGMENT_EXTENSION)))
            {
                warn!("Removing incomplete segment {:?}", path);
                fs::remove_file(&path)?;
            }
        }
        segments.sort_by_key(|segment| segment.id());
        let next_segment_id = segments.last().map_or(1, |segment| segment.id() + 1);

        let mut schema = HashMap::new();
        for segment in &segments {
            for entry in segment.entries() {
                schema.entry(entry.series_key()).or_insert(entry.data_type);
            }
        }
        if !segments.is_empty() {
            info!("Loaded {} segments for storage group {}", segments.len(), name);
        }

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            merge_lock: Arc::new(RwLock::new(())),
            state: RwLock::new(GroupState {
                memtable: MemTable::new(),
                segments,
                tombstones: Vec::new(),
                schema,
                next_segment_id,
                retired: false,
            }),
            compacting: Mutex::new(()),
            indexer,
        })
    }

    /// Returns the storage group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the data directory of the group.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the merge lock.
    pub fn merge_lock(&self) -> &Arc<RwLock<()>> {
        &self.merge_lock
    }

    /// Returns the number of live segments.
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Returns the live segments, oldest first.
    pub fn segments(&self) -> Vec<Arc<SegmentFile>> {
        self.state.read().segments.clone()
    }

    /// Returns the number of points buffered in the memtable.
    pub fn memtable_points(&self) -> u64 {
        self.state.read().memtable.point_count()
    }

    /// Returns the number of pending tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.state.read().tombstones.len()
    }

    /// Returns the data type first recorded for a series.
    pub fn data_type_of(&self, key: &SeriesKey) -> Option<DataType> {
        self.state.read().schema.get(key).copied()
    }

    /// Buffers a point and returns the memtable point count afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::DataTypeMismatch`] if the value or the
    /// declared type disagrees with the type recorded for the series.
    pub fn insert(&self, key: &SeriesKey, data_type: DataType, pair: TimeValuePair) -> Result<u64> {
        if let Some(actual) = pair.data_type() {
            if actual != data_type {
                return Err(LastQueryError::DataTypeMismatch {
                    series: key.full_path(),
                    expected: data_type,
                    actual,
                });
            }
        }

        let mut state = self.state.write();
        if state.retired {
            return Err(LastQueryError::StorageGroupNotSet(self.name.clone()));
        }
        let recorded = *state.schema.entry(key.clone()).or_insert(data_type);
        if recorded != data_type {
            return Err(LastQueryError::DataTypeMismatch {
                series: key.full_path(),
                expected: recorded,
                actual: data_type,
            });
        }
        state.memtable.insert(key, data_type, pair)?;
        Ok(state.memtable.point_count())
    }

    /// Deletes the points of `key` with timestamp `<= up_to`.
    ///
    /// Buffered points are removed immediately; segment data is hidden by a
    /// tombstone.
    pub fn delete(&self, key: &SeriesKey, up_to: Timestamp) {
        let mut state = self.state.write();
        let removed = state.memtable.delete(key, up_to);
        let max_segment_id = state.next_segment_id - 1;
        let covers_segment = state
            .segments
            .iter()
            .any(|segment| segment.id() <= max_segment_id && segment.entry(key).is_some());
        if covers_segment {
            state.tombstones.push(Tombstone {
                series: key.clone(),
                up_to,
                max_segment_id,
            });
        }
        debug!(
            "Deleted {} up to {}: {} buffered points removed, tombstone {}",
            key, up_to, removed, covers_segment
        );
    }

    /// Writes the memtable to a new segment.
    ///
    /// Returns the id of the new segment, or `None` if nothing was buffered.
    pub fn flush(&self) -> Result<Option<u64>> {
        let mut state = self.state.write();
        if state.retired {
            return Err(LastQueryError::StorageGroupNotSet(self.name.clone()));
        }
        if state.memtable.is_empty() {
            return Ok(None);
        }
        let id = state.allocate_segment_id();
        let path = self.dir.join(segment_file_name(id));
        let series = state.memtable.write_segment(&path)?;
        let segment = Arc::new(SegmentFile::open(&path, id)?);
        for (device, (start, end)) in segment.device_ranges() {
            self.indexer.add_index_for_device(&device, id, start, end);
        }
        state.segments.push(segment);
        state.memtable = MemTable::new();
        debug!(
            "Flushed {} series of storage group {} to segment {}",
            series, self.name, id
        );
        Ok(Some(id))
    }

    /// Merges all live segments into one.
    ///
    /// The merge runs without blocking queries. Only the swap of the output
    /// for its inputs takes the merge lock exclusively. Replaced segments are
    /// marked obsolete; their files disappear once no reader pins them.
    ///
    /// Returns `None` if fewer than two segments exist or another compaction
    /// of this group is running.
    pub fn compact(&self) -> Result<Option<CompactionResult>> {
        let Some(_running) = self.compacting.try_lock() else {
            debug!("Compaction of {} already running", self.name);
            return Ok(None);
        };

        let (inputs, tombstones, output_id) = {
            let mut state = self.state.write();
            if state.segments.len() < 2 {
                return Ok(None);
            }
            let output_id = state.allocate_segment_id();
            (state.segments.clone(), state.tombstones.clone(), output_id)
        };

        let output_path = self.dir.join(segment_file_name(output_id));
        let mut result = merge_segments(&inputs, &tombstones, &output_path)?;
        result.output_segment = output_id;
        let output = match SegmentFile::open(&output_path, output_id) {
            Ok(output) => Arc::new(output),
            Err(e) => {
                if let Err(remove) = fs::remove_file(&output_path) {
                    warn!("Failed to remove rejected segment {:?}: {:?}", output_path, remove);
                }
                return Err(e);
            }
        };
        let input_ids: HashSet<u64> = inputs.iter().map(|segment| segment.id()).collect();

        {
            let _merge = self.merge_lock.write();
            let mut state = self.state.write();
            let GroupState {
                segments,
                tombstones,
                ..
            } = &mut *state;
            segments.retain(|segment| !input_ids.contains(&segment.id()));
            segments.push(output.clone());
            segments.sort_by_key(|segment| segment.id());
            tombstones.retain(|tombstone| {
                segments
                    .iter()
                    .any(|segment| tombstone.applies_to(segment.id()))
            });

            for id in &input_ids {
                self.indexer.delete_index_for_segment(*id);
            }
            for (device, (start, end)) in output.device_ranges() {
                self.indexer
                    .add_index_for_device(&device, output_id, start, end);
            }
        }

        for input in &inputs {
            input.mark_obsolete();
        }
        info!(
            "Compacted {} segments of {} into segment {} ({} points, {} duplicates)",
            inputs.len(),
            self.name,
            output_id,
            result.points_merged,
            result.duplicates_resolved
        );
        Ok(Some(result))
    }

    /// Copies the state a last-point read of `device` needs.
    ///
    /// Only segments listed by `indexer` for the device are pinned. The
    /// caller must hold the merge lock shared.
    pub fn capture(
        &self,
        device: &str,
        measurements: BTreeSet<String>,
        indexer: &dyn DeviceTimeIndexer,
    ) -> DeviceSnapshot {
        let state = self.state.read();
        let memtable = state.memtable.last_points_for_device(device, &measurements);
        let indexed: HashSet<u64> = indexer
            .filter_by_device(device, None)
            .into_iter()
            .map(|range| range.segment_id)
            .collect();
        let segments = state
            .segments
            .iter()
            .filter(|segment| indexed.contains(&segment.id()))
            .cloned()
            .collect();
        let tombstones = state
            .tombstones
            .iter()
            .filter(|t| t.series.device() == device && measurements.contains(t.series.measurement()))
            .cloned()
            .collect();
        DeviceSnapshot::new(measurements, memtable, segments, tombstones)
    }

    /// Drops all data of the group and removes its directory.
    ///
    /// Waits for a running compaction and for queries pinning a snapshot.
    /// Readers pinned earlier keep reading through their open segment
    /// handles, and their drop leaves the directory alone, so a group
    /// recreated under the same name is unaffected. Later writes fail with
    /// [`LastQueryError::StorageGroupNotSet`].
    pub fn retire(&self) -> Result<()> {
        let _running = self.compacting.lock();
        let _merge = self.merge_lock.write();
        let mut state = self.state.write();
        state.retired = true;
        for segment in state.segments.drain(..) {
            segment.detach();
        }
        state.memtable = MemTable::new();
        state.tombstones.clear();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Retired storage group {}", self.name);
        Ok(())
    }
}

impl std::fmt::Debug for StorageGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageGroup")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .finish()
    }
}

//! Reference storage engine backing last-value queries.
//!
//! Data is placed in storage groups, each a directory of immutable segment
//! files plus an in-memory buffer. The engine implements
//! [`SnapshotCoordinator`]: a batch takes the merge lock of every group it
//! touches shared, pins a [`DeviceSnapshot`] per device and releases the lock
//! before scanning.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_lastvalue::storage::{EngineConfig, StorageEngine};
//!
//! let engine = StorageEngine::open(EngineConfig::new("/data/lastvalue"))?;
//! engine.set_storage_group("root.sg")?;
//! ```

pub mod compaction;
pub mod group;
pub mod index;
pub mod memtable;
pub mod reader;
pub mod segment;

pub use compaction::{CompactionConfig, CompactionResult};
pub use group::{StorageGroup, Tombstone};
pub use index::{DeviceTimeIndexer, InMemoryDeviceTimeIndexer, IndexerRegistry, TimeRange};
pub use reader::{DeviceSnapshot, SeriesLastReader};

use crate::cache::LastCache;
use crate::context::QueryContext;
use crate::error::{LastQueryError, Result};
use crate::series::{is_path_under, DataType, SeriesKey, TimeValuePair, Timestamp, PATH_SEPARATOR};
use crate::snapshot::{ReaderRequest, SnapshotCoordinator};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default memtable size, in points, that triggers a flush.
pub const DEFAULT_MEMTABLE_FLUSH_POINTS: u64 = 10_000;

/// Configuration for [`StorageEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory; each storage group gets a subdirectory.
    pub data_dir: PathBuf,
    /// Memtable point count at which a group flushes.
    pub memtable_flush_points: u64,
    /// Compaction settings.
    pub compaction: CompactionConfig,
}

impl EngineConfig {
    /// Creates a configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            memtable_flush_points: DEFAULT_MEMTABLE_FLUSH_POINTS,
            compaction: CompactionConfig::default(),
        }
    }

    /// Sets the flush threshold.
    pub fn with_memtable_flush_points(mut self, points: u64) -> Self {
        self.memtable_flush_points = points;
        self
    }

    /// Sets the compaction settings.
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }
}

/// Storage engine holding storage groups.
pub struct StorageEngine {
    config: EngineConfig,
    groups: RwLock<BTreeMap<String, Arc<StorageGroup>>>,
    indexers: IndexerRegistry,
    cache: Option<Arc<dyn LastCache>>,
}

impl StorageEngine {
    /// Opens the engine, loading every storage group found under the data
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a segment
    /// fails verification.
    pub fn open(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let engine = Self {
            config,
            groups: RwLock::new(BTreeMap::new()),
            indexers: IndexerRegistry::new(),
            cache: None,
        };

        for dir_entry in fs::read_dir(&engine.config.data_dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = dir_entry.file_name().to_str().map(str::to_string) else {
                warn!("Skipping non UTF-8 directory {:?}", dir_entry.path());
                continue;
            };
            engine.register_group(&name)?;
        }
        Ok(engine)
    }

    /// Attaches the last cache kept current by ingestion and deletion.
    pub fn with_last_cache(mut self, cache: Arc<dyn LastCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the device time index registry.
    pub fn indexers(&self) -> &IndexerRegistry {
        &self.indexers
    }

    /// Returns the names of all storage groups.
    pub fn storage_groups(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }

    /// Creates a storage group.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::StorageGroupExists`] if the name equals,
    /// contains or lies under an existing group, and
    /// [`LastQueryError::InvalidPath`] for a malformed name.
    pub fn set_storage_group(&self, name: &str) -> Result<Arc<StorageGroup>> {
        if name.is_empty() || name.split(PATH_SEPARATOR).any(str::is_empty) {
            return Err(LastQueryError::InvalidPath(name.to_string()));
        }
        {
            let groups = self.groups.read();
            if let Some(existing) = groups
                .keys()
                .find(|existing| is_path_under(name, existing) || is_path_under(existing, name))
            {
                return Err(LastQueryError::StorageGroupExists(existing.clone()));
            }
        }
        self.register_group(name)
    }

    fn register_group(&self, name: &str) -> Result<Arc<StorageGroup>> {
        let indexer: Arc<dyn DeviceTimeIndexer> = Arc::new(InMemoryDeviceTimeIndexer::new());
        let dir = self.config.data_dir.join(name);
        let group = Arc::new(StorageGroup::open(name, &dir, indexer.clone())?);
        self.indexers.add_indexer(name, indexer);
        self.groups.write().insert(name.to_string(), group.clone());
        info!("Storage group {} ready at {:?}", name, dir);
        Ok(group)
    }

    /// Returns the storage group covering `device`, preferring the longest
    /// matching name.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::StorageGroupNotSet`] if no group covers it.
    pub fn storage_group_of(&self, device: &str) -> Result<Arc<StorageGroup>> {
        self.groups
            .read()
            .iter()
            .filter(|(name, _)| is_path_under(device, name))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, group)| group.clone())
            .ok_or_else(|| LastQueryError::StorageGroupNotSet(device.to_string()))
    }

    /// Drops a storage group with its data.
    ///
    /// Removes the group's directory, its time index and every cache entry
    /// under it. Readers pinned before the unload stay readable. Returns
    /// false if no such group exists.
    pub fn unload_storage_group(&self, name: &str) -> Result<bool> {
        let Some(group) = self.groups.write().remove(name) else {
            return Ok(false);
        };
        self.indexers.remove_indexer(name);
        group.retire()?;
        if let Some(cache) = &self.cache {
            cache.invalidate_storage_group(name);
        }
        info!("Unloaded storage group {}", name);
        Ok(true)
    }

    /// Ingests one point.
    ///
    /// Refreshes the cached last point of the series if the cache already
    /// knows it, and flushes the group once its memtable reaches the
    /// configured size.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::DataTypeMismatch`] if the type disagrees
    /// with the value or with earlier inserts, and
    /// [`LastQueryError::StorageGroupNotSet`] if no group covers the device.
    pub fn insert(&self, key: &SeriesKey, data_type: DataType, pair: TimeValuePair) -> Result<()> {
        let group = self.storage_group_of(key.device())?;
        let buffered = group.insert(key, data_type, pair.clone())?;
        if let Some(cache) = &self.cache {
            cache.update_on_ingest(key, pair);
        }
        if buffered >= self.config.memtable_flush_points {
            group.flush()?;
            if self.needs_compaction(group.name())? {
                group.compact()?;
            }
        }
        Ok(())
    }

    /// Deletes the points of `key` with timestamp `<= up_to` and drops its
    /// cache entry.
    pub fn delete(&self, key: &SeriesKey, up_to: Timestamp) -> Result<()> {
        let group = self.storage_group_of(key.device())?;
        group.delete(key, up_to);
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }
        Ok(())
    }

    fn group(&self, name: &str) -> Result<Arc<StorageGroup>> {
        self.groups
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LastQueryError::StorageGroupNotSet(name.to_string()))
    }

    /// Flushes the memtable of a storage group.
    pub fn flush(&self, storage_group: &str) -> Result<Option<u64>> {
        self.group(storage_group)?.flush()
    }

    /// Flushes every storage group.
    pub fn flush_all(&self) -> Result<()> {
        let groups: Vec<Arc<StorageGroup>> = self.groups.read().values().cloned().collect();
        for group in groups {
            group.flush()?;
        }
        Ok(())
    }

    /// Returns true if the group holds more segments than configured.
    pub fn needs_compaction(&self, storage_group: &str) -> Result<bool> {
        let group = self.group(storage_group)?;
        Ok(self.config.compaction.needs_compaction(group.segment_count()))
    }

    /// Compacts the segments of a storage group.
    pub fn compact(&self, storage_group: &str) -> Result<Option<CompactionResult>> {
        self.group(storage_group)?.compact()
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("config", &self.config)
            .field("groups", &self.storage_groups())
            .finish()
    }
}

/// Shared merge locks over the storage groups of one batch.
///
/// Device snapshots are captured lazily on the first reader of each device
/// and shared by the readers of the same device.
pub struct EngineSnapshotGuard {
    locks: Vec<(Arc<StorageGroup>, ArcRwLockReadGuard<RawRwLock, ()>)>,
    devices: Mutex<HashMap<String, Arc<DeviceSnapshot>>>,
}

impl EngineSnapshotGuard {
    /// Returns the number of locked storage groups.
    pub fn group_count(&self) -> usize {
        self.locks.len()
    }

    fn group_for(&self, device: &str) -> Option<&Arc<StorageGroup>> {
        self.locks
            .iter()
            .map(|(group, _)| group)
            .filter(|group| is_path_under(device, group.name()))
            .max_by_key(|group| group.name().len())
    }
}

impl SnapshotCoordinator for StorageEngine {
    type Guard = EngineSnapshotGuard;
    type Reader = SeriesLastReader;

    fn acquire(&self, series: &[&SeriesKey]) -> Result<EngineSnapshotGuard> {
        let mut groups: BTreeMap<String, Arc<StorageGroup>> = BTreeMap::new();
        for key in series {
            let group = self.storage_group_of(key.device()).map_err(|e| {
                LastQueryError::SnapshotAcquisition(format!("{}: {}", key.full_path(), e))
            })?;
            groups.entry(group.name().to_string()).or_insert(group);
        }

        // Name order keeps lock acquisition consistent across batches.
        let locks = groups
            .into_values()
            .map(|group| {
                let lock = group.merge_lock().read_arc();
                (group, lock)
            })
            .collect::<Vec<_>>();
        debug!("Locked {} storage groups for {} series", locks.len(), series.len());
        Ok(EngineSnapshotGuard {
            locks,
            devices: Mutex::new(HashMap::new()),
        })
    }

    fn open_reader(
        &self,
        guard: &EngineSnapshotGuard,
        request: ReaderRequest<'_>,
        ctx: &QueryContext,
    ) -> Result<SeriesLastReader> {
        ctx.check_aborted()?;
        let device = request.series.device();
        let measurement = request.series.measurement();

        let cached = guard.devices.lock().get(device).cloned();
        let snapshot = match cached {
            Some(snapshot) if snapshot.covers(measurement) => snapshot,
            _ => {
                let group = guard.group_for(device).ok_or_else(|| {
                    LastQueryError::SnapshotAcquisition(format!("{} was not locked", device))
                })?;
                let indexer = self.indexers.indexer(group.name()).ok_or_else(|| {
                    LastQueryError::SnapshotAcquisition(format!(
                        "no time index for storage group {}",
                        group.name()
                    ))
                })?;
                let mut measurements: BTreeSet<String> =
                    request.measurements.cloned().unwrap_or_default();
                measurements.insert(measurement.to_string());
                let snapshot = Arc::new(group.capture(device, measurements, indexer.as_ref()));
                guard
                    .devices
                    .lock()
                    .entry(device.to_string())
                    .or_insert_with(|| snapshot.clone());
                snapshot
            }
        };

        Ok(SeriesLastReader::new(
            request.series.clone(),
            request.data_type,
            snapshot,
        ))
    }
}

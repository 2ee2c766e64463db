//! Immutable segment files.
//!
//! A segment holds one block per series, written once on flush or
//! compaction and never modified afterwards. Files use the `.seg` extension.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (6 bytes)                                            │
//! │  - Magic: "ALVS" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Series Blocks (repeated per series)                         │
//! │  - Point count: u32                                          │
//! │  - Points: ts i64, present u8, value (if present)            │
//! │  - Block CRC32: u32                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Series Index                                                │
//! │  - Entry count: u32                                          │
//! │  - Entries: device, measurement, dtype, offset, size,        │
//! │    point count, min ts, max ts                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (16 bytes)                                           │
//! │  - Index offset: u64                                         │
//! │  - File CRC32: u32 (header + blocks + index)                 │
//! │  - Reverse magic: "SVLA" (4 bytes)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Text values and names are written as a
//! u32 (values) or u16 (names) length followed by UTF-8 bytes.

use crate::error::{LastQueryError, Result};
use crate::series::{DataType, SeriesKey, TimeValuePair, Timestamp, TypedValue};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Magic bytes for the segment header: "ALVS"
pub const SEGMENT_MAGIC: [u8; 4] = *b"ALVS";

/// Reverse magic bytes for the segment footer: "SVLA"
pub const SEGMENT_MAGIC_REVERSE: [u8; 4] = *b"SVLA";

/// Current segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 6;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 16;

/// File extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Returns the file name of the segment with the given id.
pub fn segment_file_name(id: u64) -> String {
    format!("{:020}.{}", id, SEGMENT_EXTENSION)
}

/// Extracts the segment id from a segment file path.
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Index entry locating the block of one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesBlockEntry {
    /// Device path.
    pub device: String,
    /// Measurement name.
    pub measurement: String,
    /// Data type of the stored values.
    pub data_type: DataType,
    /// Byte offset of the block in the file.
    pub block_offset: u64,
    /// Block size in bytes, CRC included.
    pub block_size: u32,
    /// Number of points in the block.
    pub point_count: u32,
    /// Smallest timestamp in the block.
    pub min_ts: Timestamp,
    /// Greatest timestamp in the block.
    pub max_ts: Timestamp,
}

impl SeriesBlockEntry {
    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_name(buf, &self.device)?;
        write_name(buf, &self.measurement)?;
        buf.push(self.data_type.as_u8());
        buf.extend_from_slice(&self.block_offset.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.point_count.to_le_bytes());
        buf.extend_from_slice(&self.min_ts.to_le_bytes());
        buf.extend_from_slice(&self.max_ts.to_le_bytes());
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let device = read_name(reader)?;
        let measurement = read_name(reader)?;
        let raw_type = read_u8(reader)?;
        let data_type = DataType::from_u8(raw_type).ok_or_else(|| {
            LastQueryError::CorruptSegment(format!("unknown data type tag {}", raw_type))
        })?;
        Ok(Self {
            device,
            measurement,
            data_type,
            block_offset: read_u64(reader)?,
            block_size: read_u32(reader)?,
            point_count: read_u32(reader)?,
            min_ts: read_i64(reader)?,
            max_ts: read_i64(reader)?,
        })
    }

    /// Returns the series key of this entry.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.device.as_str(), self.measurement.as_str())
    }
}

/// Segment file writer.
///
/// Writes to a temporary file and renames it into place on
/// [`SegmentWriter::finish`], so a segment path never holds a partial file.
/// A writer dropped before `finish` removes its temporary file.
pub struct SegmentWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    tmp_path: PathBuf,
    position: u64,
    entries: Vec<SeriesBlockEntry>,
    hasher: crc32fast::Hasher,
    finished: bool,
}

impl SegmentWriter {
    /// Creates a writer for a new segment at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be created.
    pub fn new(path: &Path) -> Result<Self> {
        let tmp_path = path.with_extension(format!("{}.tmp", SEGMENT_EXTENSION));
        let file = File::create(&tmp_path)?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            tmp_path,
            position: 0,
            entries: Vec::new(),
            hasher: crc32fast::Hasher::new(),
            finished: false,
        };

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&SEGMENT_MAGIC);
        header.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        writer.write_bytes(&header)?;
        Ok(writer)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Appends the block of one series.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::DataTypeMismatch`] if a value does not match
    /// `data_type`, or an I/O error.
    pub fn write_series(
        &mut self,
        key: &SeriesKey,
        data_type: DataType,
        points: &BTreeMap<Timestamp, Option<TypedValue>>,
    ) -> Result<()> {
        let (Some((&min_ts, _)), Some((&max_ts, _))) =
            (points.iter().next(), points.iter().next_back())
        else {
            return Ok(());
        };

        let point_count = checked_u32(points.len(), "point count")?;
        let mut block = Vec::with_capacity(4 + points.len() * 17 + 4);
        block.extend_from_slice(&point_count.to_le_bytes());
        for (ts, value) in points {
            block.extend_from_slice(&ts.to_le_bytes());
            match value {
                Some(value) => {
                    if value.data_type() != data_type {
                        return Err(LastQueryError::DataTypeMismatch {
                            series: key.full_path(),
                            expected: data_type,
                            actual: value.data_type(),
                        });
                    }
                    block.push(1);
                    encode_value(&mut block, value)?;
                }
                None => block.push(0),
            }
        }
        let block_crc32 = crc32fast::hash(&block);
        block.extend_from_slice(&block_crc32.to_le_bytes());
        let block_size = checked_u32(block.len(), "block size")?;

        let block_offset = self.position;
        self.write_bytes(&block)?;
        self.entries.push(SeriesBlockEntry {
            device: key.device().to_string(),
            measurement: key.measurement().to_string(),
            data_type,
            block_offset,
            block_size,
            point_count,
            min_ts,
            max_ts,
        });
        Ok(())
    }

    /// Writes the index and footer, syncs the file and moves it into place.
    pub fn finish(mut self) -> Result<()> {
        let index_offset = self.position;
        let entry_count = checked_u32(self.entries.len(), "index entry count")?;
        let mut index = Vec::new();
        index.extend_from_slice(&entry_count.to_le_bytes());
        for entry in &self.entries {
            entry.write_to(&mut index)?;
        }
        self.write_bytes(&index)?;

        let file_crc32 = self.hasher.clone().finalize();
        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        footer.extend_from_slice(&index_offset.to_le_bytes());
        footer.extend_from_slice(&file_crc32.to_le_bytes());
        footer.extend_from_slice(&SEGMENT_MAGIC_REVERSE);
        self.writer.write_all(&footer)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        self.finished = true;
        debug!(
            "Wrote segment {:?} with {} series",
            self.path,
            self.entries.len()
        );
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => debug!("Removed unfinished segment {:?}", self.tmp_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove unfinished segment {:?}: {:?}", self.tmp_path, e),
        }
    }
}

/// An opened, immutable segment file.
///
/// Readers share a segment through `Arc`. Blocks are read through the
/// handle opened with the segment, so a pinned segment stays readable after
/// its path is unlinked. Once a segment is marked obsolete its file is
/// deleted when the last reference is dropped.
#[derive(Debug)]
pub struct SegmentFile {
    id: u64,
    path: PathBuf,
    file: Mutex<File>,
    index: HashMap<SeriesKey, SeriesBlockEntry>,
    obsolete: AtomicBool,
    detached: AtomicBool,
}

impl SegmentFile {
    /// Opens a segment and verifies its header, footer and file checksum.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::CorruptSegment`] for a malformed file and
    /// [`LastQueryError::ChecksumMismatch`] if the content was altered.
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(LastQueryError::CorruptSegment(format!(
                "{:?} is too small ({} bytes)",
                path, file_size
            )));
        }
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != SEGMENT_MAGIC {
            return Err(LastQueryError::CorruptSegment(format!(
                "bad header magic in {:?}",
                path
            )));
        }
        let version = read_u16(&mut reader)?;
        if version != SEGMENT_VERSION {
            return Err(LastQueryError::CorruptSegment(format!(
                "unsupported segment version {}",
                version
            )));
        }

        let content_size = file_size - FOOTER_SIZE as u64;
        reader.seek(SeekFrom::Start(content_size))?;
        let index_offset = read_u64(&mut reader)?;
        let file_crc32 = read_u32(&mut reader)?;
        reader.read_exact(&mut magic)?;
        if magic != SEGMENT_MAGIC_REVERSE {
            return Err(LastQueryError::CorruptSegment(format!(
                "bad footer magic in {:?}",
                path
            )));
        }
        if index_offset < HEADER_SIZE as u64 || index_offset > content_size {
            return Err(LastQueryError::CorruptSegment(format!(
                "index offset {} out of range",
                index_offset
            )));
        }

        let calculated = calculate_crc(path, content_size)?;
        if calculated != file_crc32 {
            return Err(LastQueryError::ChecksumMismatch {
                expected: file_crc32,
                actual: calculated,
            });
        }

        reader.seek(SeekFrom::Start(index_offset))?;
        let entry_count = read_u32(&mut reader)?;
        let mut index = HashMap::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let entry = SeriesBlockEntry::read_from(&mut reader)?;
            index.insert(entry.series_key(), entry);
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file: Mutex::new(reader.into_inner()),
            index,
            obsolete: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        })
    }

    /// Returns the segment id. Higher ids hold newer data.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the index entry of a series.
    pub fn entry(&self, key: &SeriesKey) -> Option<&SeriesBlockEntry> {
        self.index.get(key)
    }

    /// Returns all index entries.
    pub fn entries(&self) -> impl Iterator<Item = &SeriesBlockEntry> {
        self.index.values()
    }

    /// Returns the time range covered by each device.
    pub fn device_ranges(&self) -> BTreeMap<String, (Timestamp, Timestamp)> {
        let mut ranges: BTreeMap<String, (Timestamp, Timestamp)> = BTreeMap::new();
        for entry in self.index.values() {
            ranges
                .entry(entry.device.clone())
                .and_modify(|(start, end)| {
                    *start = (*start).min(entry.min_ts);
                    *end = (*end).max(entry.max_ts);
                })
                .or_insert((entry.min_ts, entry.max_ts));
        }
        ranges
    }

    /// Reads and verifies the block of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`LastQueryError::ChecksumMismatch`] if the block CRC does not
    /// match, or an I/O error.
    pub fn read_points(&self, entry: &SeriesBlockEntry) -> Result<Vec<(Timestamp, Option<TypedValue>)>> {
        if (entry.block_size as usize) < 8 {
            return Err(LastQueryError::CorruptSegment(format!(
                "block of {}.{} is too small",
                entry.device, entry.measurement
            )));
        }
        let mut block = vec![0u8; entry.block_size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.block_offset))?;
            file.read_exact(&mut block)?;
        }

        let (payload, crc_bytes) = block.split_at(block.len() - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(crc_bytes);
        let expected = u32::from_le_bytes(stored);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(LastQueryError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = io::Cursor::new(payload);
        let count = read_u32(&mut cursor)?;
        if count != entry.point_count {
            return Err(LastQueryError::CorruptSegment(format!(
                "block of {}.{} holds {} points, index says {}",
                entry.device, entry.measurement, count, entry.point_count
            )));
        }
        let mut points = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let ts = read_i64(&mut cursor)?;
            let value = match read_u8(&mut cursor)? {
                0 => None,
                1 => Some(decode_value(&mut cursor, entry.data_type)?),
                other => {
                    return Err(LastQueryError::CorruptSegment(format!(
                        "invalid presence flag {}",
                        other
                    )))
                }
            };
            points.push((ts, value));
        }
        Ok(points)
    }

    /// Returns the newest point of an entry with timestamp above `deleted_up_to`.
    pub fn last_point(
        &self,
        entry: &SeriesBlockEntry,
        deleted_up_to: Option<Timestamp>,
    ) -> Result<Option<TimeValuePair>> {
        let points = self.read_points(entry)?;
        Ok(points
            .into_iter()
            .rev()
            .find(|(ts, _)| deleted_up_to.map_or(true, |up_to| *ts > up_to))
            .map(|(timestamp, value)| TimeValuePair { timestamp, value }))
    }

    /// Marks the segment as replaced. The file is removed on last drop.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Returns true if the segment has been replaced.
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Marks the file as already removed along with its directory.
    ///
    /// Pinned readers keep reading through the open handle. Dropping the
    /// segment no longer touches its path, which a later segment may reuse.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        if !self.is_obsolete() || self.detached.load(Ordering::Acquire) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed obsolete segment {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove obsolete segment {:?}: {:?}", self.path, e),
        }
    }
}

fn calculate_crc(path: &Path, size: u64) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = [0u8; 8192];
    let mut remaining = size;

    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        file.read_exact(&mut buffer[..to_read])?;
        hasher.update(&buffer[..to_read]);
        remaining -= to_read as u64;
    }
    Ok(hasher.finalize())
}

fn checked_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| LastQueryError::CorruptSegment(format!("{} {} does not fit in u32", what, len)))
}

fn encode_value(buf: &mut Vec<u8>, value: &TypedValue) -> Result<()> {
    match value {
        TypedValue::Boolean(v) => buf.push(u8::from(*v)),
        TypedValue::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        TypedValue::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        TypedValue::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
        TypedValue::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        TypedValue::Text(v) => {
            let len = checked_u32(v.len(), "text length")?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
    }
    Ok(())
}

fn decode_value<R: Read>(reader: &mut R, data_type: DataType) -> Result<TypedValue> {
    Ok(match data_type {
        DataType::Boolean => TypedValue::Boolean(read_u8(reader)? != 0),
        DataType::Int32 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            TypedValue::Int32(i32::from_le_bytes(buf))
        }
        DataType::Int64 => TypedValue::Int64(read_i64(reader)?),
        DataType::Float => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            TypedValue::Float(f32::from_le_bytes(buf))
        }
        DataType::Double => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            TypedValue::Double(f64::from_le_bytes(buf))
        }
        DataType::Text => {
            let len = read_u32(reader)? as usize;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            let text = String::from_utf8(bytes)
                .map_err(|e| LastQueryError::CorruptSegment(format!("invalid UTF-8: {}", e)))?;
            TypedValue::Text(text)
        }
    })
}

fn write_name(buf: &mut Vec<u8>, name: &str) -> Result<()> {
    let len = u16::try_from(name.len())
        .map_err(|_| LastQueryError::InvalidPath(format!("name too long: {}", name)))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    Ok(())
}

fn read_name<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u16(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| LastQueryError::CorruptSegment(format!("invalid UTF-8 name: {}", e)))
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_points() -> BTreeMap<Timestamp, Option<TypedValue>> {
        let mut points = BTreeMap::new();
        points.insert(10, Some(TypedValue::Text("a".into())));
        points.insert(20, None);
        points.insert(30, Some(TypedValue::Text("c".into())));
        points
    }

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join(segment_file_name(1));
        let mut writer = SegmentWriter::new(&path).unwrap();
        writer
            .write_series(&SeriesKey::new("root.sg.d1", "s1"), DataType::Text, &sample_points())
            .unwrap();
        let mut ints = BTreeMap::new();
        ints.insert(5, Some(TypedValue::Int64(-3)));
        writer
            .write_series(&SeriesKey::new("root.sg.d2", "s1"), DataType::Int64, &ints)
            .unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_segment_file_name() {
        let name = segment_file_name(42);
        assert_eq!(name, "00000000000000000042.seg");
        assert_eq!(parse_segment_id(Path::new(&name)), Some(42));
        assert_eq!(parse_segment_id(Path::new("42.seg.tmp")), None);
    }

    #[test]
    fn test_write_and_read_segment() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let segment = SegmentFile::open(&path, 1).unwrap();

        assert_eq!(segment.entries().count(), 2);
        let entry = segment.entry(&SeriesKey::new("root.sg.d1", "s1")).unwrap();
        assert_eq!(entry.data_type, DataType::Text);
        assert_eq!((entry.min_ts, entry.max_ts), (10, 30));

        let points = segment.read_points(entry).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[1], (20, None));

        let ranges = segment.device_ranges();
        assert_eq!(ranges["root.sg.d2"], (5, 5));
    }

    #[test]
    fn test_last_point_respects_deletion() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let segment = SegmentFile::open(&path, 1).unwrap();
        let entry = segment.entry(&SeriesKey::new("root.sg.d1", "s1")).unwrap();

        assert_eq!(
            segment.last_point(entry, None).unwrap(),
            Some(TimeValuePair::new(30, TypedValue::Text("c".into())))
        );
        assert_eq!(
            segment.last_point(entry, Some(25)).unwrap(),
            Some(TimeValuePair::null(20))
        );
        assert_eq!(segment.last_point(entry, Some(30)).unwrap(), None);
    }

    #[test]
    fn test_open_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 6] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = SegmentFile::open(&path, 1).unwrap_err();
        assert!(matches!(err, LastQueryError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_block_crc_detects_corruption_after_open() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let segment = SegmentFile::open(&path, 1).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 6] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let entry = segment.entry(&SeriesKey::new("root.sg.d1", "s1")).unwrap();
        assert!(matches!(
            segment.read_points(entry),
            Err(LastQueryError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_write_rejects_wrong_value_type() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(1));
        let mut writer = SegmentWriter::new(&path).unwrap();
        let result = writer.write_series(
            &SeriesKey::new("root.sg.d1", "s1"),
            DataType::Double,
            &sample_points(),
        );
        assert!(matches!(result, Err(LastQueryError::DataTypeMismatch { .. })));
    }

    #[test]
    fn test_obsolete_segment_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let segment = std::sync::Arc::new(SegmentFile::open(&path, 1).unwrap());
        let pinned = segment.clone();

        segment.mark_obsolete();
        drop(segment);
        assert!(path.exists());

        drop(pinned);
        assert!(!path.exists());
    }

    #[test]
    fn test_detached_segment_reads_after_unlink() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let segment = SegmentFile::open(&path, 1).unwrap();
        segment.mark_obsolete();
        segment.detach();
        fs::remove_file(&path).unwrap();

        let entry = segment.entry(&SeriesKey::new("root.sg.d2", "s1")).unwrap();
        assert_eq!(
            segment.last_point(entry, None).unwrap(),
            Some(TimeValuePair::new(5, TypedValue::Int64(-3)))
        );

        // A new file at the same path is not removed by the detached segment.
        let reused = write_sample(&dir);
        drop(segment);
        assert!(reused.exists());
    }

    #[test]
    fn test_checked_u32_rejects_oversized_lengths() {
        assert_eq!(checked_u32(17, "block size").unwrap(), 17);
        assert_eq!(checked_u32(u32::MAX as usize, "block size").unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            checked_u32(u32::MAX as usize + 1, "block size"),
            Err(LastQueryError::CorruptSegment(_))
        ));
    }

    #[test]
    fn test_unfinished_writer_removes_tmp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(1));
        let tmp_path = path.with_extension("seg.tmp");
        {
            let mut writer = SegmentWriter::new(&path).unwrap();
            assert!(tmp_path.exists());
            let result = writer.write_series(
                &SeriesKey::new("root.sg.d1", "s1"),
                DataType::Double,
                &sample_points(),
            );
            assert!(result.is_err());
        }
        assert!(!tmp_path.exists());
        assert!(!path.exists());

        write_sample(&dir);
        assert!(path.exists());
        assert!(!tmp_path.exists());
    }
}

//! Error and Result types for last-value query resolution.

use crate::series::DataType;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for last-value operations.
pub type Result<T> = std::result::Result<T, LastQueryError>;

/// The error type for last-value resolution and the backing storage engine.
#[derive(Debug, Error)]
pub enum LastQueryError {
    /// Reading the last cache failed. The resolver treats the series as a miss.
    #[error("Last cache read failed: {0}")]
    CacheRead(String),

    /// The storage regions backing a batch could not be locked or pinned.
    #[error("Snapshot acquisition failed: {0}")]
    SnapshotAcquisition(String),

    /// Underlying I/O error while scanning persisted data.
    #[error("Scan I/O error: {0}")]
    ScanIo(#[from] io::Error),

    /// Segment checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Segment file content is structurally invalid.
    #[error("Corrupt segment: {0}")]
    CorruptSegment(String),

    /// Stored values do not match the declared data type of a series.
    #[error("Data type mismatch for {series}: expected {expected:?}, got {actual:?}")]
    DataTypeMismatch {
        /// Full path of the series.
        series: String,
        /// Declared data type.
        expected: DataType,
        /// Data type found in storage.
        actual: DataType,
    },

    /// Filter is malformed and was rejected before any access.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Query plan is malformed (e.g. series and data types differ in length).
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Series path cannot be parsed.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// No storage group covers the given device.
    #[error("Storage group not set for {0}")]
    StorageGroupNotSet(String),

    /// A storage group with this name, or overlapping it, already exists.
    #[error("Storage group already exists: {0}")]
    StorageGroupExists(String),

    /// Error during segment compaction.
    #[error("Compaction error: {0}")]
    CompactionError(String),

    /// The query context was aborted while the batch was in flight.
    #[error("Query cancelled")]
    Cancelled,
}

impl LastQueryError {
    /// Returns true if the error must abort the whole batch.
    ///
    /// Only cache read failures are absorbed locally.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CacheRead(_))
    }
}

//! Error and Result types for Burrow archive operations.

use crate::storage::Timestamp;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for Burrow operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// The error type for archive storage, ETL, and administrative operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A path, container, partition, or PV does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A storage location string could not be parsed.
    #[error("Malformed storage location: {0}")]
    MalformedLocation(String),

    /// An append would violate the strictly increasing time order of a partition.
    #[error("Out of order append: sample at {sample_ts} is not after last sample at {last_ts}")]
    OutOfOrder {
        /// Timestamp of the rejected sample.
        sample_ts: Timestamp,
        /// Last timestamp already present in the partition.
        last_ts: Timestamp,
    },

    /// The operation requires a state the PV is not in (typically paused ingestion).
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The requested value conversion is not supported.
    #[error("Unsupported conversion: {0}")]
    UnsupportedConversion(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error raised by the archive container library.
    #[error("Container error: {0}")]
    Container(#[from] zip::result::ZipError),

    /// Invalid magic bytes in a partition file header.
    #[error("Invalid magic bytes: expected BRRW, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported partition file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A record could not be decoded.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Sample timestamp does not belong to the partition's window.
    #[error("Partition mismatch: sample timestamp {sample_ts} not in partition [{start}, {end})")]
    PartitionMismatch {
        /// Timestamp of the sample.
        sample_ts: i64,
        /// Start timestamp of the partition (inclusive).
        start: i64,
        /// End timestamp of the partition (exclusive).
        end: i64,
    },

    /// Configuration could not be parsed or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task failed to complete.
    #[error("Task error: {0}")]
    Task(String),
}

impl ArchiveError {
    /// Returns true for failures that may succeed when retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Container(_) | Self::Task(_))
    }
}

impl From<tokio::task::JoinError> for ArchiveError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

//! On-disk storage for archived process variables.
//!
//! This module provides the data model shared by every tier of the archive
//! and the primitives that persist it:
//!
//! - [`file`]: the partition file format (fixed header plus self-delimiting records)
//! - [`search`]: time-seek search over a partition's byte range
//! - [`container`]: zip containers holding partitions as entries
//! - [`stage`]: a storage tier binding a location and granularity together

pub mod container;
pub mod file;
pub mod search;
pub mod stage;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use container::{ContainerCache, ZipContainer};
pub use file::{
    inspect_tail, PartitionHeader, PartitionReader, PartitionWriter, TailRepair, HEADER_SIZE,
};
pub use search::{search, CompareRecord, NextStep, SampleTimeComparator};
pub use stage::{AppendSummary, PartitionInfo, StorageStage};

/// Timestamp in nanoseconds since Unix epoch (UTC).
pub type Timestamp = i64;

/// Nanoseconds per second.
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: i64 = 1_000_000;

/// Returns the current wall-clock time in nanoseconds since Unix epoch.
pub fn current_timestamp_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| now.as_nanos() as i64)
        .unwrap_or_default()
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive).
    pub start: Timestamp,
    /// End timestamp (exclusive).
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a new time range.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if the timestamp lies inside the range.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Returns true if the two ranges share at least one instant.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if the range covers no instant.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Returns the length of the range in nanoseconds.
    pub fn duration_nanos(&self) -> i64 {
        self.end.saturating_sub(self.start).max(0)
    }
}

/// Data type tag of a PV's value (scalar or waveform, numeric or string).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DbrType {
    /// Single string.
    ScalarString = 0,
    /// Single 16-bit integer.
    ScalarShort = 1,
    /// Single 32-bit float.
    ScalarFloat = 2,
    /// Single enum index.
    ScalarEnum = 3,
    /// Single byte.
    ScalarByte = 4,
    /// Single 32-bit integer.
    ScalarInt = 5,
    /// Single 64-bit float.
    ScalarDouble = 6,
    /// Array of strings.
    WaveformString = 7,
    /// Array of 16-bit integers.
    WaveformShort = 8,
    /// Array of 32-bit floats.
    WaveformFloat = 9,
    /// Array of enum indices.
    WaveformEnum = 10,
    /// Array of bytes.
    WaveformByte = 11,
    /// Array of 32-bit integers.
    WaveformInt = 12,
    /// Array of 64-bit floats.
    WaveformDouble = 13,
}

impl DbrType {
    /// Returns the on-disk tag for this type.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parses an on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::ScalarString,
            1 => Self::ScalarShort,
            2 => Self::ScalarFloat,
            3 => Self::ScalarEnum,
            4 => Self::ScalarByte,
            5 => Self::ScalarInt,
            6 => Self::ScalarDouble,
            7 => Self::WaveformString,
            8 => Self::WaveformShort,
            9 => Self::WaveformFloat,
            10 => Self::WaveformEnum,
            11 => Self::WaveformByte,
            12 => Self::WaveformInt,
            13 => Self::WaveformDouble,
            _ => return None,
        })
    }

    /// Returns true for array-valued types.
    pub fn is_waveform(self) -> bool {
        self.tag() >= Self::WaveformString.tag()
    }

    /// Returns true for string-valued types.
    pub fn is_string(self) -> bool {
        matches!(self, Self::ScalarString | Self::WaveformString)
    }
}

/// A type-tagged sample value.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    /// Scalar string.
    String(String),
    /// Scalar 16-bit integer.
    Short(i16),
    /// Scalar 32-bit float.
    Float(f32),
    /// Scalar enum index.
    Enum(i16),
    /// Scalar byte.
    Byte(i8),
    /// Scalar 32-bit integer.
    Int(i32),
    /// Scalar 64-bit float.
    Double(f64),
    /// Waveform of strings.
    StringArray(Vec<String>),
    /// Waveform of 16-bit integers.
    ShortArray(Vec<i16>),
    /// Waveform of 32-bit floats.
    FloatArray(Vec<f32>),
    /// Waveform of enum indices.
    EnumArray(Vec<i16>),
    /// Waveform of bytes.
    ByteArray(Vec<i8>),
    /// Waveform of 32-bit integers.
    IntArray(Vec<i32>),
    /// Waveform of 64-bit floats.
    DoubleArray(Vec<f64>),
}

impl SampleValue {
    /// Returns the DBR type tag matching this value.
    pub fn dbr_type(&self) -> DbrType {
        match self {
            Self::String(_) => DbrType::ScalarString,
            Self::Short(_) => DbrType::ScalarShort,
            Self::Float(_) => DbrType::ScalarFloat,
            Self::Enum(_) => DbrType::ScalarEnum,
            Self::Byte(_) => DbrType::ScalarByte,
            Self::Int(_) => DbrType::ScalarInt,
            Self::Double(_) => DbrType::ScalarDouble,
            Self::StringArray(_) => DbrType::WaveformString,
            Self::ShortArray(_) => DbrType::WaveformShort,
            Self::FloatArray(_) => DbrType::WaveformFloat,
            Self::EnumArray(_) => DbrType::WaveformEnum,
            Self::ByteArray(_) => DbrType::WaveformByte,
            Self::IntArray(_) => DbrType::WaveformInt,
            Self::DoubleArray(_) => DbrType::WaveformDouble,
        }
    }
}

/// One timestamped value of a PV together with its alarm metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Timestamp in nanoseconds since epoch.
    pub timestamp: Timestamp,
    /// The value.
    pub value: SampleValue,
    /// Alarm severity.
    pub severity: i16,
    /// Alarm status.
    pub status: i16,
    /// Auxiliary field values captured with this sample (e.g. `EGU`).
    pub fields: Vec<(String, String)>,
}

impl Sample {
    /// Creates a sample with no alarm and no auxiliary fields.
    pub fn new(timestamp: Timestamp, value: SampleValue) -> Self {
        Self {
            timestamp,
            value,
            severity: 0,
            status: 0,
            fields: Vec::new(),
        }
    }

    /// Sets the alarm severity and status.
    pub fn with_alarm(mut self, severity: i16, status: i16) -> Self {
        self.severity = severity;
        self.status = status;
        self
    }

    /// Adds an auxiliary field value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Returns the DBR type of the value.
    pub fn dbr_type(&self) -> DbrType {
        self.value.dbr_type()
    }
}

/// Boxed stream of samples read lazily from storage.
pub type SampleIter<'a> = Box<dyn Iterator<Item = crate::error::Result<Sample>> + Send + 'a>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_overlap_is_half_open() {
        let a = TimeRange::new(0, 10);
        assert!(a.overlaps(&TimeRange::new(9, 20)));
        assert!(!a.overlaps(&TimeRange::new(10, 20)));
        assert!(!a.overlaps(&TimeRange::new(-5, 0)));
        assert!(a.contains(0));
        assert!(!a.contains(10));
    }

    #[test]
    fn test_dbr_tag_roundtrip() {
        for tag in 0..14u8 {
            let dbr = DbrType::from_tag(tag).unwrap();
            assert_eq!(dbr.tag(), tag);
        }
        assert!(DbrType::from_tag(14).is_none());
        assert!(DbrType::WaveformInt.is_waveform());
        assert!(!DbrType::ScalarDouble.is_waveform());
    }
}

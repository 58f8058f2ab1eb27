//! Partition file format.
//!
//! A partition file starts with a fixed-size header followed by records:
//!
//! ```text
//! +----------------------------+
//! | Header (56 bytes)          |  magic, version, DBR, granularity,
//! |                            |  window, first/last timestamp, count, CRC
//! +----------------------------+
//! | Record 0 | '\n'            |
//! | Record 1 | '\n'            |
//! | ...                        |
//! | Record N (trailing '\n'    |
//! |   optional)                |
//! +----------------------------+
//! ```
//!
//! Writers always terminate records. A record without its delimiter is the
//! trace of an interrupted append and is repaired before appending again
//! (see [`inspect_tail`]).
//!
//! Each record is the escaped form of
//! `offset:u64 | severity:i16 | status:i16 | dbr:u8 | value | fields | crc32:u32`
//! where `offset` is the sample time relative to the window start. Escaping
//! guarantees that `\n` only ever terminates a record, so a reader dropped at
//! any byte offset can find the next record boundary by scanning forward.
//!
//! All multi-byte values are little-endian.

use crate::error::{ArchiveError, Result};
use crate::lifecycle::partition::PartitionGranularity;
use crate::storage::search::{search, SampleTimeComparator};
use crate::storage::{DbrType, Sample, SampleIter, SampleValue, TimeRange, Timestamp};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};

/// Magic bytes identifying a partition file.
pub const MAGIC: [u8; 4] = *b"BRRW";

/// Current partition file format version.
pub const VERSION: u16 = 1;

/// Size of the partition header in bytes.
pub const HEADER_SIZE: usize = 56;

/// Record terminator.
pub const RECORD_DELIMITER: u8 = b'\n';

const ESCAPE: u8 = 0x1B;
const ESCAPED_ESCAPE: u8 = 0x01;
const ESCAPED_NEWLINE: u8 = 0x02;
const ESCAPED_RETURN: u8 = 0x03;

/// Partition file header.
///
/// Layout:
/// - magic (4 bytes): "BRRW"
/// - version (2 bytes)
/// - dbr_type (1 byte)
/// - granularity (1 byte)
/// - window_start (8 bytes)
/// - window_end (8 bytes)
/// - first_timestamp (8 bytes)
/// - last_timestamp (8 bytes)
/// - record_count (8 bytes)
/// - header_crc32 (4 bytes): CRC of the preceding 52 bytes
/// - reserved (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeader {
    /// File format version.
    pub version: u16,
    /// Data type of every record in the partition.
    pub dbr_type: DbrType,
    /// Granularity the window was derived from.
    pub granularity: PartitionGranularity,
    /// Window covered by this partition.
    pub window: TimeRange,
    /// Timestamp of the first record (`i64::MAX` when empty).
    pub first_timestamp: Timestamp,
    /// Timestamp of the last record (`i64::MIN` when empty).
    pub last_timestamp: Timestamp,
    /// Number of records.
    pub record_count: u64,
}

impl PartitionHeader {
    /// Creates a header for an empty partition.
    pub fn new(dbr_type: DbrType, granularity: PartitionGranularity, window: TimeRange) -> Self {
        Self {
            version: VERSION,
            dbr_type,
            granularity,
            window,
            first_timestamp: i64::MAX,
            last_timestamp: i64::MIN,
            record_count: 0,
        }
    }

    /// Returns true if the partition holds no records.
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Returns the first record's timestamp, if any.
    pub fn first(&self) -> Option<Timestamp> {
        (!self.is_empty()).then_some(self.first_timestamp)
    }

    /// Returns the last record's timestamp, if any.
    pub fn last(&self) -> Option<Timestamp> {
        (!self.is_empty()).then_some(self.last_timestamp)
    }

    /// Serializes the header to bytes.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.dbr_type.tag();
        buf[7] = self.granularity.tag();
        buf[8..16].copy_from_slice(&self.window.start.to_le_bytes());
        buf[16..24].copy_from_slice(&self.window.end.to_le_bytes());
        buf[24..32].copy_from_slice(&self.first_timestamp.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_timestamp.to_le_bytes());
        buf[40..48].copy_from_slice(&self.record_count.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..52]);
        buf[52..56].copy_from_slice(&crc.to_le_bytes());
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Deserializes a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on bad magic, unsupported version, checksum mismatch,
    /// or unknown type tags.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ArchiveError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }

        let expected = u32::from_le_bytes(read_array(&buf[52..56]));
        let actual = crc32fast::hash(&buf[0..52]);
        if expected != actual {
            return Err(ArchiveError::ChecksumMismatch { expected, actual });
        }

        let dbr_type = DbrType::from_tag(buf[6])
            .ok_or_else(|| ArchiveError::CorruptRecord(format!("unknown DBR tag {}", buf[6])))?;
        let granularity = PartitionGranularity::from_tag(buf[7]).ok_or_else(|| {
            ArchiveError::CorruptRecord(format!("unknown granularity tag {}", buf[7]))
        })?;

        Ok(Self {
            version,
            dbr_type,
            granularity,
            window: TimeRange::new(
                i64::from_le_bytes(read_array(&buf[8..16])),
                i64::from_le_bytes(read_array(&buf[16..24])),
            ),
            first_timestamp: i64::from_le_bytes(read_array(&buf[24..32])),
            last_timestamp: i64::from_le_bytes(read_array(&buf[32..40])),
            record_count: u64::from_le_bytes(read_array(&buf[40..48])),
        })
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Encodes a sample as an escaped record, without the delimiter.
pub fn encode_record(sample: &Sample, window_start: Timestamp) -> Result<Vec<u8>> {
    let offset = sample
        .timestamp
        .checked_sub(window_start)
        .filter(|offset| *offset >= 0)
        .ok_or(ArchiveError::PartitionMismatch {
            sample_ts: sample.timestamp,
            start: window_start,
            end: i64::MAX,
        })?;

    let mut payload = Vec::with_capacity(32);
    payload.extend_from_slice(&(offset as u64).to_le_bytes());
    payload.extend_from_slice(&sample.severity.to_le_bytes());
    payload.extend_from_slice(&sample.status.to_le_bytes());
    payload.push(sample.dbr_type().tag());
    encode_value(&sample.value, &mut payload)?;

    let field_count = u16::try_from(sample.fields.len())
        .map_err(|_| ArchiveError::CorruptRecord("too many auxiliary fields".to_string()))?;
    payload.extend_from_slice(&field_count.to_le_bytes());
    for (name, value) in &sample.fields {
        put_str(&mut payload, name)?;
        put_str(&mut payload, value)?;
    }

    let crc = crc32fast::hash(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    Ok(escape(&payload))
}

/// Decodes a record (without its delimiter) back into a sample.
pub fn decode_record(record: &[u8], window_start: Timestamp) -> Result<Sample> {
    let payload = unescape(record)?;
    if payload.len() < 4 {
        return Err(ArchiveError::CorruptRecord("record too short".to_string()));
    }
    let (body, crc_bytes) = payload.split_at(payload.len() - 4);
    let expected = u32::from_le_bytes(read_array(crc_bytes));
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(ArchiveError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = RecordCursor::new(body);
    let offset = cursor.u64()?;
    let severity = cursor.i16()?;
    let status = cursor.i16()?;
    let tag = cursor.u8()?;
    let dbr_type = DbrType::from_tag(tag)
        .ok_or_else(|| ArchiveError::CorruptRecord(format!("unknown DBR tag {}", tag)))?;
    let value = decode_value(dbr_type, &mut cursor)?;

    let field_count = cursor.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let name = cursor.string()?;
        let value = cursor.string()?;
        fields.push((name, value));
    }

    Ok(Sample {
        timestamp: window_start + offset as i64,
        value,
        severity,
        status,
        fields,
    })
}

/// Decodes only the timestamp of a record.
pub fn decode_record_time(record: &[u8], window_start: Timestamp) -> Result<Timestamp> {
    let mut prefix = Vec::with_capacity(8);
    let mut iter = record.iter();
    while prefix.len() < 8 {
        match iter.next() {
            Some(&ESCAPE) => prefix.push(unescape_byte(iter.next().copied())?),
            Some(&byte) => prefix.push(byte),
            None => return Err(ArchiveError::CorruptRecord("record too short".to_string())),
        }
    }
    Ok(window_start + u64::from_le_bytes(read_array(&prefix)) as i64)
}

fn encode_value(value: &SampleValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        SampleValue::String(v) => put_str(out, v)?,
        SampleValue::Short(v) | SampleValue::Enum(v) => out.extend_from_slice(&v.to_le_bytes()),
        SampleValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        SampleValue::Byte(v) => out.extend_from_slice(&v.to_le_bytes()),
        SampleValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        SampleValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        SampleValue::StringArray(values) => {
            put_len(out, values.len())?;
            for v in values {
                put_str(out, v)?;
            }
        }
        SampleValue::ShortArray(values) | SampleValue::EnumArray(values) => {
            put_len(out, values.len())?;
            values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        SampleValue::FloatArray(values) => {
            put_len(out, values.len())?;
            values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        SampleValue::ByteArray(values) => {
            put_len(out, values.len())?;
            values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        SampleValue::IntArray(values) => {
            put_len(out, values.len())?;
            values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        SampleValue::DoubleArray(values) => {
            put_len(out, values.len())?;
            values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
    }
    Ok(())
}

fn decode_value(dbr_type: DbrType, cursor: &mut RecordCursor<'_>) -> Result<SampleValue> {
    Ok(match dbr_type {
        DbrType::ScalarString => SampleValue::String(cursor.string()?),
        DbrType::ScalarShort => SampleValue::Short(cursor.i16()?),
        DbrType::ScalarFloat => SampleValue::Float(f32::from_le_bytes(cursor.array()?)),
        DbrType::ScalarEnum => SampleValue::Enum(cursor.i16()?),
        DbrType::ScalarByte => SampleValue::Byte(cursor.u8()? as i8),
        DbrType::ScalarInt => SampleValue::Int(i32::from_le_bytes(cursor.array()?)),
        DbrType::ScalarDouble => SampleValue::Double(f64::from_le_bytes(cursor.array()?)),
        DbrType::WaveformString => {
            let len = cursor.u32()? as usize;
            let mut values = Vec::with_capacity(len.min(cursor.remaining()));
            for _ in 0..len {
                values.push(cursor.string()?);
            }
            SampleValue::StringArray(values)
        }
        DbrType::WaveformShort => SampleValue::ShortArray(cursor.vec(|c| c.i16())?),
        DbrType::WaveformFloat => {
            SampleValue::FloatArray(cursor.vec(|c| Ok(f32::from_le_bytes(c.array()?)))?)
        }
        DbrType::WaveformEnum => SampleValue::EnumArray(cursor.vec(|c| c.i16())?),
        DbrType::WaveformByte => SampleValue::ByteArray(cursor.vec(|c| Ok(c.u8()? as i8))?),
        DbrType::WaveformInt => {
            SampleValue::IntArray(cursor.vec(|c| Ok(i32::from_le_bytes(c.array()?)))?)
        }
        DbrType::WaveformDouble => {
            SampleValue::DoubleArray(cursor.vec(|c| Ok(f64::from_le_bytes(c.array()?)))?)
        }
    })
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| ArchiveError::CorruptRecord(format!("length {} exceeds u32", len)))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    put_len(out, value.len())?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Bounds-checked reader over an unescaped record payload.
struct RecordCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ArchiveError::CorruptRecord(format!(
                "record truncated at byte {}",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(read_array(self.take(N)?))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| ArchiveError::CorruptRecord(format!("invalid UTF-8: {}", err)))
    }

    fn vec<T>(&mut self, mut read: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let len = self.u32()? as usize;
        let mut values = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            values.push(read(self)?);
        }
        Ok(values)
    }
}

fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 16 + 1);
    for &byte in payload {
        match byte {
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            b'\n' => out.extend_from_slice(&[ESCAPE, ESCAPED_NEWLINE]),
            b'\r' => out.extend_from_slice(&[ESCAPE, ESCAPED_RETURN]),
            other => out.push(other),
        }
    }
    out
}

fn unescape(record: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(record.len());
    let mut iter = record.iter();
    while let Some(&byte) = iter.next() {
        if byte == ESCAPE {
            out.push(unescape_byte(iter.next().copied())?);
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

fn unescape_byte(next: Option<u8>) -> Result<u8> {
    match next {
        Some(ESCAPED_ESCAPE) => Ok(ESCAPE),
        Some(ESCAPED_NEWLINE) => Ok(b'\n'),
        Some(ESCAPED_RETURN) => Ok(b'\r'),
        other => Err(ArchiveError::CorruptRecord(format!(
            "invalid escape sequence {:?}",
            other
        ))),
    }
}

/// Appends samples to a partition.
///
/// The writer keeps the header in memory and rewrites it on
/// [`PartitionWriter::finish`]. Until then the on-disk header still
/// describes the records that existed when the writer was opened.
pub struct PartitionWriter<W: Write + Seek> {
    /// Destination of the partition bytes.
    inner: W,
    /// Header reflecting every appended record.
    header: PartitionHeader,
}

impl<W: Write + Seek> PartitionWriter<W> {
    /// Starts a new partition, writing its empty header.
    pub fn create(mut inner: W, header: PartitionHeader) -> Result<Self> {
        inner.seek(SeekFrom::Start(0))?;
        header.write_to(&mut inner)?;
        Ok(Self { inner, header })
    }

    /// Resumes an existing partition whose header was already read.
    ///
    /// The data must end on a record boundary; callers repair a torn tail
    /// found by [`inspect_tail`] first.
    pub fn resume(mut inner: W, header: PartitionHeader) -> Result<Self> {
        inner.seek(SeekFrom::End(0))?;
        Ok(Self { inner, header })
    }

    /// Returns the header including appended records.
    pub fn header(&self) -> &PartitionHeader {
        &self.header
    }

    /// Appends one sample.
    ///
    /// # Errors
    ///
    /// - `OutOfOrder` if the sample is not after the last record
    /// - `PartitionMismatch` if the sample lies outside the window
    /// - `PreconditionFailed` if the sample's type differs from the partition's
    pub fn append(&mut self, sample: &Sample) -> Result<()> {
        self.check(sample)?;
        let mut record = encode_record(sample, self.header.window.start)?;
        record.push(RECORD_DELIMITER);
        self.inner.write_all(&record)?;

        if self.header.is_empty() {
            self.header.first_timestamp = sample.timestamp;
        }
        self.header.last_timestamp = sample.timestamp;
        self.header.record_count += 1;
        Ok(())
    }

    /// Validates a sample against the partition without writing it.
    pub fn check(&self, sample: &Sample) -> Result<()> {
        if sample.dbr_type() != self.header.dbr_type {
            return Err(ArchiveError::PreconditionFailed(format!(
                "partition holds {:?}, sample is {:?}",
                self.header.dbr_type,
                sample.dbr_type()
            )));
        }
        if !self.header.window.contains(sample.timestamp) {
            return Err(ArchiveError::PartitionMismatch {
                sample_ts: sample.timestamp,
                start: self.header.window.start,
                end: self.header.window.end,
            });
        }
        if let Some(last_ts) = self.header.last() {
            if sample.timestamp <= last_ts {
                return Err(ArchiveError::OutOfOrder {
                    sample_ts: sample.timestamp,
                    last_ts,
                });
            }
        }
        Ok(())
    }

    /// Rewrites the header and flushes, returning the destination.
    pub fn finish(mut self) -> Result<(W, PartitionHeader)> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.header.write_to(&mut self.inner)?;
        self.inner.seek(SeekFrom::End(0))?;
        self.inner.flush()?;
        Ok((self.inner, self.header))
    }
}

/// Bytes read per step while scanning back for the last delimiter.
const TAIL_SCAN_CHUNK: usize = 4096;

/// Repair needed at the end of a partition before records are appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailRepair {
    /// The data ends with a delimiter, or holds no records.
    Clean,
    /// The last record is complete and accounted for, but unterminated.
    Terminate,
    /// The last record is torn; the data must be cut back to this length.
    Truncate(u64),
}

/// Inspects the end of a partition for the remains of an interrupted append.
///
/// Bytes after the last delimiter are kept only when they decode to the
/// record the header names as last; anything else is torn.
pub fn inspect_tail<R: Read + Seek>(
    inner: &mut R,
    header: &PartitionHeader,
) -> Result<TailRepair> {
    let data_start = HEADER_SIZE as u64;
    let end = inner.seek(SeekFrom::End(0))?;
    if end <= data_start {
        return Ok(TailRepair::Clean);
    }
    let mut last = [0u8; 1];
    inner.seek(SeekFrom::Start(end - 1))?;
    inner.read_exact(&mut last)?;
    if last[0] == RECORD_DELIMITER {
        return Ok(TailRepair::Clean);
    }

    let mut record_start = data_start;
    let mut pos = end;
    let mut chunk = vec![0u8; TAIL_SCAN_CHUNK];
    while pos > data_start {
        let from = pos.saturating_sub(TAIL_SCAN_CHUNK as u64).max(data_start);
        let buf = &mut chunk[..(pos - from) as usize];
        inner.seek(SeekFrom::Start(from))?;
        inner.read_exact(buf)?;
        if let Some(index) = buf.iter().rposition(|&byte| byte == RECORD_DELIMITER) {
            record_start = from + index as u64 + 1;
            break;
        }
        pos = from;
    }

    let mut record = vec![0u8; (end - record_start) as usize];
    inner.seek(SeekFrom::Start(record_start))?;
    inner.read_exact(&mut record)?;
    let complete = decode_record(&record, header.window.start)
        .map_or(false, |sample| header.last() == Some(sample.timestamp));
    Ok(if complete {
        TailRepair::Terminate
    } else {
        TailRepair::Truncate(record_start)
    })
}

/// Reads a partition's header and records.
pub struct PartitionReader<R: Read + Seek> {
    inner: R,
    header: PartitionHeader,
    data_end: u64,
}

impl<R: Read + Seek> PartitionReader<R> {
    /// Opens a partition, reading only its fixed-size header.
    pub fn open(mut inner: R) -> Result<Self> {
        inner.seek(SeekFrom::Start(0))?;
        let header = PartitionHeader::read_from(&mut inner)?;
        let data_end = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner,
            header,
            data_end,
        })
    }

    /// Returns the header.
    pub fn header(&self) -> &PartitionHeader {
        &self.header
    }

    /// Returns the byte range holding records.
    pub fn data_range(&self) -> std::ops::Range<u64> {
        HEADER_SIZE as u64..self.data_end
    }

    /// Finds the offset of the last record strictly before `target`.
    ///
    /// Returns `None` when `target` is at or before the first record or
    /// after the last one.
    pub fn seek_to(&mut self, target: Timestamp) -> Result<Option<u64>> {
        let comparator = SampleTimeComparator::new(target, self.header.window.start);
        let range = self.data_range();
        search(&mut self.inner, range, &comparator)
    }

    /// Returns every sample in the partition, in order.
    pub fn samples(self) -> Result<PartitionSamples<R>> {
        self.samples_from(HEADER_SIZE as u64)
    }

    /// Returns the samples starting at the record beginning at `offset`.
    pub fn samples_from(mut self, offset: u64) -> Result<PartitionSamples<R>> {
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(PartitionSamples {
            reader: BufReader::new(self.inner),
            window_start: self.header.window.start,
            line: Vec::new(),
            done: false,
        })
    }
}

/// Lazy iterator over the records of a partition.
pub struct PartitionSamples<R: Read> {
    reader: BufReader<R>,
    window_start: Timestamp,
    line: Vec<u8>,
    done: bool,
}

impl<R: Read> Iterator for PartitionSamples<R> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.line.clear();
            match self.reader.read_until(RECORD_DELIMITER, &mut self.line) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    if self.line.last() == Some(&RECORD_DELIMITER) {
                        self.line.pop();
                    }
                    if self.line.is_empty() {
                        continue;
                    }
                    return Some(decode_record(&self.line, self.window_start));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
        }
        None
    }
}

impl<R: Read + Send + 'static> PartitionSamples<R> {
    /// Boxes the iterator.
    pub fn boxed(self) -> SampleIter<'static> {
        Box::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SECOND: i64 = 1_000_000_000;

    fn day_header(dbr: DbrType) -> PartitionHeader {
        PartitionHeader::new(dbr, PartitionGranularity::Day, TimeRange::new(0, 86_400 * SECOND))
    }

    fn write_partition(samples: &[Sample]) -> Vec<u8> {
        let mut writer =
            PartitionWriter::create(Cursor::new(Vec::new()), day_header(DbrType::ScalarDouble))
                .unwrap();
        for sample in samples {
            writer.append(sample).unwrap();
        }
        writer.finish().unwrap().0.into_inner()
    }

    #[test]
    fn test_header_roundtrip_and_size() {
        let mut header = day_header(DbrType::WaveformInt);
        header.first_timestamp = 5;
        header.last_timestamp = 9;
        header.record_count = 2;

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = PartitionHeader::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.first(), Some(5));
        assert_eq!(decoded.last(), Some(9));
    }

    #[test]
    fn test_header_rejects_bad_magic_and_crc() {
        let mut buf = Vec::new();
        day_header(DbrType::ScalarInt).write_to(&mut buf).unwrap();

        let mut bad_crc = buf.clone();
        bad_crc[20] ^= 0xFF;
        assert!(matches!(
            PartitionHeader::read_from(&mut Cursor::new(&bad_crc)),
            Err(ArchiveError::ChecksumMismatch { .. })
        ));

        buf[0] = b'X';
        assert!(matches!(
            PartitionHeader::read_from(&mut Cursor::new(&buf)),
            Err(ArchiveError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_record_escaping_never_emits_delimiter() {
        // Offset 10 encodes to a '\n' byte, and the value holds ESC and '\r'.
        let sample = Sample::new(10, SampleValue::String("a\nb\x1bc\rd".to_string()))
            .with_alarm(2, 10)
            .with_field("EGU", "mA\n");
        let record = encode_record(&sample, 0).unwrap();
        assert!(!record.contains(&b'\n'));
        assert_eq!(decode_record(&record, 0).unwrap(), sample);
        assert_eq!(decode_record_time(&record, 0).unwrap(), 10);
    }

    #[test]
    fn test_record_values_roundtrip() {
        let values = vec![
            SampleValue::Short(-3),
            SampleValue::Float(1.5),
            SampleValue::Enum(2),
            SampleValue::Byte(-1),
            SampleValue::Int(70_000),
            SampleValue::Double(-2.25),
            SampleValue::StringArray(vec!["x".to_string(), String::new()]),
            SampleValue::ByteArray(vec![1, -2, 10]),
            SampleValue::DoubleArray(vec![0.5; 4]),
        ];
        for value in values {
            let sample = Sample::new(SECOND, value);
            let record = encode_record(&sample, 0).unwrap();
            assert_eq!(decode_record(&record, 0).unwrap(), sample);
        }
    }

    #[test]
    fn test_corrupt_record_detected() {
        let mut record = encode_record(&Sample::new(7, SampleValue::Int(1)), 0).unwrap();
        let idx = record.len() - 5;
        record[idx] ^= 0x40;
        assert!(decode_record(&record, 0).is_err());
    }

    #[test]
    fn test_writer_rejects_out_of_order_and_foreign_samples() {
        let mut writer =
            PartitionWriter::create(Cursor::new(Vec::new()), day_header(DbrType::ScalarDouble))
                .unwrap();
        writer.append(&Sample::new(10, SampleValue::Double(1.0))).unwrap();

        assert!(matches!(
            writer.append(&Sample::new(10, SampleValue::Double(2.0))),
            Err(ArchiveError::OutOfOrder { sample_ts: 10, last_ts: 10 })
        ));
        assert!(matches!(
            writer.append(&Sample::new(5, SampleValue::Double(2.0))),
            Err(ArchiveError::OutOfOrder { .. })
        ));
        assert!(matches!(
            writer.append(&Sample::new(86_400 * SECOND, SampleValue::Double(2.0))),
            Err(ArchiveError::PartitionMismatch { .. })
        ));
        assert!(matches!(
            writer.append(&Sample::new(20, SampleValue::Int(2))),
            Err(ArchiveError::PreconditionFailed(_))
        ));
        assert_eq!(writer.header().record_count, 1);
    }

    #[test]
    fn test_reader_iterates_and_resumes() {
        let samples: Vec<Sample> = (1..=5)
            .map(|i| Sample::new(i * SECOND, SampleValue::Double(i as f64)))
            .collect();
        let bytes = write_partition(&samples[..3]);

        let header = PartitionHeader::read_from(&mut Cursor::new(&bytes)).unwrap();
        let mut writer = PartitionWriter::resume(Cursor::new(bytes), header).unwrap();
        for sample in &samples[3..] {
            writer.append(sample).unwrap();
        }
        let (cursor, header) = writer.finish().unwrap();
        assert_eq!(header.record_count, 5);
        assert_eq!(header.first(), Some(SECOND));
        assert_eq!(header.last(), Some(5 * SECOND));

        let reader = PartitionReader::open(cursor).unwrap();
        let read: Vec<Sample> = reader.samples().unwrap().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn test_reader_tolerates_missing_trailing_delimiter() {
        let samples: Vec<Sample> = (1..=3)
            .map(|i| Sample::new(i * SECOND, SampleValue::Double(0.0)))
            .collect();
        let mut bytes = write_partition(&samples);
        assert_eq!(bytes.pop(), Some(RECORD_DELIMITER));

        let reader = PartitionReader::open(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.samples().unwrap().count(), 3);
    }

    #[test]
    fn test_inspect_tail_finds_torn_records() {
        let samples: Vec<Sample> = (1..=3)
            .map(|i| Sample::new(i * SECOND, SampleValue::Double(i as f64)))
            .collect();
        let bytes = write_partition(&samples);
        let header = PartitionHeader::read_from(&mut bytes.as_slice()).unwrap();
        let tail = |bytes: &[u8]| inspect_tail(&mut Cursor::new(bytes), &header).unwrap();
        assert_eq!(tail(bytes.as_slice()), TailRepair::Clean);
        assert_eq!(tail(&bytes[..HEADER_SIZE]), TailRepair::Clean);

        let unterminated = &bytes[..bytes.len() - 1];
        assert_eq!(tail(unterminated), TailRepair::Terminate);

        // Half of a fourth record the header never saw.
        let mut torn = bytes.clone();
        let record = encode_record(
            &Sample::new(4 * SECOND, SampleValue::Double(4.0)),
            header.window.start,
        )
        .unwrap();
        torn.extend_from_slice(&record[..record.len() / 2]);
        assert_eq!(tail(torn.as_slice()), TailRepair::Truncate(bytes.len() as u64));

        // A complete record the header never saw is dropped as well.
        let mut unaccounted = bytes.clone();
        unaccounted.extend_from_slice(&record);
        assert_eq!(tail(unaccounted.as_slice()), TailRepair::Truncate(bytes.len() as u64));

        // A torn first record cuts back to the header.
        let first_end = bytes[HEADER_SIZE..]
            .iter()
            .position(|&byte| byte == RECORD_DELIMITER)
            .unwrap();
        let torn_first = &bytes[..HEADER_SIZE + first_end / 2];
        assert_eq!(tail(torn_first), TailRepair::Truncate(HEADER_SIZE as u64));
    }

    #[test]
    fn test_seek_to_finds_preceding_record() {
        let samples: Vec<Sample> = (1..=100)
            .map(|i| Sample::new(2 * i * SECOND, SampleValue::Double(i as f64)))
            .collect();
        let bytes = write_partition(&samples);

        let mut reader = PartitionReader::open(Cursor::new(bytes)).unwrap();
        let offset = reader.seek_to(51 * SECOND).unwrap().unwrap();
        let mut rest = reader.samples_from(offset).unwrap();
        assert_eq!(rest.next().unwrap().unwrap().timestamp, 50 * SECOND);
        assert_eq!(rest.next().unwrap().unwrap().timestamp, 52 * SECOND);
    }
}

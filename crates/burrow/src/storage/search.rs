//! Time-seek search over a partition's records.
//!
//! The search is a binary search over byte offsets rather than record
//! indices, so it never needs an index or a full scan. Each step lands on an
//! arbitrary byte, snaps forward to the start of the next complete record,
//! and asks a [`CompareRecord`] strategy which half to continue in.
//!
//! A record starts at the beginning of the searched range or right after a
//! delimiter. Records are opaque to the search itself, which makes the same
//! core usable for the partition format and for synthetic test formats.

use crate::error::Result;
use crate::storage::file::{decode_record_time, RECORD_DELIMITER};
use crate::storage::Timestamp;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;

const SCAN_CHUNK: usize = 4096;

/// Direction chosen by a comparator for the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// The answer lies before the candidate record.
    GoLeft,
    /// The answer lies after the candidate record.
    GoRight,
    /// The candidate record is the answer.
    Stay,
}

/// Three-way comparison of a candidate record and its successor against a target.
pub trait CompareRecord {
    /// Compares `candidate` (and the record following it, if any) against the target.
    fn compare(&self, candidate: &[u8], next: Option<&[u8]>) -> Result<NextStep>;
}

impl<F> CompareRecord for F
where
    F: Fn(&[u8], Option<&[u8]>) -> Result<NextStep>,
{
    fn compare(&self, candidate: &[u8], next: Option<&[u8]>) -> Result<NextStep> {
        self(candidate, next)
    }
}

/// Comparator for partition records locating the last record before a target time.
///
/// `Stay` holds exactly when `candidate.time < target <= next.time`.
#[derive(Debug, Clone, Copy)]
pub struct SampleTimeComparator {
    target: Timestamp,
    window_start: Timestamp,
}

impl SampleTimeComparator {
    /// Creates a comparator for records of a partition starting at `window_start`.
    pub fn new(target: Timestamp, window_start: Timestamp) -> Self {
        Self {
            target,
            window_start,
        }
    }
}

impl CompareRecord for SampleTimeComparator {
    fn compare(&self, candidate: &[u8], next: Option<&[u8]>) -> Result<NextStep> {
        if decode_record_time(candidate, self.window_start)? >= self.target {
            return Ok(NextStep::GoLeft);
        }
        match next {
            // Nothing after the candidate to satisfy the target.
            None => Ok(NextStep::GoRight),
            Some(next) if decode_record_time(next, self.window_start)? < self.target => {
                Ok(NextStep::GoRight)
            }
            Some(_) => Ok(NextStep::Stay),
        }
    }
}

/// Searches `range` of `source` for the record the comparator settles on.
///
/// Returns the byte offset where that record starts, or `None` once the
/// candidate range collapses without a `Stay`. The final record may lack a
/// trailing delimiter.
///
/// # Errors
///
/// Returns an error if reading fails or the comparator rejects a record.
pub fn search<R, C>(source: &mut R, range: Range<u64>, comparator: &C) -> Result<Option<u64>>
where
    R: Read + Seek,
    C: CompareRecord + ?Sized,
{
    let mut lo = range.start;
    let mut hi = range.end;

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let start = match record_start_at_or_after(source, range.start, mid, hi)? {
            Some(start) => start,
            None => {
                hi = mid;
                continue;
            }
        };

        let (candidate, next_start) = read_record(source, start, range.end)?;
        let next = if next_start < range.end {
            let (next, _) = read_record(source, next_start, range.end)?;
            (!next.is_empty()).then_some(next)
        } else {
            None
        };

        match comparator.compare(&candidate, next.as_deref())? {
            NextStep::Stay => return Ok(Some(start)),
            NextStep::GoLeft => hi = mid,
            NextStep::GoRight => lo = start + 1,
        }
    }

    Ok(None)
}

/// Finds the first record start in `[pos, limit)`.
fn record_start_at_or_after<R: Read + Seek>(
    source: &mut R,
    range_start: u64,
    pos: u64,
    limit: u64,
) -> Result<Option<u64>> {
    if pos <= range_start {
        return Ok((range_start < limit).then_some(range_start));
    }

    // A record starts at `pos` iff the byte before it is a delimiter.
    let mut offset = pos - 1;
    source.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; SCAN_CHUNK];
    while offset < limit {
        let n = source.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(idx) = buf[..n].iter().position(|&b| b == RECORD_DELIMITER) {
            let start = offset + idx as u64 + 1;
            return Ok((start < limit).then_some(start));
        }
        offset += n as u64;
    }
    Ok(None)
}

/// Reads the record starting at `start`, returning it and the next record's start.
fn read_record<R: Read + Seek>(source: &mut R, start: u64, end: u64) -> Result<(Vec<u8>, u64)> {
    source.seek(SeekFrom::Start(start))?;
    let mut record = Vec::new();
    let mut buf = [0u8; SCAN_CHUNK];
    let mut offset = start;
    while offset < end {
        let want = (end - offset).min(SCAN_CHUNK as u64) as usize;
        let n = source.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        if let Some(idx) = buf[..n].iter().position(|&b| b == RECORD_DELIMITER) {
            record.extend_from_slice(&buf[..idx]);
            return Ok((record, offset + idx as u64 + 1));
        }
        record.extend_from_slice(&buf[..n]);
        offset += n as u64;
    }
    Ok((record, end))
}

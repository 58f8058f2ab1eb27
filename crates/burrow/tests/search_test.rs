//! Property-based tests for the time-seek search over partition files.
//!
//! For any strictly increasing partition and any target time, the search must
//! land on the last record before the target, or report nothing when the
//! target is at or before the first record or after the last one.

use alopex_burrow::lifecycle::PartitionGranularity;
use alopex_burrow::storage::{
    PartitionHeader, PartitionReader, PartitionWriter, Sample, SampleValue, NANOS_PER_SECOND,
};
use alopex_burrow::DbrType;
use proptest::prelude::*;
use std::io::Cursor;

// 2024-01-01T00:00:00Z
const YEAR_START: i64 = 1_704_067_200 * NANOS_PER_SECOND;

/// Strategy for strictly increasing timestamps inside one year.
fn timestamps_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(1i64..10 * NANOS_PER_SECOND, 1..200).prop_map(|deltas| {
        let mut current = YEAR_START;
        deltas
            .into_iter()
            .map(|delta| {
                current += delta;
                current
            })
            .collect()
    })
}

fn partition_bytes(timestamps: &[i64], value: impl Fn(i64) -> SampleValue) -> Vec<u8> {
    let granularity = PartitionGranularity::Year;
    let header = PartitionHeader::new(
        value(0).dbr_type(),
        granularity,
        granularity.window_for(timestamps[0]),
    );
    let mut writer = PartitionWriter::create(Cursor::new(Vec::new()), header).unwrap();
    for &ts in timestamps {
        writer.append(&Sample::new(ts, value(ts))).unwrap();
    }
    writer.finish().unwrap().0.into_inner()
}

/// Returns the times of the record at `offset` and the one after it.
fn records_at(bytes: &[u8], offset: u64) -> (i64, Option<i64>) {
    let reader = PartitionReader::open(Cursor::new(bytes.to_vec())).unwrap();
    let mut samples = reader.samples_from(offset).unwrap();
    let first = samples.next().unwrap().unwrap().timestamp;
    let next = samples.next().map(|s| s.unwrap().timestamp);
    (first, next)
}

fn check_search(bytes: &[u8], timestamps: &[i64], target: i64) -> Result<(), TestCaseError> {
    let mut reader = PartitionReader::open(Cursor::new(bytes.to_vec())).unwrap();
    let found = reader.seek_to(target).unwrap();
    let first = timestamps[0];
    let last = *timestamps.last().unwrap();

    if target <= first || target > last {
        prop_assert_eq!(found, None);
        return Ok(());
    }
    let offset = found.expect("target inside the partition must be found");
    let (at, next) = records_at(bytes, offset);
    prop_assert!(at < target);
    prop_assert!(next.map_or(false, |next| target <= next));
    Ok(())
}

proptest! {
    /// The found record is the last one strictly before the target.
    #[test]
    fn test_search_brackets_target(
        timestamps in timestamps_strategy(),
        offset in -NANOS_PER_SECOND..2_000 * NANOS_PER_SECOND,
    ) {
        let bytes = partition_bytes(&timestamps, |ts| SampleValue::Double(ts as f64));
        check_search(&bytes, &timestamps, YEAR_START + offset)?;
    }

    /// Exact record times, including the first and last, are handled at the boundaries.
    #[test]
    fn test_search_exact_record_times(
        timestamps in timestamps_strategy(),
        index in any::<prop::sample::Index>(),
    ) {
        let bytes = partition_bytes(&timestamps, |ts| SampleValue::Double(ts as f64));
        let target = timestamps[index.index(timestamps.len())];
        check_search(&bytes, &timestamps, target)?;
        check_search(&bytes, &timestamps, timestamps[0])?;
        check_search(&bytes, &timestamps, *timestamps.last().unwrap())?;
    }

    /// Payloads containing the delimiter byte never confuse record boundaries.
    #[test]
    fn test_search_with_newlines_in_values(
        timestamps in timestamps_strategy(),
        offset in 0i64..2_000 * NANOS_PER_SECOND,
    ) {
        let bytes = partition_bytes(&timestamps, |ts| {
            SampleValue::String(format!("line\n{}\r\n\x1b", ts))
        });
        check_search(&bytes, &timestamps, YEAR_START + offset)?;
    }
}

#[test]
fn test_even_seconds_scenario() {
    let timestamps: Vec<i64> = (1..=100)
        .map(|i| YEAR_START + 2 * i * NANOS_PER_SECOND)
        .collect();
    let bytes = partition_bytes(&timestamps, |_| SampleValue::Int(7));
    assert_eq!(DbrType::ScalarInt, SampleValue::Int(7).dbr_type());

    let mut reader = PartitionReader::open(Cursor::new(bytes.clone())).unwrap();
    let offset = reader
        .seek_to(YEAR_START + 51 * NANOS_PER_SECOND)
        .unwrap()
        .unwrap();
    let (at, next) = records_at(&bytes, offset);
    assert_eq!(at, YEAR_START + 50 * NANOS_PER_SECOND);
    assert_eq!(next, Some(YEAR_START + 52 * NANOS_PER_SECOND));
}

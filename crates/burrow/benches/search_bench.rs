//! Benchmarks for Burrow storage components.
//!
//! Run with: cargo bench --package alopex-burrow
//!
//! ## Benchmark Categories
//!
//! - **Partition Search**: time seek over partitions of growing size
//! - **Partition Scan**: full sequential read
//! - **Stage Append**: flush path into a plain stage

use alopex_burrow::config::StageDescriptor;
use alopex_burrow::lifecycle::PartitionGranularity;
use alopex_burrow::storage::{
    ContainerCache, PartitionHeader, PartitionReader, PartitionWriter, Sample, SampleValue,
    StorageStage, NANOS_PER_SECOND,
};
use alopex_burrow::DbrType;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

// 2024-01-01T00:00:00Z
const YEAR_START: i64 = 1_704_067_200 * NANOS_PER_SECOND;

/// Generate a slowly varying PV sampled once per second.
fn generate_samples(count: usize) -> Vec<Sample> {
    let mut value = 50.0;
    (0..count)
        .map(|i| {
            value += (i as f64 * 0.1).sin() * 0.1;
            Sample::new(
                YEAR_START + (i as i64 + 1) * NANOS_PER_SECOND,
                SampleValue::Double(value),
            )
        })
        .collect()
}

fn partition_bytes(samples: &[Sample]) -> Vec<u8> {
    let granularity = PartitionGranularity::Year;
    let header = PartitionHeader::new(
        DbrType::ScalarDouble,
        granularity,
        granularity.window_for(YEAR_START),
    );
    let mut writer = PartitionWriter::create(Cursor::new(Vec::new()), header).unwrap();
    for sample in samples {
        writer.append(sample).unwrap();
    }
    writer.finish().unwrap().0.into_inner()
}

fn bench_partition_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_seek");

    for size in [1_000, 10_000, 100_000].iter() {
        let bytes = partition_bytes(&generate_samples(*size));
        let target = YEAR_START + (*size as i64 / 2) * NANOS_PER_SECOND + 1;
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| {
                let mut reader = PartitionReader::open(Cursor::new(bytes.as_slice())).unwrap();
                reader.seek_to(black_box(target)).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_partition_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_scan");

    for size in [1_000, 10_000].iter() {
        let bytes = partition_bytes(&generate_samples(*size));
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| {
                let reader = PartitionReader::open(Cursor::new(bytes.as_slice())).unwrap();
                reader.samples().unwrap().count()
            })
        });
    }

    group.finish();
}

fn bench_stage_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage_append");

    for size in [1_000, 10_000].iter() {
        let samples = generate_samples(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &samples, |b, samples| {
            b.iter_with_setup(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let stage = StorageStage::new(
                        StageDescriptor::new(
                            "STS",
                            temp_dir.path().display().to_string(),
                            PartitionGranularity::Day,
                        ),
                        Arc::new(ContainerCache::new()),
                    )
                    .unwrap();
                    (temp_dir, stage)
                },
                |(_temp_dir, stage)| stage.append("BENCH:PV", black_box(samples)).unwrap(),
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_partition_seek,
    bench_partition_scan,
    bench_stage_append
);
criterion_main!(benches);

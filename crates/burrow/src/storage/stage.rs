//! A storage stage: one tier of a PV's storage chain.
//!
//! The stage binds a [`StageDescriptor`] to a [`PartitionLayout`] and the
//! shared [`ContainerCache`], and implements the partition-level operations
//! the writer and the ETL pipeline need: append, listing, reading, candidate
//! selection, and deletion.

use crate::config::{DeletionPolicy, StageDescriptor};
use crate::error::{ArchiveError, Result};
use crate::lifecycle::partition::{
    Compression, PartitionFileInfo, PartitionGranularity, PartitionLayout, PartitionPath,
    StorageRoot,
};
use crate::storage::container::ContainerCache;
use crate::storage::file::{
    inspect_tail, PartitionHeader, PartitionReader, PartitionWriter, TailRepair, HEADER_SIZE,
    RECORD_DELIMITER,
};
use crate::storage::{Sample, SampleIter, TimeRange, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A partition discovered in a stage.
pub type PartitionInfo = PartitionFileInfo;

/// Outcome of an append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendSummary {
    /// Number of samples written.
    pub samples: usize,
    /// Number of partitions touched.
    pub partitions: usize,
}

/// Readable bytes of one partition, from a file or a container entry.
#[derive(Debug)]
pub enum PartitionSource {
    /// A plain partition file.
    File(File),
    /// A container entry loaded into memory.
    Memory(Cursor<Vec<u8>>),
}

impl Read for PartitionSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File(file) => file.read(buf),
            Self::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for PartitionSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::File(file) => file.seek(pos),
            Self::Memory(cursor) => cursor.seek(pos),
        }
    }
}

/// Samples destined for one partition.
struct AppendPlan<'a> {
    path: PartitionPath,
    window: TimeRange,
    existing: Option<PartitionHeader>,
    samples: &'a [Sample],
}

/// How to undo a plain-file append.
enum PlainUndo {
    Remove(PathBuf),
    Restore {
        path: PathBuf,
        len: u64,
        header: PartitionHeader,
    },
}

/// One storage tier.
#[derive(Debug, Clone)]
pub struct StorageStage {
    descriptor: StageDescriptor,
    layout: PartitionLayout,
    containers: Arc<ContainerCache>,
}

impl StorageStage {
    /// Creates a stage from its descriptor.
    ///
    /// # Errors
    ///
    /// Returns `MalformedLocation` for an unparseable location and `Config`
    /// for per-PV containers requested inside a container root.
    pub fn new(descriptor: StageDescriptor, containers: Arc<ContainerCache>) -> Result<Self> {
        let root = StorageRoot::parse(&descriptor.location)?;
        if matches!(root, StorageRoot::Container { .. })
            && descriptor.compression == Compression::ZipPerPv
        {
            return Err(ArchiveError::Config(format!(
                "stage {} cannot nest per-PV containers inside {}",
                descriptor.name, descriptor.location
            )));
        }
        let layout = PartitionLayout::new(root, descriptor.granularity)
            .with_compression(descriptor.compression);
        Ok(Self {
            descriptor,
            layout,
            containers,
        })
    }

    /// Returns the stage name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Returns the descriptor.
    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    /// Returns the partition granularity.
    pub fn granularity(&self) -> PartitionGranularity {
        self.descriptor.granularity
    }

    /// Returns the partition location for `pv` at `ts`.
    pub fn partition_path(&self, pv: &str, ts: Timestamp) -> PartitionPath {
        self.layout.partition_path(pv, ts)
    }

    /// Lists live partitions of `pv`, oldest first.
    pub fn partitions(&self, pv: &str) -> Result<Vec<PartitionInfo>> {
        self.layout.list_partitions(pv, &self.containers)
    }

    /// Opens a partition for reading.
    pub fn open(&self, path: &PartitionPath) -> Result<PartitionSource> {
        match path {
            PartitionPath::File(file) => match File::open(file) {
                Ok(file) => Ok(PartitionSource::File(file)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    Err(ArchiveError::NotFound(format!("partition {}", file.display())))
                }
                Err(err) => Err(err.into()),
            },
            PartitionPath::Entry { container, name } => {
                let bytes = self.containers.get(container, false)?.read_entry(name)?;
                Ok(PartitionSource::Memory(Cursor::new(bytes)))
            }
        }
    }

    /// Reads a partition header without touching its records.
    pub fn read_header(&self, path: &PartitionPath) -> Result<PartitionHeader> {
        match path {
            PartitionPath::File(_) => {
                let mut source = self.open(path)?;
                PartitionHeader::read_from(&mut source)
            }
            PartitionPath::Entry { container, name } => {
                let bytes = self
                    .containers
                    .get(container, false)?
                    .read_entry_prefix(name, HEADER_SIZE)?;
                PartitionHeader::read_from(&mut Cursor::new(bytes))
            }
        }
    }

    /// Returns the header and a lazy sample stream of a partition.
    pub fn read(&self, path: &PartitionPath) -> Result<(PartitionHeader, SampleIter<'static>)> {
        let reader = PartitionReader::open(self.open(path)?)?;
        let header = *reader.header();
        Ok((header, reader.samples()?.boxed()))
    }

    /// Returns the samples of `pv` inside `range`, in order.
    ///
    /// The first overlapping partition is entered through the time-seek
    /// search instead of a scan from its start.
    pub fn samples_in_range(&self, pv: &str, range: TimeRange) -> Result<Vec<Sample>> {
        let mut samples = Vec::new();
        for info in self.partitions(pv)? {
            if !info.window.overlaps(&range) || info.size == 0 {
                continue;
            }
            let mut reader = PartitionReader::open(self.open(&info.path)?)?;
            let header = *reader.header();
            let (first, last) = match (header.first(), header.last()) {
                (Some(first), Some(last)) => (first, last),
                _ => continue,
            };
            if last < range.start || first >= range.end {
                continue;
            }
            let records = if range.start > first {
                match reader.seek_to(range.start)? {
                    Some(offset) => reader.samples_from(offset)?,
                    None => reader.samples()?,
                }
            } else {
                reader.samples()?
            };
            for sample in records {
                let sample = sample?;
                if sample.timestamp < range.start {
                    continue;
                }
                if sample.timestamp >= range.end {
                    break;
                }
                samples.push(sample);
            }
        }
        Ok(samples)
    }

    /// Appends a batch of samples to the partitions of `pv`.
    ///
    /// The batch must be strictly increasing in time and every sample must
    /// be newer than the last sample of its partition; otherwise the whole
    /// batch is rejected with `OutOfOrder` before anything is written. A
    /// failure while writing rolls back every partition touched by the batch.
    pub fn append(&self, pv: &str, samples: &[Sample]) -> Result<AppendSummary> {
        if samples.is_empty() {
            return Ok(AppendSummary::default());
        }
        for pair in samples.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(ArchiveError::OutOfOrder {
                    sample_ts: pair[1].timestamp,
                    last_ts: pair[0].timestamp,
                });
            }
        }

        let mut plans = Vec::new();
        let mut rest = samples;
        while let Some(first) = rest.first() {
            let window = self.granularity().window_for(first.timestamp);
            let len = rest
                .iter()
                .position(|sample| !window.contains(sample.timestamp))
                .unwrap_or(rest.len());
            let (group, tail) = rest.split_at(len);
            rest = tail;

            let path = self.partition_path(pv, window.start);
            let existing = self.existing_header(&path)?;
            if let Some(header) = &existing {
                if header.window != window {
                    return Err(ArchiveError::PartitionMismatch {
                        sample_ts: group[0].timestamp,
                        start: header.window.start,
                        end: header.window.end,
                    });
                }
                if let Some(last_ts) = header.last() {
                    if group[0].timestamp <= last_ts {
                        return Err(ArchiveError::OutOfOrder {
                            sample_ts: group[0].timestamp,
                            last_ts,
                        });
                    }
                }
            }
            plans.push(AppendPlan {
                path,
                window,
                existing,
                samples: group,
            });
        }

        let summary = AppendSummary {
            samples: samples.len(),
            partitions: plans.len(),
        };
        match self.layout.root() {
            StorageRoot::Plain(_) if self.descriptor.compression == Compression::None => {
                self.append_files(&plans)?
            }
            _ => self.append_entries(&plans)?,
        }
        debug!(
            pv = %pv,
            stage = %self.name(),
            samples = summary.samples,
            partitions = summary.partitions,
            "appended samples"
        );
        Ok(summary)
    }

    /// Drops samples already present in their destination partitions.
    ///
    /// Returns the remaining samples and how many were dropped. Used when a
    /// migration is retried after its source deletion failed.
    pub fn skip_existing(&self, pv: &str, samples: Vec<Sample>) -> Result<(Vec<Sample>, usize)> {
        let mut last_by_window: HashMap<Timestamp, Option<Timestamp>> = HashMap::new();
        let total = samples.len();
        let mut kept = Vec::with_capacity(total);
        for sample in samples {
            let window = self.granularity().window_for(sample.timestamp);
            let last = match last_by_window.get(&window.start) {
                Some(last) => *last,
                None => {
                    let path = self.partition_path(pv, window.start);
                    let last = self.existing_header(&path)?.and_then(|header| header.last());
                    last_by_window.insert(window.start, last);
                    last
                }
            };
            if last.map_or(true, |last| sample.timestamp > last) {
                kept.push(sample);
            }
        }
        let skipped = total - kept.len();
        Ok((kept, skipped))
    }

    /// Selects the partitions of `pv` eligible to leave this stage.
    ///
    /// A partition is eligible once its window ended at or before the start
    /// of the window containing `processing_time`. With a hold watermark,
    /// nothing is eligible until the oldest partition is `hold` windows old,
    /// after which partitions older than `hold - gather + 1` windows move.
    /// Zero-length partitions are never eligible; elapsed ones are removed.
    pub fn etl_candidates(
        &self,
        pv: &str,
        processing_time: Timestamp,
    ) -> Result<Vec<PartitionInfo>> {
        let granularity = self.granularity();
        let current = granularity.window_for(processing_time);
        let (hold, gather) = (self.descriptor.hold, self.descriptor.gather);
        let skip_hold_and_gather = hold == 0 && gather == 0;
        if hold < gather {
            warn!(
                stage = %self.name(),
                hold,
                gather,
                "hold is smaller than gather, skipping ETL"
            );
            return Ok(Vec::new());
        }

        let approx = granularity.approx_nanos();
        let hold_boundary = granularity
            .window_for(processing_time.saturating_sub(approx.saturating_mul(hold as i64)))
            .start;
        let gather_boundary = granularity
            .window_for(
                processing_time.saturating_sub(
                    approx.saturating_mul(hold as i64 - (gather as i64 - 1)),
                ),
            )
            .start;

        let mut candidates = Vec::new();
        let mut hold_ok = false;
        for info in self.partitions(pv)? {
            if info.window.end > current.start {
                continue;
            }
            if info.size == 0 {
                warn!(
                    pv = %pv,
                    stage = %self.name(),
                    partition = %info.path,
                    "removing zero-length partition"
                );
                if let Err(err) = self.remove(&info.path) {
                    warn!(
                        partition = %info.path,
                        error = %err,
                        "failed to remove zero-length partition"
                    );
                }
                continue;
            }
            if skip_hold_and_gather {
                candidates.push(info);
                continue;
            }
            if !hold_ok {
                if info.window.start < hold_boundary {
                    hold_ok = true;
                } else {
                    debug!(pv = %pv, stage = %self.name(), "hold not satisfied");
                    break;
                }
            }
            if info.window.start < gather_boundary {
                candidates.push(info);
            }
        }
        Ok(candidates)
    }

    /// Deletes a migrated partition according to `policy`.
    ///
    /// Returns `false` without deleting when the partition changed size since
    /// it was listed, or no longer exists.
    pub fn mark_for_deletion(&self, info: &PartitionInfo, policy: DeletionPolicy) -> Result<bool> {
        let current = match self.current_size(&info.path)? {
            Some(size) => size,
            None => {
                debug!(partition = %info.path, "partition already gone");
                return Ok(false);
            }
        };
        if current != info.size {
            warn!(
                partition = %info.path,
                listed = info.size,
                current,
                "partition changed since it was listed, not deleting"
            );
            return Ok(false);
        }

        match policy {
            DeletionPolicy::Immediate => self.remove(&info.path)?,
            DeletionPolicy::SoftDelete => self.rename(&info.path, &info.path.deleted_twin())?,
        }
        debug!(partition = %info.path, ?policy, "marked partition for deletion");
        Ok(true)
    }

    /// Purges soft-deleted partitions of `pv`. Returns how many were removed.
    pub fn reclaim(&self, pv: &str) -> Result<usize> {
        let deleted = self.layout.list_deleted(pv, &self.containers)?;
        for info in &deleted {
            self.remove(&info.path)?;
        }
        Ok(deleted.len())
    }

    /// Returns the timestamp of the oldest sample of `pv` in this stage.
    pub fn first_known_timestamp(&self, pv: &str) -> Result<Option<Timestamp>> {
        self.scan_headers(self.partitions(pv)?.into_iter(), |header| header.first())
    }

    /// Returns the timestamp of the newest sample of `pv` in this stage.
    pub fn last_known_timestamp(&self, pv: &str) -> Result<Option<Timestamp>> {
        self.scan_headers(self.partitions(pv)?.into_iter().rev(), |header| header.last())
    }

    fn scan_headers(
        &self,
        partitions: impl Iterator<Item = PartitionInfo>,
        pick: impl Fn(&PartitionHeader) -> Option<Timestamp>,
    ) -> Result<Option<Timestamp>> {
        for info in partitions {
            if info.size < HEADER_SIZE as u64 {
                continue;
            }
            match self.read_header(&info.path) {
                Ok(header) => {
                    if let Some(ts) = pick(&header) {
                        return Ok(Some(ts));
                    }
                }
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    warn!(partition = %info.path, error = %err, "skipping unreadable partition");
                }
            }
        }
        Ok(None)
    }

    fn existing_header(&self, path: &PartitionPath) -> Result<Option<PartitionHeader>> {
        match self.current_size(path)? {
            None | Some(0) => Ok(None),
            Some(_) => self.read_header(path).map(Some),
        }
    }

    fn current_size(&self, path: &PartitionPath) -> Result<Option<u64>> {
        match path {
            PartitionPath::File(file) => match fs::metadata(file) {
                Ok(meta) => Ok(Some(meta.len())),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            },
            PartitionPath::Entry { container, name } => {
                match self.containers.get(container, false) {
                    Ok(handle) => Ok(handle.entry_size(name)),
                    Err(ArchiveError::NotFound(_)) => Ok(None),
                    Err(err) => Err(err),
                }
            }
        }
    }

    fn remove(&self, path: &PartitionPath) -> Result<()> {
        match path {
            PartitionPath::File(file) => fs::remove_file(file)?,
            PartitionPath::Entry { container, name } => {
                self.containers.get(container, false)?.remove_entry(name)?
            }
        }
        Ok(())
    }

    fn rename(&self, from: &PartitionPath, to: &PartitionPath) -> Result<()> {
        match (from, to) {
            (PartitionPath::File(from), PartitionPath::File(to)) => fs::rename(from, to)?,
            (
                PartitionPath::Entry { container, name },
                PartitionPath::Entry { name: to_name, .. },
            ) => self
                .containers
                .get(container, false)?
                .rename_entry(name, to_name)?,
            _ => {
                return Err(ArchiveError::MalformedLocation(format!(
                    "cannot rename {} to {}",
                    from, to
                )))
            }
        }
        Ok(())
    }

    fn append_files(&self, plans: &[AppendPlan<'_>]) -> Result<()> {
        let mut undo = Vec::with_capacity(plans.len());
        for plan in plans {
            if let Err(err) = self.append_file(plan, &mut undo) {
                rollback(undo);
                return Err(err);
            }
        }
        Ok(())
    }

    fn append_file(&self, plan: &AppendPlan<'_>, undo: &mut Vec<PlainUndo>) -> Result<()> {
        let path = match &plan.path {
            PartitionPath::File(path) => path,
            other => {
                return Err(ArchiveError::MalformedLocation(format!(
                    "{} is not a plain partition",
                    other
                )))
            }
        };

        let mut writer = match plan.existing {
            Some(header) => {
                let mut file = OpenOptions::new().read(true).write(true).open(path)?;
                repair_file_tail(&mut file, &header, path)?;
                let len = file.metadata()?.len();
                undo.push(PlainUndo::Restore {
                    path: path.clone(),
                    len,
                    header,
                });
                PartitionWriter::resume(BufWriter::new(file), header)?
            }
            None => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(path)?;
                undo.push(PlainUndo::Remove(path.clone()));
                let header = PartitionHeader::new(
                    plan.samples[0].dbr_type(),
                    self.granularity(),
                    plan.window,
                );
                PartitionWriter::create(BufWriter::new(file), header)?
            }
        };

        for sample in plan.samples {
            writer.append(sample)?;
        }
        let (buffered, _) = writer.finish()?;
        let file = buffered
            .into_inner()
            .map_err(|err| io::Error::other(err.to_string()))?;
        file.sync_all()?;
        Ok(())
    }

    fn append_entries(&self, plans: &[AppendPlan<'_>]) -> Result<()> {
        let mut updates: BTreeMap<PathBuf, Vec<(String, Option<Vec<u8>>)>> = BTreeMap::new();
        for plan in plans {
            let (container, name) = match &plan.path {
                PartitionPath::Entry { container, name } => (container, name),
                other => {
                    return Err(ArchiveError::MalformedLocation(format!(
                        "{} is not a container entry",
                        other
                    )))
                }
            };
            let handle = self.containers.get(container, true)?;
            let mut writer = match plan.existing {
                Some(header) => {
                    let mut bytes = handle.read_entry(name)?;
                    repair_entry_tail(&mut bytes, &header, &plan.path)?;
                    PartitionWriter::resume(Cursor::new(bytes), header)?
                }
                None => {
                    let header = PartitionHeader::new(
                        plan.samples[0].dbr_type(),
                        self.granularity(),
                        plan.window,
                    );
                    PartitionWriter::create(Cursor::new(Vec::new()), header)?
                }
            };
            for sample in plan.samples {
                writer.append(sample)?;
            }
            let (cursor, _) = writer.finish()?;
            updates
                .entry(container.clone())
                .or_default()
                .push((name.clone(), Some(cursor.into_inner())));
        }

        // Each container is rewritten atomically; a PV's partitions share one.
        for (container, entries) in updates {
            self.containers.get(&container, true)?.write_entries(entries)?;
        }
        Ok(())
    }
}

fn repair_file_tail(file: &mut File, header: &PartitionHeader, path: &Path) -> Result<()> {
    let repair = inspect_tail(file, header)?;
    match repair {
        TailRepair::Clean => return Ok(()),
        TailRepair::Terminate => {
            file.seek(SeekFrom::End(0))?;
            file.write_all(&[RECORD_DELIMITER])?;
        }
        TailRepair::Truncate(len) => file.set_len(len)?,
    }
    file.sync_all()?;
    warn!(partition = %path.display(), ?repair, "repaired interrupted append");
    Ok(())
}

fn repair_entry_tail(
    bytes: &mut Vec<u8>,
    header: &PartitionHeader,
    path: &PartitionPath,
) -> Result<()> {
    let repair = inspect_tail(&mut Cursor::new(bytes.as_slice()), header)?;
    match repair {
        TailRepair::Clean => return Ok(()),
        TailRepair::Terminate => bytes.push(RECORD_DELIMITER),
        TailRepair::Truncate(len) => bytes.truncate(len as usize),
    }
    warn!(partition = %path, ?repair, "repaired interrupted append");
    Ok(())
}

fn rollback(undo: Vec<PlainUndo>) {
    for step in undo.into_iter().rev() {
        let result = match &step {
            PlainUndo::Remove(path) => match fs::remove_file(path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            },
            PlainUndo::Restore { path, len, header } => restore(path, *len, header),
        };
        if let Err(err) = result {
            let path = match &step {
                PlainUndo::Remove(path) | PlainUndo::Restore { path, .. } => path,
            };
            warn!(partition = %path.display(), error = %err, "append rollback failed");
        }
    }
}

fn restore(path: &Path, len: u64, header: &PartitionHeader) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.seek(SeekFrom::Start(0))?;
    header.write_to(&mut file)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::encode_record;
    use crate::storage::{DbrType, SampleValue, NANOS_PER_SECOND};
    use tempfile::TempDir;

    const DAY: i64 = 86_400 * NANOS_PER_SECOND;
    // 2024-03-05T00:00:00Z
    const BASE: i64 = 1_709_596_800 * NANOS_PER_SECOND;

    fn stage(location: String, granularity: PartitionGranularity) -> StorageStage {
        StorageStage::new(
            StageDescriptor::new("STS", location, granularity),
            Arc::new(ContainerCache::new()),
        )
        .unwrap()
    }

    fn doubles(times: impl IntoIterator<Item = i64>) -> Vec<Sample> {
        times
            .into_iter()
            .map(|ts| Sample::new(ts, SampleValue::Double(ts as f64)))
            .collect()
    }

    fn read_all(stage: &StorageStage, info: &PartitionInfo) -> Vec<Sample> {
        let (_, iter) = stage.read(&info.path).unwrap();
        iter.map(|s| s.unwrap()).collect()
    }

    #[test]
    fn test_append_splits_by_window() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Day,
        );
        let samples = doubles([BASE + 1, BASE + DAY - 1, BASE + DAY, BASE + 2 * DAY + 5]);
        let summary = stage.append("ABC:DEF", &samples).unwrap();
        assert_eq!(summary, AppendSummary { samples: 4, partitions: 3 });

        let partitions = stage.partitions("ABC:DEF").unwrap();
        assert_eq!(partitions.len(), 3);
        assert_eq!(read_all(&stage, &partitions[0]), samples[..2].to_vec());
        let header = stage.read_header(&partitions[0].path).unwrap();
        assert_eq!(header.first(), Some(BASE + 1));
        assert_eq!(header.last(), Some(BASE + DAY - 1));
        assert_eq!(stage.last_known_timestamp("ABC:DEF").unwrap(), Some(BASE + 2 * DAY + 5));
        assert_eq!(stage.first_known_timestamp("ABC:DEF").unwrap(), Some(BASE + 1));
    }

    #[test]
    fn test_out_of_order_append_leaves_partition_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Day,
        );
        stage.append("PV", &doubles([BASE + 10, BASE + 20])).unwrap();
        let before = stage.partitions("PV").unwrap();
        let PartitionPath::File(path) = &before[0].path else {
            panic!("expected plain file");
        };
        let bytes_before = fs::read(path).unwrap();

        for batch in [
            doubles([BASE + 20]),
            doubles([BASE + 15]),
            doubles([BASE + 30, BASE + 25]),
            doubles([BASE + DAY + 1, BASE + 5]),
        ] {
            assert!(matches!(
                stage.append("PV", &batch),
                Err(ArchiveError::OutOfOrder { .. })
            ));
        }
        assert_eq!(fs::read(path).unwrap(), bytes_before);
        assert_eq!(stage.partitions("PV").unwrap().len(), 1);
    }

    #[test]
    fn test_failed_append_rolls_back_every_partition() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Day,
        );
        stage.append("PV", &doubles([BASE + 10])).unwrap();
        let PartitionPath::File(path) = stage.partition_path("PV", BASE) else {
            panic!("expected plain file");
        };
        let bytes_before = fs::read(&path).unwrap();

        // The second sample has a different type and fails inside the writer.
        let mut batch = doubles([BASE + 20, BASE + DAY + 1]);
        batch.push(Sample::new(BASE + DAY + 2, SampleValue::Int(1)));
        assert!(matches!(
            stage.append("PV", &batch),
            Err(ArchiveError::PreconditionFailed(_))
        ));
        assert_eq!(fs::read(&path).unwrap(), bytes_before);
        assert_eq!(stage.partitions("PV").unwrap().len(), 1);
    }

    #[test]
    fn test_append_after_torn_record() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Day,
        );
        stage.append("PV", &doubles([BASE + 10, BASE + 20])).unwrap();
        let PartitionPath::File(path) = stage.partition_path("PV", BASE) else {
            panic!("expected plain file");
        };
        let clean_len = fs::metadata(&path).unwrap().len();
        // The process died halfway through writing a record.
        let record = encode_record(&doubles([BASE + 30])[0], BASE).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&record[..record.len() / 2]).unwrap();
        drop(file);

        stage.append("PV", &doubles([BASE + 40])).unwrap();
        let partitions = stage.partitions("PV").unwrap();
        assert_eq!(
            read_all(&stage, &partitions[0]),
            doubles([BASE + 10, BASE + 20, BASE + 40])
        );
        let mut file = File::open(&path).unwrap();
        let header = PartitionHeader::read_from(&mut file).unwrap();
        assert_eq!(inspect_tail(&mut file, &header).unwrap(), TailRepair::Clean);
        assert!(fs::metadata(&path).unwrap().len() > clean_len);
    }

    #[test]
    fn test_container_append_terminates_last_record() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("lts.zip");
        let stage = stage(
            format!("zip://{}!/lts", archive.display()),
            PartitionGranularity::Year,
        );
        stage.append("ABC:DEF", &doubles([BASE, BASE + 1])).unwrap();
        let PartitionPath::Entry { container, name } = stage.partition_path("ABC:DEF", BASE)
        else {
            panic!("expected container entry");
        };
        let handle = stage.containers.get(&container, false).unwrap();
        let mut bytes = handle.read_entry(&name).unwrap();
        assert_eq!(bytes.pop(), Some(RECORD_DELIMITER));
        handle.write_entries(vec![(name.clone(), Some(bytes))]).unwrap();

        stage.append("ABC:DEF", &doubles([BASE + 2])).unwrap();
        let partitions = stage.partitions("ABC:DEF").unwrap();
        assert_eq!(
            read_all(&stage, &partitions[0]),
            doubles([BASE, BASE + 1, BASE + 2])
        );
    }

    #[test]
    fn test_container_stage_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let location = format!("zip://{}!/lts", temp_dir.path().join("lts.zip").display());
        let stage = stage(location, PartitionGranularity::Year);

        stage.append("ABC:DEF", &doubles([BASE, BASE + 1])).unwrap();
        stage.append("ABC:DEF", &doubles([BASE + 2])).unwrap();
        assert!(matches!(
            stage.append("ABC:DEF", &doubles([BASE + 2])),
            Err(ArchiveError::OutOfOrder { .. })
        ));

        let partitions = stage.partitions("ABC:DEF").unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(read_all(&stage, &partitions[0]).len(), 3);
        assert_eq!(stage.last_known_timestamp("ABC:DEF").unwrap(), Some(BASE + 2));
    }

    #[test]
    fn test_zip_per_pv_stage() {
        let temp_dir = TempDir::new().unwrap();
        let stage = StorageStage::new(
            StageDescriptor::new(
                "MTS",
                temp_dir.path().display().to_string(),
                PartitionGranularity::Day,
            )
            .with_compression(Compression::ZipPerPv),
            Arc::new(ContainerCache::new()),
        )
        .unwrap();
        stage.append("A:B", &doubles([BASE, BASE + DAY])).unwrap();
        assert!(temp_dir.path().join("A/B_pb.zip").exists());
        assert_eq!(stage.partitions("A:B").unwrap().len(), 2);
    }

    #[test]
    fn test_samples_in_range_uses_partial_partitions() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Day,
        );
        let times: Vec<i64> = (0..48).map(|h| BASE + h * 3_600 * NANOS_PER_SECOND).collect();
        stage.append("PV", &doubles(times.clone())).unwrap();

        let range = TimeRange::new(times[20] + 1, times[30] + 1);
        let found = stage.samples_in_range("PV", range).unwrap();
        let expected: Vec<i64> = times[21..=30].to_vec();
        assert_eq!(found.iter().map(|s| s.timestamp).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_etl_candidates_elapsed_windows_only() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Day,
        );
        stage
            .append("PV", &doubles([BASE, BASE + DAY, BASE + 2 * DAY]))
            .unwrap();

        let candidates = stage.etl_candidates("PV", BASE + 2 * DAY + 1).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(stage.etl_candidates("PV", BASE + DAY - 1).unwrap().len(), 0);
        // A window ending exactly at the processing window start is elapsed.
        assert_eq!(stage.etl_candidates("PV", BASE + DAY).unwrap().len(), 1);
    }

    #[test]
    fn test_etl_candidates_hold_and_gather() {
        let temp_dir = TempDir::new().unwrap();
        let stage = StorageStage::new(
            StageDescriptor::new(
                "STS",
                temp_dir.path().display().to_string(),
                PartitionGranularity::Day,
            )
            .with_hold_gather(5, 3),
            Arc::new(ContainerCache::new()),
        )
        .unwrap();
        let now = BASE + 10 * DAY + 1;

        // Four elapsed days: hold not yet satisfied.
        stage
            .append("PV", &doubles((6..10).map(|d| BASE + d * DAY)))
            .unwrap();
        assert!(stage.etl_candidates("PV", now).unwrap().is_empty());

        // Two days later the oldest partition is past the hold watermark and
        // everything older than the gather boundary moves.
        stage.append("PV", &doubles([BASE + 10 * DAY])).unwrap();
        let candidates = stage.etl_candidates("PV", now + 2 * DAY).unwrap();
        let starts: Vec<i64> = candidates.iter().map(|c| c.window.start).collect();
        assert_eq!(starts, vec![BASE + 6 * DAY, BASE + 7 * DAY, BASE + 8 * DAY]);
    }

    #[test]
    fn test_zero_length_partitions_are_removed() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Day,
        );
        let PartitionPath::File(path) = stage.partition_path("PV", BASE) else {
            panic!("expected plain file");
        };
        fs::write(&path, b"").unwrap();
        assert!(stage.etl_candidates("PV", BASE + 2 * DAY).unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_mark_for_deletion_policies() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Day,
        );
        stage.append("PV", &doubles([BASE, BASE + DAY])).unwrap();
        let partitions = stage.partitions("PV").unwrap();

        assert!(stage
            .mark_for_deletion(&partitions[0], DeletionPolicy::SoftDelete)
            .unwrap());
        assert_eq!(stage.partitions("PV").unwrap().len(), 1);
        assert_eq!(stage.reclaim("PV").unwrap(), 1);

        // A partition that grew since listing is left alone.
        let mut stale = partitions[1].clone();
        stale.size -= 1;
        assert!(!stage.mark_for_deletion(&stale, DeletionPolicy::Immediate).unwrap());
        assert!(stage
            .mark_for_deletion(&partitions[1], DeletionPolicy::Immediate)
            .unwrap());
        assert!(stage.partitions("PV").unwrap().is_empty());
        assert!(!stage
            .mark_for_deletion(&partitions[1], DeletionPolicy::Immediate)
            .unwrap());
    }

    #[test]
    fn test_skip_existing_drops_already_migrated_samples() {
        let temp_dir = TempDir::new().unwrap();
        let stage = stage(
            temp_dir.path().display().to_string(),
            PartitionGranularity::Year,
        );
        stage.append("PV", &doubles([BASE, BASE + 5])).unwrap();
        let (kept, skipped) = stage
            .skip_existing("PV", doubles([BASE, BASE + 5, BASE + 6]))
            .unwrap();
        assert_eq!(skipped, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(DbrType::ScalarDouble, kept[0].dbr_type());
    }
}

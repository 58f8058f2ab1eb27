//! Partition granularity, naming, and on-disk layout.
//!
//! A partition holds one PV's samples for one calendar-aligned window. Its
//! location is derived from the PV name, the window, and the stage's storage
//! root, which is either a plain directory or an entry prefix inside a zip
//! container.

use crate::error::{ArchiveError, Result};
use crate::storage::container::ContainerCache;
use crate::storage::{TimeRange, Timestamp, NANOS_PER_SECOND};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File extension of live partition files.
pub const PARTITION_EXTENSION: &str = ".burrow";

/// Suffix appended to soft-deleted partitions.
pub const DELETED_SUFFIX: &str = ".deleted";

/// Scheme prefix for container-backed storage locations.
pub const CONTAINER_SCHEME: &str = "zip://";

/// Separator between a container path and the entry path inside it.
pub const CONTAINER_SEPARATOR: &str = "!/";

/// Characters in PV names that become directory separators in partition keys.
pub const DEFAULT_KEY_SEPARATORS: &[char] = &[':', '-'];

const SECONDS_PER_DAY: i64 = 86_400;

/// Calendar-aligned partition window sizes.
///
/// # Examples
/// ```rust,ignore
/// use alopex_burrow::lifecycle::partition::PartitionGranularity;
///
/// let window = PartitionGranularity::Day.window_for(ts);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionGranularity {
    /// Five-minute partitions.
    #[serde(rename = "5min")]
    Min5,
    /// Fifteen-minute partitions.
    #[serde(rename = "15min")]
    Min15,
    /// Thirty-minute partitions.
    #[serde(rename = "30min")]
    Min30,
    /// One-hour partitions.
    Hour,
    /// One-day partitions.
    Day,
    /// Calendar-month partitions.
    Month,
    /// Calendar-year partitions.
    Year,
}

impl PartitionGranularity {
    /// Returns the on-disk tag for this granularity.
    pub fn tag(self) -> u8 {
        match self {
            Self::Min5 => 0,
            Self::Min15 => 1,
            Self::Min30 => 2,
            Self::Hour => 3,
            Self::Day => 4,
            Self::Month => 5,
            Self::Year => 6,
        }
    }

    /// Parses an on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Min5,
            1 => Self::Min15,
            2 => Self::Min30,
            3 => Self::Hour,
            4 => Self::Day,
            5 => Self::Month,
            6 => Self::Year,
            _ => return None,
        })
    }

    /// Returns the fixed window length for sub-month granularities.
    fn fixed_nanos(self) -> Option<i64> {
        let seconds = match self {
            Self::Min5 => 300,
            Self::Min15 => 900,
            Self::Min30 => 1_800,
            Self::Hour => 3_600,
            Self::Day => SECONDS_PER_DAY,
            Self::Month | Self::Year => return None,
        };
        Some(seconds * NANOS_PER_SECOND)
    }

    /// Returns the approximate window length (31 days per month, 365 per year).
    pub fn approx_duration(self) -> Duration {
        match self.fixed_nanos() {
            Some(nanos) => Duration::from_nanos(nanos as u64),
            None if self == Self::Month => Duration::from_secs(31 * SECONDS_PER_DAY as u64),
            None => Duration::from_secs(365 * SECONDS_PER_DAY as u64),
        }
    }

    /// Returns the approximate window length in nanoseconds.
    pub fn approx_nanos(self) -> i64 {
        self.approx_duration().as_nanos() as i64
    }

    /// Returns the window containing `ts`.
    pub fn window_for(self, ts: Timestamp) -> TimeRange {
        if let Some(nanos) = self.fixed_nanos() {
            let start = align_timestamp(ts, nanos);
            return TimeRange::new(start, start + nanos);
        }

        let (days, _) = div_floor(div_floor(ts, NANOS_PER_SECOND).0, SECONDS_PER_DAY);
        let (year, month, _) = civil_from_days(days);
        let (start, end) = if self == Self::Month {
            let (next_year, next_month) = if month == 12 {
                (year + 1, 1)
            } else {
                (year, month + 1)
            };
            (
                days_from_civil(year, month, 1),
                days_from_civil(next_year, next_month, 1),
            )
        } else {
            (days_from_civil(year, 1, 1), days_from_civil(year + 1, 1, 1))
        };
        let day_nanos = SECONDS_PER_DAY * NANOS_PER_SECOND;
        TimeRange::new(start * day_nanos, end * day_nanos)
    }

    /// Returns the window following `window`.
    pub fn next_window(self, window: TimeRange) -> TimeRange {
        self.window_for(window.end)
    }

    /// Returns the partition name for the window containing `ts`.
    ///
    /// Names are `YYYY`, `YYYY_MM`, `YYYY_MM_DD`, `YYYY_MM_DD_HH`, or
    /// `YYYY_MM_DD_HH_mm` depending on the granularity.
    pub fn partition_name(self, ts: Timestamp) -> String {
        let start = self.window_for(ts).start;
        let (year, month, day, hour, minute) = timestamp_to_ymdhm(start);
        match self {
            Self::Year => format!("{:04}", year),
            Self::Month => format!("{:04}_{:02}", year, month),
            Self::Day => format!("{:04}_{:02}_{:02}", year, month, day),
            Self::Hour => format!("{:04}_{:02}_{:02}_{:02}", year, month, day, hour),
            Self::Min5 | Self::Min15 | Self::Min30 => format!(
                "{:04}_{:02}_{:02}_{:02}_{:02}",
                year, month, day, hour, minute
            ),
        }
    }

    /// Parses a partition name produced by [`Self::partition_name`].
    pub fn parse_partition_name(self, name: &str) -> Option<TimeRange> {
        let parts: Vec<&str> = name.split('_').collect();
        let expected = match self {
            Self::Year => 1,
            Self::Month => 2,
            Self::Day => 3,
            Self::Hour => 4,
            Self::Min5 | Self::Min15 | Self::Min30 => 5,
        };
        if parts.len() != expected {
            return None;
        }

        let mut values = [1i64, 1, 1, 0, 0];
        for (slot, part) in values.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            *slot = part.parse().ok()?;
        }
        let [year, month, day, hour, minute] = values;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 {
            return None;
        }

        let days = days_from_civil(year as i32, month as u32, day as u32);
        let seconds = days * SECONDS_PER_DAY + hour * 3_600 + minute * 60;
        let window = self.window_for(seconds * NANOS_PER_SECOND);
        // Reject names that are not window-aligned, e.g. minute 07 for 5min.
        if self.partition_name(window.start) != name {
            return None;
        }
        Some(window)
    }
}

impl fmt::Display for PartitionGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Min5 => "5min",
            Self::Min15 => "15min",
            Self::Min30 => "30min",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        };
        f.write_str(name)
    }
}

/// How a stage packs partitions on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// One plain file per partition.
    #[default]
    None,
    /// One zip container per PV holding all its partitions.
    ZipPerPv,
}

/// Parsed storage root of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRoot {
    /// A plain filesystem directory.
    Plain(PathBuf),
    /// An entry prefix inside a single zip container.
    Container {
        /// Path of the container file.
        archive: PathBuf,
        /// Entry prefix inside the container (no leading or trailing `/`).
        prefix: String,
    },
}

impl StorageRoot {
    /// Parses a storage location.
    ///
    /// Accepted forms are a plain path, `file://<path>`, and
    /// `zip://<archive>!/<prefix>`. A `zip://` location without the `!/`
    /// separator falls back to the plain path it names.
    ///
    /// # Errors
    ///
    /// Returns `MalformedLocation` for empty locations, unknown schemes, and
    /// container locations with neither a separator nor a fallback path.
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(ArchiveError::MalformedLocation(
                "empty storage location".to_string(),
            ));
        }

        if let Some(rest) = location.strip_prefix(CONTAINER_SCHEME) {
            return match rest.find(CONTAINER_SEPARATOR) {
                Some(idx) => {
                    let archive = &rest[..idx];
                    if archive.is_empty() {
                        return Err(ArchiveError::MalformedLocation(format!(
                            "container location {} names no archive",
                            location
                        )));
                    }
                    let prefix = rest[idx + CONTAINER_SEPARATOR.len()..]
                        .trim_matches('/')
                        .to_string();
                    Ok(Self::Container {
                        archive: PathBuf::from(archive),
                        prefix,
                    })
                }
                None if !rest.is_empty() => Ok(Self::Plain(PathBuf::from(rest))),
                None => Err(ArchiveError::MalformedLocation(format!(
                    "container location {} has no separator and no fallback path",
                    location
                ))),
            };
        }

        if let Some(rest) = location.strip_prefix("file://") {
            if rest.is_empty() {
                return Err(ArchiveError::MalformedLocation(location.to_string()));
            }
            return Ok(Self::Plain(PathBuf::from(rest)));
        }

        if location.contains("://") {
            return Err(ArchiveError::MalformedLocation(format!(
                "unknown scheme in {}",
                location
            )));
        }

        Ok(Self::Plain(PathBuf::from(location)))
    }
}

/// Concrete location of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionPath {
    /// A plain file.
    File(PathBuf),
    /// An entry inside a zip container.
    Entry {
        /// Path of the container file.
        container: PathBuf,
        /// Entry name inside the container.
        name: String,
    },
}

impl PartitionPath {
    /// Returns the location of the soft-deleted twin of this partition.
    pub fn deleted_twin(&self) -> Self {
        match self {
            Self::File(path) => {
                let mut name = path.as_os_str().to_owned();
                name.push(DELETED_SUFFIX);
                Self::File(PathBuf::from(name))
            }
            Self::Entry { container, name } => Self::Entry {
                container: container.clone(),
                name: format!("{}{}", name, DELETED_SUFFIX),
            },
        }
    }
}

impl fmt::Display for PartitionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Entry { container, name } => write!(
                f,
                "{}{}{}{}",
                CONTAINER_SCHEME,
                container.display(),
                CONTAINER_SEPARATOR,
                name
            ),
        }
    }
}

/// A partition file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFileInfo {
    /// Location of the partition.
    pub path: PartitionPath,
    /// Window covered by the partition, parsed from its name.
    pub window: TimeRange,
    /// Size in bytes when listed.
    pub size: u64,
}

/// Converts a PV name into its partition key.
///
/// Separators become `/` and a trailing `:` is appended, so `ABC:DEF`
/// becomes `ABC/DEF:`.
pub fn pv_key(pv: &str) -> String {
    let mut key: String = pv
        .chars()
        .map(|c| {
            if DEFAULT_KEY_SEPARATORS.contains(&c) {
                '/'
            } else {
                c
            }
        })
        .collect();
    key.push(':');
    key
}

/// Maps PVs and timestamps to partition locations for one stage.
///
/// # Examples
/// ```rust,ignore
/// use alopex_burrow::lifecycle::partition::{PartitionGranularity, PartitionLayout, StorageRoot};
///
/// let layout = PartitionLayout::new(StorageRoot::parse("/arch/sts")?, PartitionGranularity::Hour);
/// let path = layout.partition_path("ABC:DEF", ts);
/// ```
#[derive(Debug, Clone)]
pub struct PartitionLayout {
    root: StorageRoot,
    granularity: PartitionGranularity,
    compression: Compression,
}

impl PartitionLayout {
    /// Creates a layout storing one plain file per partition.
    pub fn new(root: StorageRoot, granularity: PartitionGranularity) -> Self {
        Self {
            root,
            granularity,
            compression: Compression::None,
        }
    }

    /// Sets the compression mode.
    ///
    /// `ZipPerPv` only applies to plain roots; a container root already
    /// packs every partition into one archive.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Returns the storage root.
    pub fn root(&self) -> &StorageRoot {
        &self.root
    }

    /// Returns the partition granularity.
    pub fn granularity(&self) -> PartitionGranularity {
        self.granularity
    }

    /// Returns the partition location for `pv` at `ts`.
    pub fn partition_path(&self, pv: &str, ts: Timestamp) -> PartitionPath {
        let file_name = format!(
            "{}{}{}",
            pv_key(pv),
            self.granularity.partition_name(ts),
            PARTITION_EXTENSION
        );
        match (&self.root, self.compression) {
            (StorageRoot::Plain(dir), Compression::None) => {
                PartitionPath::File(dir.join(file_name))
            }
            (StorageRoot::Plain(dir), Compression::ZipPerPv) => {
                let (_, leaf) = split_key(&file_name);
                PartitionPath::Entry {
                    container: pv_container(dir, pv),
                    name: leaf.to_string(),
                }
            }
            (StorageRoot::Container { archive, prefix }, _) => PartitionPath::Entry {
                container: archive.clone(),
                name: join_entry(prefix, &file_name),
            },
        }
    }

    /// Lists live partitions of `pv`, sorted by window start.
    ///
    /// A missing directory or container yields an empty list.
    pub fn list_partitions(
        &self,
        pv: &str,
        containers: &ContainerCache,
    ) -> Result<Vec<PartitionFileInfo>> {
        self.list_with_suffix(pv, containers, PARTITION_EXTENSION)
    }

    /// Lists soft-deleted partitions of `pv`.
    pub fn list_deleted(
        &self,
        pv: &str,
        containers: &ContainerCache,
    ) -> Result<Vec<PartitionFileInfo>> {
        let suffix = format!("{}{}", PARTITION_EXTENSION, DELETED_SUFFIX);
        self.list_with_suffix(pv, containers, &suffix)
    }

    fn list_with_suffix(
        &self,
        pv: &str,
        containers: &ContainerCache,
        suffix: &str,
    ) -> Result<Vec<PartitionFileInfo>> {
        let key = pv_key(pv);
        let mut files = Vec::new();

        match (&self.root, self.compression) {
            (StorageRoot::Plain(dir), Compression::None) => {
                let (parent, leaf) = split_key(&key);
                let search_dir = if parent.is_empty() {
                    dir.clone()
                } else {
                    dir.join(parent)
                };
                let entries = match fs::read_dir(&search_dir) {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
                    Err(err) => return Err(err.into()),
                };
                for entry in entries {
                    let entry = entry?;
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    let file_name = match path.file_name().and_then(|name| name.to_str()) {
                        Some(name) => name,
                        None => continue,
                    };
                    if let Some(window) = self.window_from_name(file_name, leaf, suffix) {
                        let size = entry.metadata()?.len();
                        files.push(PartitionFileInfo {
                            path: PartitionPath::File(path),
                            window,
                            size,
                        });
                    }
                }
            }
            (StorageRoot::Plain(dir), Compression::ZipPerPv) => {
                let archive = pv_container(dir, pv);
                let (_, leaf) = split_key(&key);
                self.list_container(&archive, "", leaf, suffix, containers, &mut files)?;
            }
            (StorageRoot::Container { archive, prefix }, _) => {
                let (parent, leaf) = split_key(&key);
                let entry_dir = join_entry(prefix, parent);
                self.list_container(archive, &entry_dir, leaf, suffix, containers, &mut files)?;
            }
        }

        files.sort_by_key(|info| info.window.start);
        Ok(files)
    }

    fn list_container(
        &self,
        archive: &Path,
        entry_dir: &str,
        leaf: &str,
        suffix: &str,
        containers: &ContainerCache,
        files: &mut Vec<PartitionFileInfo>,
    ) -> Result<()> {
        let container = match containers.get(archive, false) {
            Ok(container) => container,
            Err(ArchiveError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let dir_prefix = if entry_dir.is_empty() {
            String::new()
        } else {
            format!("{}/", entry_dir.trim_end_matches('/'))
        };
        for (name, size) in container.entries_with_prefix(&dir_prefix) {
            let file_name = &name[dir_prefix.len()..];
            if file_name.contains('/') {
                continue;
            }
            if let Some(window) = self.window_from_name(file_name, leaf, suffix) {
                files.push(PartitionFileInfo {
                    path: PartitionPath::Entry {
                        container: archive.to_path_buf(),
                        name: name.clone(),
                    },
                    window,
                    size,
                });
            }
        }
        Ok(())
    }

    fn window_from_name(&self, file_name: &str, leaf: &str, suffix: &str) -> Option<TimeRange> {
        let partition_name = file_name.strip_prefix(leaf)?.strip_suffix(suffix)?;
        self.granularity.parse_partition_name(partition_name)
    }
}

fn pv_container(dir: &Path, pv: &str) -> PathBuf {
    let key = pv_key(pv);
    dir.join(format!("{}_pb.zip", key.trim_end_matches(':')))
}

/// Splits `a/b/c:rest` into (`a/b`, `c:rest`).
fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(idx) => (&key[..idx], &key[idx + 1..]),
        None => ("", key),
    }
}

fn join_entry(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, name),
    }
}

/// Returns the calendar year (UTC) of a timestamp.
pub fn year_of(ts: Timestamp) -> i32 {
    timestamp_to_ymdhm(ts).0
}

fn align_timestamp(timestamp: Timestamp, duration_nanos: i64) -> i64 {
    let (quotient, _) = div_floor(timestamp, duration_nanos);
    quotient * duration_nanos
}

fn div_floor(value: i64, divisor: i64) -> (i64, i64) {
    let mut quotient = value / divisor;
    let mut remainder = value % divisor;
    if remainder < 0 {
        quotient -= 1;
        remainder += divisor;
    }
    (quotient, remainder)
}

fn timestamp_to_ymdhm(timestamp: Timestamp) -> (i32, u32, u32, u32, u32) {
    let (seconds, _) = div_floor(timestamp, NANOS_PER_SECOND);
    let (days, seconds_of_day) = div_floor(seconds, SECONDS_PER_DAY);
    let hour = (seconds_of_day / 3600) as u32;
    let minute = ((seconds_of_day % 3600) / 60) as u32;
    let (year, month, day) = civil_from_days(days);
    (year, month, day, hour, minute)
}

fn civil_from_days(days: i64) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 {
        z / 146_097
    } else {
        (z - 146_096) / 146_097
    };
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = mp + if mp < 10 { 3 } else { -9 };
    let year = y + if month <= 2 { 1 } else { 0 };
    (year as i32, month as u32, day as u32)
}

fn days_from_civil(year: i32, month: u32, day: u32) -> i64 {
    let y = year as i64 - if month <= 2 { 1 } else { 0 };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let m = month as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

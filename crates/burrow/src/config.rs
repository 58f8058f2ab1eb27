//! Engine and stage configuration.
//!
//! ## EngineConfig
//!
//! - **writer.flush_period_secs**: how often buffered samples are flushed (default: 10 s, minimum 10 s)
//! - **writer.flush_mode**: `per_channel` (default) serializes flushes per buffer, `global` serializes all flushes
//! - **writer.buffer_capacity**: samples held per channel before the oldest is dropped (default: 100 000)
//! - **etl.pass_period_secs**: how often the ETL pass runs (default: 5 min)
//! - **etl.deletion_policy**: `immediate` (default) or `soft_delete`
//! - **etl.max_gating_intervals**: intervals kept per gating scope (default: 100)
//! - **etl.padding_fraction**: fraction of a source granularity subtracted from "now" (default: 0.1)
//!
//! ## Usage
//!
//! ```ignore
//! use alopex_burrow::config::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     [writer]
//!     flush_period_secs = 30
//!
//!     [etl]
//!     deletion_policy = "soft_delete"
//! "#)?;
//! ```

use crate::error::{ArchiveError, Result};
use crate::lifecycle::partition::{Compression, PartitionGranularity};
use crate::storage::DbrType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

/// Minimum writer flush period.
pub const MIN_FLUSH_PERIOD: Duration = Duration::from_secs(10);

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Writer scheduler settings.
    #[serde(default)]
    pub writer: WriterConfig,
    /// ETL pipeline settings.
    #[serde(default)]
    pub etl: EtlConfig,
}

impl EngineConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| ArchiveError::Config(err.to_string()))
    }

    /// Loads a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// How writer flushes are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// At most one flush in flight per channel buffer.
    #[default]
    PerChannel,
    /// At most one flush in flight across all buffers.
    Global,
}

/// Writer scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Flush period in seconds (clamped to at least 10).
    #[serde(default = "default_flush_period_secs")]
    pub flush_period_secs: u64,

    /// Flush serialization mode.
    #[serde(default)]
    pub flush_mode: FlushMode,

    /// Per-channel buffer capacity in samples.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_flush_period_secs() -> u64 {
    10
}

fn default_buffer_capacity() -> usize {
    100_000
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_period_secs: default_flush_period_secs(),
            flush_mode: FlushMode::default(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl WriterConfig {
    /// Returns the flush period, clamped to [`MIN_FLUSH_PERIOD`].
    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_period_secs).max(MIN_FLUSH_PERIOD)
    }

    /// Sets the flush period in seconds.
    pub fn with_flush_period_secs(mut self, secs: u64) -> Self {
        self.flush_period_secs = secs;
        self
    }

    /// Sets the flush mode.
    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Sets the per-channel buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

/// What happens to a source partition after a confirmed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Remove the partition right away.
    #[default]
    Immediate,
    /// Rename the partition aside; space is recovered by a later reclaim.
    SoftDelete,
}

/// ETL pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    /// Period between ETL passes in seconds.
    #[serde(default = "default_pass_period_secs")]
    pub pass_period_secs: u64,

    /// Deletion policy for migrated source partitions.
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    /// Maximum gating intervals kept per scope.
    #[serde(default = "default_max_gating_intervals")]
    pub max_gating_intervals: usize,

    /// Fraction of the source granularity subtracted from "now" in periodic passes.
    #[serde(default = "default_padding_fraction")]
    pub padding_fraction: f64,
}

fn default_pass_period_secs() -> u64 {
    300
}

fn default_max_gating_intervals() -> usize {
    100
}

fn default_padding_fraction() -> f64 {
    0.1
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            pass_period_secs: default_pass_period_secs(),
            deletion_policy: DeletionPolicy::default(),
            max_gating_intervals: default_max_gating_intervals(),
            padding_fraction: default_padding_fraction(),
        }
    }
}

impl EtlConfig {
    /// Returns the pass period.
    pub fn pass_period(&self) -> Duration {
        Duration::from_secs(self.pass_period_secs.max(1))
    }

    /// Sets the deletion policy.
    pub fn with_deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = policy;
        self
    }

    /// Sets the maximum gating intervals per scope.
    pub fn with_max_gating_intervals(mut self, max: usize) -> Self {
        self.max_gating_intervals = max;
        self
    }
}

/// Description of one storage stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Stage name, unique within a PV's stage list (e.g. `STS`, `MTS`, `LTS`).
    pub name: String,

    /// Storage location: a directory, `file://<dir>`, or `zip://<archive>!/<prefix>`.
    pub location: String,

    /// Partition granularity.
    pub granularity: PartitionGranularity,

    /// On-disk packing of partitions.
    #[serde(default)]
    pub compression: Compression,

    /// Age, in windows, the oldest partition must reach before ETL moves data out.
    #[serde(default)]
    pub hold: usize,

    /// Windows kept back from the hold watermark once it is reached, plus one.
    #[serde(default)]
    pub gather: usize,

    /// Value type data is converted to when it enters this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbr_type: Option<DbrType>,
}

impl StageDescriptor {
    /// Creates a descriptor for a plain stage.
    pub fn new(
        name: impl Into<String>,
        location: impl Into<String>,
        granularity: PartitionGranularity,
    ) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            granularity,
            compression: Compression::None,
            hold: 0,
            gather: 0,
            dbr_type: None,
        }
    }

    /// Sets the compression mode.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the hold and gather watermarks.
    pub fn with_hold_gather(mut self, hold: usize, gather: usize) -> Self {
        self.hold = hold;
        self.gather = gather;
        self
    }

    /// Sets the target value type.
    pub fn with_dbr_type(mut self, dbr_type: DbrType) -> Self {
        self.dbr_type = Some(dbr_type);
        self
    }
}

/// The ordered stage list of one PV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvArchiveConfig {
    /// PV name.
    pub pv: String,
    /// Current value type of the PV.
    pub dbr_type: DbrType,
    /// Stages from fastest to slowest.
    pub stages: Vec<StageDescriptor>,
}

impl PvArchiveConfig {
    /// Creates a PV configuration.
    pub fn new(pv: impl Into<String>, dbr_type: DbrType, stages: Vec<StageDescriptor>) -> Self {
        Self {
            pv: pv.into(),
            dbr_type,
            stages,
        }
    }

    /// Returns the position of the named stage.
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name == name)
    }
}

/// Read-only lookup of per-PV stage configuration.
pub trait PvConfigSource: Send + Sync {
    /// Returns the configuration of `pv`, if it is archived.
    fn pv_config(&self, pv: &str) -> Option<PvArchiveConfig>;

    /// Returns every configured PV name.
    fn pv_names(&self) -> Vec<String>;
}

/// In-memory [`PvConfigSource`].
#[derive(Debug, Default)]
pub struct StaticPvConfig {
    pvs: RwLock<HashMap<String, PvArchiveConfig>>,
}

impl StaticPvConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a PV's configuration.
    pub fn insert(&self, config: PvArchiveConfig) {
        self.pvs
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(config.pv.clone(), config);
    }

    /// Removes a PV's configuration.
    pub fn remove(&self, pv: &str) -> Option<PvArchiveConfig> {
        self.pvs
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(pv)
    }
}

impl PvConfigSource for StaticPvConfig {
    fn pv_config(&self, pv: &str) -> Option<PvArchiveConfig> {
        self.pvs
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(pv)
            .cloned()
    }

    fn pv_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pvs
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.writer.flush_period(), Duration::from_secs(10));
        assert_eq!(config.writer.flush_mode, FlushMode::PerChannel);
        assert_eq!(config.etl.deletion_policy, DeletionPolicy::Immediate);
        assert_eq!(config.etl.max_gating_intervals, 100);
    }

    #[test]
    fn test_flush_period_is_clamped() {
        let config = WriterConfig::default().with_flush_period_secs(1);
        assert_eq!(config.flush_period(), MIN_FLUSH_PERIOD);
        let config = WriterConfig::default().with_flush_period_secs(45);
        assert_eq!(config.flush_period(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_full_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [writer]
            flush_period_secs = 30
            flush_mode = "global"

            [etl]
            deletion_policy = "soft_delete"
            max_gating_intervals = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.writer.flush_mode, FlushMode::Global);
        assert_eq!(config.etl.deletion_policy, DeletionPolicy::SoftDelete);
        assert_eq!(config.etl.max_gating_intervals, 5);
        assert_eq!(config.etl.pass_period_secs, 300);
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("[writer\nflush"),
            Err(ArchiveError::Config(_))
        ));
    }

    #[test]
    fn test_stage_descriptor_deserializes() {
        let stage: StageDescriptor = serde_json::from_str(
            r#"{"name":"MTS","location":"zip:///arch/mts.zip!/","granularity":"day","hold":5,"gather":3}"#,
        )
        .unwrap();
        assert_eq!(stage.granularity, PartitionGranularity::Day);
        assert_eq!(stage.compression, Compression::None);
        assert_eq!((stage.hold, stage.gather), (5, 3));
    }

    #[test]
    fn test_static_pv_config() {
        let source = StaticPvConfig::new();
        source.insert(PvArchiveConfig::new("B", DbrType::ScalarDouble, vec![]));
        source.insert(PvArchiveConfig::new("A", DbrType::ScalarInt, vec![]));
        assert_eq!(source.pv_names(), vec!["A", "B"]);
        assert!(source.pv_config("A").is_some());
        assert!(source.remove("A").is_some());
        assert!(source.pv_config("A").is_none());
    }
}

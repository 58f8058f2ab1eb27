//! Burrow - Alopex Tiered Archive Storage Engine
//!
//! This crate stores high-rate process variable (PV) samples in
//! time-partitioned files and migrates them across storage stages as they age.
//!
//! # Components
//!
//! - [`storage`]: partition file format, time-seek search, zip containers and storage stages
//! - [`engine`]: per-channel sample buffers, the writer scheduler and the admin facade
//! - [`lifecycle`]: partition layout, gating intervals, conversions and the ETL pipeline
//! - [`config`]: engine and per-PV stage configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_burrow::config::{EngineConfig, PvArchiveConfig, StageDescriptor, StaticPvConfig};
//! use alopex_burrow::lifecycle::PartitionGranularity;
//! use alopex_burrow::storage::DbrType;
//! use alopex_burrow::ArchiveEngine;
//!
//! let configs = Arc::new(StaticPvConfig::new());
//! configs.insert(PvArchiveConfig::new(
//!     "ABC:DEF",
//!     DbrType::ScalarDouble,
//!     vec![
//!         StageDescriptor::new("STS", "/arch/sts", PartitionGranularity::Hour),
//!         StageDescriptor::new("LTS", "zip:///arch/lts.zip!/", PartitionGranularity::Year),
//!     ],
//! ));
//!
//! let engine = ArchiveEngine::new(EngineConfig::default(), configs);
//! let channel = engine.start_archiving("ABC:DEF")?;
//! engine.start();
//!
//! // Feed samples from a PV source.
//! let (tx, rx) = tokio::sync::mpsc::channel(1024);
//! alopex_burrow::engine::ingest(channel, rx);
//! tx.send(ChannelEvent::Sample(sample)).await?;
//!
//! engine.shutdown().await?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod storage;

pub use config::{EngineConfig, PvArchiveConfig, PvConfigSource, StageDescriptor};
pub use engine::{ActionResult, ActionStatus, AdminAction, ArchiveEngine, ChannelEvent};
pub use error::{ArchiveError, Result};
pub use lifecycle::{GatingState, PartitionGranularity};
pub use storage::{DbrType, Sample, SampleValue, StorageStage, TimeRange, Timestamp};

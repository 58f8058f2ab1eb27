//! Lifecycle of stored data: partition layout, gating, conversion and ETL.

pub mod conversion;
pub mod etl;
pub mod executor;
pub mod gating;
pub mod partition;

pub use conversion::{ConversionFunction, ScalarConversion};
pub use etl::{EtlJob, EtlMetrics, EtlMetricsSnapshot, PassSummary};
pub use executor::EtlExecutor;
pub use gating::GatingState;
pub use partition::{
    Compression, PartitionFileInfo, PartitionGranularity, PartitionLayout, PartitionPath,
    StorageRoot,
};

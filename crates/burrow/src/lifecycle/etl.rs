//! ETL jobs: migration of aged partitions along a PV's storage chain.

use crate::config::{DeletionPolicy, EtlConfig, PvArchiveConfig, StageDescriptor};
use crate::error::{ArchiveError, Result};
use crate::lifecycle::conversion::{ConversionFunction, ScalarConversion};
use crate::lifecycle::gating::GatingState;
use crate::storage::{
    ContainerCache, PartitionInfo, Sample, SampleIter, StorageStage, Timestamp,
};
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Counters of one ETL job.
#[derive(Debug, Default)]
pub struct EtlMetrics {
    /// Completed passes.
    pub passes: AtomicU64,
    /// Partitions migrated and removed from their source.
    pub partitions_moved: AtomicU64,
    /// Eligible partitions held back by a gating interval.
    pub partitions_gated: AtomicU64,
    /// Partitions whose migration failed.
    pub partitions_failed: AtomicU64,
    /// Events appended to destinations.
    pub events_moved: AtomicU64,
    /// Events skipped because the destination already held them.
    pub events_skipped: AtomicU64,
    /// Cumulative time spent appending to destinations.
    pub append_nanos: AtomicU64,
    /// Cumulative time spent deleting sources.
    pub delete_nanos: AtomicU64,
    /// Processing time of the last pass.
    pub last_pass: AtomicI64,
}

/// Point-in-time copy of [`EtlMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct EtlMetricsSnapshot {
    pub passes: u64,
    pub partitions_moved: u64,
    pub partitions_gated: u64,
    pub partitions_failed: u64,
    pub events_moved: u64,
    pub events_skipped: u64,
    pub append_nanos: u64,
    pub delete_nanos: u64,
    pub last_pass: Timestamp,
}

impl EtlMetrics {
    /// Returns a copy of every counter.
    pub fn snapshot(&self) -> EtlMetricsSnapshot {
        EtlMetricsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            partitions_moved: self.partitions_moved.load(Ordering::Relaxed),
            partitions_gated: self.partitions_gated.load(Ordering::Relaxed),
            partitions_failed: self.partitions_failed.load(Ordering::Relaxed),
            events_moved: self.events_moved.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            append_nanos: self.append_nanos.load(Ordering::Relaxed),
            delete_nanos: self.delete_nanos.load(Ordering::Relaxed),
            last_pass: self.last_pass.load(Ordering::Relaxed),
        }
    }

    fn record(&self, summary: &PassSummary) {
        self.partitions_moved
            .fetch_add(summary.partitions_moved as u64, Ordering::Relaxed);
        self.partitions_gated
            .fetch_add(summary.partitions_gated as u64, Ordering::Relaxed);
        self.partitions_failed
            .fetch_add(summary.partitions_failed as u64, Ordering::Relaxed);
        self.events_moved
            .fetch_add(summary.events_moved as u64, Ordering::Relaxed);
    }

    fn add_elapsed(counter: &AtomicU64, started: Instant) {
        counter.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Outcome of one migration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Partitions migrated.
    pub partitions_moved: usize,
    /// Partitions held back by gating.
    pub partitions_gated: usize,
    /// Partitions whose migration failed and stayed at the source.
    pub partitions_failed: usize,
    /// Events appended.
    pub events_moved: usize,
    /// True if the pass stopped early on cancellation.
    pub cancelled: bool,
}

impl AddAssign for PassSummary {
    fn add_assign(&mut self, other: Self) {
        self.partitions_moved += other.partitions_moved;
        self.partitions_gated += other.partitions_gated;
        self.partitions_failed += other.partitions_failed;
        self.events_moved += other.events_moved;
        self.cancelled |= other.cancelled;
    }
}

/// Runtime binding of one PV to its storage chain.
pub struct EtlJob {
    pv: String,
    stages: Vec<StorageStage>,
    gating: Arc<GatingState>,
    config: EtlConfig,
    cancelled: AtomicBool,
    metrics: EtlMetrics,
    pass_lock: Mutex<()>,
}

impl std::fmt::Debug for EtlJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlJob")
            .field("pv", &self.pv)
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl EtlJob {
    /// Creates the job for a PV from its configuration.
    pub fn new(
        pv_config: &PvArchiveConfig,
        containers: Arc<ContainerCache>,
        gating: Arc<GatingState>,
        config: EtlConfig,
    ) -> Result<Self> {
        let stages = pv_config
            .stages
            .iter()
            .map(|descriptor| StorageStage::new(descriptor.clone(), Arc::clone(&containers)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pv: pv_config.pv.clone(),
            stages,
            gating,
            config,
            cancelled: AtomicBool::new(false),
            metrics: EtlMetrics::default(),
            pass_lock: Mutex::new(()),
        })
    }

    /// Returns the PV name.
    pub fn pv(&self) -> &str {
        &self.pv
    }

    /// Returns the stages in order, fastest first.
    pub fn stages(&self) -> &[StorageStage] {
        &self.stages
    }

    /// Returns the job's counters.
    pub fn metrics(&self) -> &EtlMetrics {
        &self.metrics
    }

    /// Asks a running pass to stop before its next partition.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`EtlJob::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Blocks until the pass in flight, if any, has finished.
    ///
    /// After [`EtlJob::cancel`] this guarantees the job no longer touches
    /// its stages: passes started later return without migrating.
    pub fn wait_idle(&self) {
        drop(self.pass_lock.lock().unwrap_or_else(|err| err.into_inner()));
    }

    #[cfg(test)]
    pub(crate) fn lock_pass(&self) -> std::sync::MutexGuard<'_, ()> {
        self.pass_lock.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Runs one migration pass over every adjacent stage pair as of `now`.
    ///
    /// Each source stage is processed as of `now` minus its padding, so
    /// partitions that just closed get a grace period for late flushes.
    pub fn run_pass_at(&self, now: Timestamp) -> Result<PassSummary> {
        let _guard = self.pass_lock.lock().unwrap_or_else(|err| err.into_inner());
        let mut summary = PassSummary::default();
        if self.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }
        for src in 0..self.stages.len().saturating_sub(1) {
            let padding = (self.stages[src].granularity().approx_nanos() as f64
                * self.config.padding_fraction) as i64;
            summary += self.migrate_pair(src, now.saturating_sub(padding))?;
            if summary.cancelled {
                break;
            }
        }
        self.metrics.passes.fetch_add(1, Ordering::Relaxed);
        self.metrics.last_pass.store(now, Ordering::Relaxed);
        Ok(summary)
    }

    /// Migrates every partition older than `cutoff` up to the stage `stage_name`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the PV has no stage of that name.
    pub fn consolidate_before(&self, stage_name: &str, cutoff: Timestamp) -> Result<PassSummary> {
        let target = self
            .stages
            .iter()
            .position(|stage| stage.name() == stage_name)
            .ok_or_else(|| {
                ArchiveError::NotFound(format!("stage {} for PV {}", stage_name, self.pv))
            })?;
        let _guard = self.pass_lock.lock().unwrap_or_else(|err| err.into_inner());
        let mut summary = PassSummary::default();
        for src in 0..target {
            summary += self.migrate_pair(src, cutoff)?;
            if summary.cancelled {
                break;
            }
        }
        info!(
            pv = %self.pv,
            stage = %stage_name,
            cutoff,
            moved = summary.partitions_moved,
            "consolidated partitions"
        );
        Ok(summary)
    }

    fn migrate_pair(&self, src: usize, processing_time: Timestamp) -> Result<PassSummary> {
        let source = &self.stages[src];
        let dest = &self.stages[src + 1];
        let candidates = source.etl_candidates(&self.pv, processing_time)?;
        let mut summary = PassSummary::default();
        if candidates.is_empty() {
            return Ok(summary);
        }
        debug!(
            pv = %self.pv,
            source = %source.name(),
            dest = %dest.name(),
            candidates = candidates.len(),
            "migrating partitions"
        );

        let scopes = [self.pv.as_str(), source.name()];
        for info in candidates {
            if self.is_cancelled() {
                info!(pv = %self.pv, stage = %source.name(), "ETL pass cancelled");
                summary.cancelled = true;
                break;
            }
            if let Some(interval) = self.gating.should_keep(&scopes, info.window) {
                debug!(
                    pv = %self.pv,
                    stage = %source.name(),
                    window = ?info.window,
                    ?interval,
                    "partition gated"
                );
                summary.partitions_gated += 1;
                continue;
            }
            match migrate_partition(
                &self.pv,
                source,
                dest,
                &info,
                self.config.deletion_policy,
                &self.metrics,
            ) {
                Ok(events) => {
                    summary.partitions_moved += 1;
                    summary.events_moved += events;
                }
                Err(err) => {
                    error!(
                        pv = %self.pv,
                        source = %source.name(),
                        dest = %dest.name(),
                        window = ?info.window,
                        error = %err,
                        "partition migration failed"
                    );
                    summary.partitions_failed += 1;
                }
            }
        }
        self.metrics.record(&summary);
        Ok(summary)
    }
}

/// Largest number of events held in memory while a partition is copied.
pub const MIGRATION_CHUNK: usize = 8_192;

/// Outcome of copying one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    /// Events appended to the destination.
    pub appended: usize,
    /// Events the destination already held.
    pub skipped: usize,
}

/// Streams one partition into `dest`, then deletes it from `source`.
///
/// The source is only touched after the destination append succeeded.
/// Returns the number of events appended.
pub fn migrate_partition(
    pv: &str,
    source: &StorageStage,
    dest: &StorageStage,
    info: &PartitionInfo,
    policy: DeletionPolicy,
    metrics: &EtlMetrics,
) -> Result<usize> {
    let started = Instant::now();
    let copied = copy_partition(pv, source, dest, info, MIGRATION_CHUNK)?;
    EtlMetrics::add_elapsed(&metrics.append_nanos, started);
    if copied.skipped > 0 {
        warn!(
            pv = %pv,
            dest = %dest.name(),
            window = ?info.window,
            skipped = copied.skipped,
            "destination already held events, skipped them"
        );
        metrics
            .events_skipped
            .fetch_add(copied.skipped as u64, Ordering::Relaxed);
    }

    let started = Instant::now();
    if !source.mark_for_deletion(info, policy)? {
        warn!(pv = %pv, partition = %info.path, "source partition kept after migration");
    }
    EtlMetrics::add_elapsed(&metrics.delete_nanos, started);
    Ok(copied.appended)
}

/// Appends a partition's events to `dest`, at most `chunk` events at a time.
///
/// Events at or before the last event of their destination partition are
/// skipped, so a copy interrupted between chunks can simply be repeated.
/// The source is left untouched.
pub fn copy_partition(
    pv: &str,
    source: &StorageStage,
    dest: &StorageStage,
    info: &PartitionInfo,
    chunk: usize,
) -> Result<CopySummary> {
    let mut events = read_converted(source, dest.descriptor(), info)?;
    let chunk = chunk.max(1);
    let mut summary = CopySummary::default();
    loop {
        let batch = events
            .by_ref()
            .take(chunk)
            .collect::<Result<Vec<Sample>>>()?;
        if batch.is_empty() {
            break;
        }
        let (batch, skipped) = dest.skip_existing(pv, batch)?;
        summary.skipped += skipped;
        summary.appended += dest.append(pv, &batch)?.samples;
    }
    Ok(summary)
}

/// Opens a partition as a lazy stream converted to the destination's declared type.
pub fn read_converted(
    source: &StorageStage,
    dest: &StageDescriptor,
    info: &PartitionInfo,
) -> Result<SampleIter<'static>> {
    let (header, events) = source.read(&info.path)?;
    match dest.dbr_type {
        Some(target) => {
            let conversion = ScalarConversion::new(target);
            if conversion.should_convert(header.dbr_type, info.window) {
                conversion.convert(header.dbr_type, events, info.window)
            } else {
                Ok(events)
            }
        }
        None => Ok(events),
    }
}

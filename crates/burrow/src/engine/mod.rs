//! The archive engine: live ingestion, flushing, ETL and administration.
//!
//! [`ArchiveEngine`] ties the pieces together:
//!
//! - one [`ArchiveChannel`] per archived PV, registered with the
//!   [`WriterScheduler`] that flushes buffers into the PV's fastest stage
//! - one [`EtlJob`] per unpaused PV, driven by the [`EtlExecutor`]
//! - the shared [`GatingState`] and [`ContainerCache`]
//!
//! Administrative actions return an [`ActionResult`] instead of an error so a
//! front end can relay them verbatim. Actions that move a PV's data require
//! the PV to be paused first.

pub mod buffer;
pub mod channel;
pub mod writer;

pub use buffer::{BufferStats, SampleBuffer, YearListener};
pub use channel::{ingest, ArchiveChannel, ChannelEvent};
pub use writer::{FlushSummary, WriterScheduler, WriterStats};

use crate::config::{EngineConfig, PvArchiveConfig, PvConfigSource, StageDescriptor};
use crate::error::{ArchiveError, Result};
use crate::lifecycle::etl::{copy_partition, EtlJob, PassSummary, MIGRATION_CHUNK};
use crate::lifecycle::executor::EtlExecutor;
use crate::lifecycle::gating::GatingState;
use crate::storage::{ContainerCache, StorageStage, TimeRange, Timestamp, NANOS_PER_MILLI};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outcome status of an administrative action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// The action was fully applied.
    Ok,
    /// The action failed or was only partly applied.
    Failed,
}

/// Structured result of an administrative action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Outcome.
    pub status: ActionStatus,
    /// Human-readable summary.
    pub description: String,
    /// Action-specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ActionResult {
    /// A successful result.
    pub fn ok(description: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Ok,
            description: description.into(),
            details: None,
        }
    }

    /// A failed result.
    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failed,
            description: description.into(),
            details: None,
        }
    }

    /// Attaches details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Returns true for [`ActionStatus::Ok`].
    pub fn is_ok(&self) -> bool {
        self.status == ActionStatus::Ok
    }
}

impl From<Result<ActionResult>> for ActionResult {
    fn from(result: Result<ActionResult>) -> Self {
        result.unwrap_or_else(|err| Self::failed(err.to_string()))
    }
}

/// An administrative request, as relayed by a front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum AdminAction {
    PauseArchiving {
        pv: String,
    },
    ResumeArchiving {
        pv: String,
    },
    DeletePv {
        pv: String,
        delete_data: bool,
    },
    ChangeStore {
        pv: String,
        source_stage: String,
        destination: StageDescriptor,
    },
    ConsolidateBeforeStage {
        pv: String,
        stage: String,
        cutoff_millis: i64,
    },
    AddGatingInterval {
        scope: String,
        start_millis: i64,
        end_millis: i64,
    },
    RemoveGatingInterval {
        scope: String,
        start_millis: i64,
        end_millis: i64,
    },
    GetLastKnownEventTimestamp {
        pv: String,
    },
}

/// The storage and ETL engine.
pub struct ArchiveEngine {
    config: EngineConfig,
    pv_configs: Arc<dyn PvConfigSource>,
    containers: Arc<ContainerCache>,
    writer: Arc<WriterScheduler>,
    etl: Arc<EtlExecutor>,
    gating: Arc<GatingState>,
    paused: RwLock<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ArchiveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveEngine")
            .field("config", &self.config)
            .field("channels", &self.writer.channels().len())
            .field("jobs", &self.etl.len())
            .finish()
    }
}

impl ArchiveEngine {
    /// Creates an engine reading PV stage lists from `pv_configs`.
    pub fn new(config: EngineConfig, pv_configs: Arc<dyn PvConfigSource>) -> Arc<Self> {
        Arc::new(Self {
            writer: WriterScheduler::new(config.writer.clone()),
            etl: Arc::new(EtlExecutor::new()),
            gating: Arc::new(GatingState::new(config.etl.max_gating_intervals)),
            containers: Arc::new(ContainerCache::new()),
            pv_configs,
            config,
            paused: RwLock::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Returns the writer scheduler.
    pub fn writer(&self) -> &Arc<WriterScheduler> {
        &self.writer
    }

    /// Returns the ETL executor.
    pub fn etl(&self) -> &Arc<EtlExecutor> {
        &self.etl
    }

    /// Returns the gating state.
    pub fn gating(&self) -> &Arc<GatingState> {
        &self.gating
    }

    /// Returns the shared container cache.
    pub fn containers(&self) -> &Arc<ContainerCache> {
        &self.containers
    }

    /// Starts archiving `pv`: creates its channel and, unless paused, its ETL job.
    ///
    /// Returns the channel the PV source feeds, for example through [`ingest`].
    pub fn start_archiving(&self, pv: &str) -> Result<Arc<ArchiveChannel>> {
        let pv_config = self.pv_config(pv)?;
        let first = pv_config.stages.first().ok_or_else(|| {
            ArchiveError::Config(format!("PV {} has no storage stages", pv))
        })?;
        let stage = StorageStage::new(first.clone(), Arc::clone(&self.containers))?;
        let channel = Arc::new(ArchiveChannel::new(
            pv,
            pv_config.dbr_type,
            stage,
            self.config.writer.buffer_capacity,
        ));
        if self.is_paused(pv) {
            channel.set_paused(true);
        } else {
            self.etl.add_job(self.build_job(&pv_config)?);
        }
        self.writer.register(Arc::clone(&channel));
        info!(pv = %pv, stages = pv_config.stages.len(), "archiving started");
        Ok(channel)
    }

    /// Returns true if archiving of `pv` is paused.
    pub fn is_paused(&self, pv: &str) -> bool {
        self.paused
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .contains(pv)
    }

    /// Pauses archiving: flushes the PV's buffer, stops accumulation and
    /// removes its ETL job. Pausing a paused PV succeeds.
    ///
    /// Returns once a pass already migrating the PV's partitions has ended,
    /// so no ETL activity overlaps actions that require the pause.
    pub fn pause_archiving(&self, pv: &str) -> ActionResult {
        if let Err(err) = self.pv_config(pv) {
            return ActionResult::failed(err.to_string());
        }
        if let Some(channel) = self.writer.channel(pv) {
            channel.set_paused(true);
            if let Err(err) = self.writer.flush_channel(&channel) {
                warn!(pv = %pv, error = %err, "flush on pause failed");
            }
        }
        self.paused
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(pv.to_string());
        if let Some(job) = self.etl.remove_job(pv) {
            job.wait_idle();
        }
        info!(pv = %pv, "archiving paused");
        ActionResult::ok(format!("paused {}", pv))
    }

    /// Resumes archiving and recreates the PV's ETL job.
    pub fn resume_archiving(&self, pv: &str) -> ActionResult {
        let result = (|| -> Result<ActionResult> {
            let pv_config = self.pv_config(pv)?;
            let job = self.build_job(&pv_config)?;
            self.paused
                .write()
                .unwrap_or_else(|err| err.into_inner())
                .remove(pv);
            if let Some(channel) = self.writer.channel(pv) {
                channel.set_paused(false);
            }
            self.etl.add_job(job);
            info!(pv = %pv, "archiving resumed");
            Ok(ActionResult::ok(format!("resumed {}", pv)))
        })();
        result.into()
    }

    /// Removes a PV from the engine, optionally marking all of its data for deletion.
    ///
    /// Stages are processed independently; a failing stage is reported in
    /// the details and does not stop the others.
    pub fn delete_pv(&self, pv: &str, delete_data: bool) -> ActionResult {
        let pv_config = match self.pv_config(pv) {
            Ok(pv_config) => pv_config,
            Err(err) => return ActionResult::failed(err.to_string()),
        };
        if let Some(job) = self.etl.remove_job(pv) {
            job.wait_idle();
        }
        if let Some(channel) = self.writer.deregister(pv) {
            channel.set_paused(true);
            if !delete_data {
                if let Err(err) = self.writer.flush_channel(&channel) {
                    warn!(pv = %pv, error = %err, "final flush of deleted PV failed");
                }
            }
        }
        self.paused
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(pv);
        self.gating.clear_scope(pv);

        if !delete_data {
            info!(pv = %pv, "PV removed, data kept");
            return ActionResult::ok(format!("removed {}", pv));
        }

        let policy = self.config.etl.deletion_policy;
        let mut stages = Vec::with_capacity(pv_config.stages.len());
        let mut failures = 0;
        for descriptor in &pv_config.stages {
            let outcome = StorageStage::new(descriptor.clone(), Arc::clone(&self.containers))
                .and_then(|stage| {
                    let mut marked = 0;
                    for info in stage.partitions(pv)? {
                        if stage.mark_for_deletion(&info, policy)? {
                            marked += 1;
                        }
                    }
                    Ok(marked)
                });
            match outcome {
                Ok(marked) => {
                    info!(
                        pv = %pv,
                        stage = %descriptor.name,
                        marked,
                        "stage data marked for deletion"
                    );
                    stages.push(json!({
                        "stage": descriptor.name,
                        "status": "ok",
                        "marked": marked,
                    }));
                }
                Err(err) => {
                    error!(
                        pv = %pv,
                        stage = %descriptor.name,
                        error = %err,
                        "deleting stage data failed"
                    );
                    failures += 1;
                    stages.push(json!({
                        "stage": descriptor.name,
                        "status": "failed",
                        "error": err.to_string(),
                    }));
                }
            }
        }

        let details = json!({ "pv": pv, "policy": policy, "stages": stages });
        if failures == 0 {
            ActionResult::ok(format!("deleted {}", pv)).with_details(details)
        } else {
            ActionResult::failed(format!("deleted {} with {} failed stages", pv, failures))
                .with_details(details)
        }
    }

    /// Moves all of a PV's data from `source_stage` into `destination`.
    ///
    /// Requires the PV to be paused. Every partition is copied before any
    /// source partition is deleted, so a failed copy leaves the source intact.
    /// Source partitions that could not be deleted afterwards are listed in
    /// the details and make the result `failed`; the destination then holds
    /// every event and repeating the action only deletes what is left.
    pub fn change_store(
        &self,
        pv: &str,
        source_stage: &str,
        destination: StageDescriptor,
    ) -> ActionResult {
        if !self.is_paused(pv) {
            return ActionResult::failed(
                ArchiveError::PreconditionFailed(format!(
                    "PV {} must be paused before changing its store",
                    pv
                ))
                .to_string(),
            );
        }
        let result = (|| -> Result<ActionResult> {
            let pv_config = self.pv_config(pv)?;
            let index = pv_config.stage_index(source_stage).ok_or_else(|| {
                ArchiveError::NotFound(format!("stage {} for PV {}", source_stage, pv))
            })?;
            let source = StorageStage::new(
                pv_config.stages[index].clone(),
                Arc::clone(&self.containers),
            )?;
            let dest = StorageStage::new(destination, Arc::clone(&self.containers))?;
            let partitions = source.partitions(pv)?;

            let mut events = 0;
            for info in &partitions {
                events += copy_partition(pv, &source, &dest, info, MIGRATION_CHUNK)?.appended;
            }

            // Every partition is attempted so one refusal does not strand the rest.
            let policy = self.config.etl.deletion_policy;
            let mut kept = Vec::new();
            let mut errors = Vec::new();
            for info in &partitions {
                match source.mark_for_deletion(info, policy) {
                    Ok(true) => {}
                    Ok(false) => kept.push(info.path.to_string()),
                    Err(err) => {
                        error!(
                            pv = %pv,
                            partition = %info.path,
                            error = %err,
                            "source partition not deleted after store change"
                        );
                        errors.push(format!("{}: {}", info.path, err));
                    }
                }
            }
            info!(
                pv = %pv,
                source = %source.name(),
                dest = %dest.name(),
                partitions = partitions.len(),
                events,
                kept = kept.len(),
                errors = errors.len(),
                "store changed"
            );
            let details = json!({
                "partitions": partitions.len(),
                "events": events,
                "source_partitions_kept": kept,
                "deletion_errors": errors,
            });
            if !kept.is_empty() || !errors.is_empty() {
                return Ok(ActionResult::failed(format!(
                    "copied {} from {} to {}, but {} source partitions were not deleted",
                    pv,
                    source.name(),
                    dest.name(),
                    kept.len() + errors.len()
                ))
                .with_details(details));
            }
            Ok(ActionResult::ok(format!(
                "moved {} from {} to {}",
                pv,
                source.name(),
                dest.name()
            ))
            .with_details(details))
        })();
        result.into()
    }

    /// Migrates partitions older than `cutoff` up to the stage `stage`.
    ///
    /// Requires the PV to be paused, like every action moving its data.
    pub fn consolidate_before_stage(
        &self,
        pv: &str,
        stage: &str,
        cutoff: Timestamp,
    ) -> ActionResult {
        if !self.is_paused(pv) {
            return ActionResult::failed(
                ArchiveError::PreconditionFailed(format!(
                    "PV {} must be paused before consolidating",
                    pv
                ))
                .to_string(),
            );
        }
        let result = (|| -> Result<ActionResult> {
            let job = self.build_job(&self.pv_config(pv)?)?;
            let summary = job.consolidate_before(stage, cutoff)?;
            let details = serde_json::to_value(summary).unwrap_or_default();
            if summary.partitions_failed > 0 {
                return Ok(ActionResult::failed(format!(
                    "{} partitions of {} failed to consolidate",
                    summary.partitions_failed, pv
                ))
                .with_details(details));
            }
            Ok(ActionResult::ok(format!("consolidated {} before {}", pv, stage))
                .with_details(details))
        })();
        result.into()
    }

    /// Protects `[start_millis, end_millis)` in `scope` from migration.
    pub fn add_gating_interval(
        &self,
        scope: &str,
        start_millis: i64,
        end_millis: i64,
    ) -> ActionResult {
        let range = millis_range(start_millis, end_millis);
        if self.gating.keep_interval(scope, range) {
            ActionResult::ok(format!("gating {}", scope))
                .with_details(json!({ "intervals": self.gating.intervals(scope) }))
        } else {
            ActionResult::failed(format!(
                "empty gating interval [{}, {}) for {}",
                start_millis, end_millis, scope
            ))
        }
    }

    /// Releases `[start_millis, end_millis)` from `scope`.
    pub fn remove_gating_interval(
        &self,
        scope: &str,
        start_millis: i64,
        end_millis: i64,
    ) -> ActionResult {
        self.gating
            .remove_interval(scope, millis_range(start_millis, end_millis));
        ActionResult::ok(format!("released gating in {}", scope))
            .with_details(json!({ "intervals": self.gating.intervals(scope) }))
    }

    /// Returns the newest known event time of `pv`, buffered or stored.
    pub fn last_known_event_timestamp(&self, pv: &str) -> Result<Option<Timestamp>> {
        if let Some(ts) = self
            .writer
            .channel(pv)
            .and_then(|channel| channel.buffer().last_timestamp())
        {
            return Ok(Some(ts));
        }
        let pv_config = self.pv_config(pv)?;
        for descriptor in pv_config.stages {
            let stage = StorageStage::new(descriptor, Arc::clone(&self.containers))?;
            if let Some(ts) = stage.last_known_timestamp(pv)? {
                return Ok(Some(ts));
            }
        }
        Ok(None)
    }

    /// Administrative form of [`ArchiveEngine::last_known_event_timestamp`].
    pub fn get_last_known_event_timestamp(&self, pv: &str) -> ActionResult {
        match self.last_known_event_timestamp(pv) {
            Ok(Some(ts)) => {
                ActionResult::ok(format!("last event of {}", pv)).with_details(json!({
                    "timestamp_nanos": ts,
                    "timestamp_millis": ts.div_euclid(NANOS_PER_MILLI),
                }))
            }
            Ok(None) => ActionResult::ok(format!("no events for {}", pv)),
            Err(err) => ActionResult::failed(err.to_string()),
        }
    }

    /// Runs one administrative action.
    pub fn execute(&self, action: AdminAction) -> ActionResult {
        match action {
            AdminAction::PauseArchiving { pv } => self.pause_archiving(&pv),
            AdminAction::ResumeArchiving { pv } => self.resume_archiving(&pv),
            AdminAction::DeletePv { pv, delete_data } => self.delete_pv(&pv, delete_data),
            AdminAction::ChangeStore {
                pv,
                source_stage,
                destination,
            } => self.change_store(&pv, &source_stage, destination),
            AdminAction::ConsolidateBeforeStage {
                pv,
                stage,
                cutoff_millis,
            } => self.consolidate_before_stage(
                &pv,
                &stage,
                cutoff_millis.saturating_mul(NANOS_PER_MILLI),
            ),
            AdminAction::AddGatingInterval {
                scope,
                start_millis,
                end_millis,
            } => self.add_gating_interval(&scope, start_millis, end_millis),
            AdminAction::RemoveGatingInterval {
                scope,
                start_millis,
                end_millis,
            } => self.remove_gating_interval(&scope, start_millis, end_millis),
            AdminAction::GetLastKnownEventTimestamp { pv } => {
                self.get_last_known_event_timestamp(&pv)
            }
        }
    }

    /// Runs an administrative action on a blocking worker.
    pub async fn execute_async(self: &Arc<Self>, action: AdminAction) -> ActionResult {
        let engine = Arc::clone(self);
        match tokio::task::spawn_blocking(move || engine.execute(action)).await {
            Ok(result) => result,
            Err(err) => ActionResult::failed(ArchiveError::from(err).to_string()),
        }
    }

    /// Flushes every channel now.
    pub fn flush(&self) -> FlushSummary {
        self.writer.flush_all()
    }

    /// Runs one ETL pass over every job as of `now`.
    pub fn run_etl_pass(&self, now: Timestamp) -> PassSummary {
        self.etl.run_pass(now)
    }

    /// Starts the flush and ETL loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|err| err.into_inner());
        tasks.push(Arc::clone(&self.writer).start());
        tasks.push(Arc::clone(&self.etl).start(self.config.etl.pass_period()));
        info!(
            flush_period = ?self.config.writer.flush_period(),
            pass_period = ?self.config.etl.pass_period(),
            "archive engine started"
        );
    }

    /// Stops the loops, flushes remaining samples and releases containers.
    pub async fn shutdown(&self) -> Result<FlushSummary> {
        self.etl.shutdown();
        let summary = Arc::clone(&self.writer).shutdown().await?;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.await?;
        }
        let released = self.containers.release_all();
        info!(samples = summary.samples, released, "archive engine stopped");
        Ok(summary)
    }

    fn pv_config(&self, pv: &str) -> Result<PvArchiveConfig> {
        self.pv_configs
            .pv_config(pv)
            .ok_or_else(|| ArchiveError::NotFound(format!("PV {}", pv)))
    }

    fn build_job(&self, pv_config: &PvArchiveConfig) -> Result<EtlJob> {
        EtlJob::new(
            pv_config,
            Arc::clone(&self.containers),
            Arc::clone(&self.gating),
            self.config.etl.clone(),
        )
    }
}

fn millis_range(start_millis: i64, end_millis: i64) -> TimeRange {
    TimeRange::new(
        start_millis.saturating_mul(NANOS_PER_MILLI),
        end_millis.saturating_mul(NANOS_PER_MILLI),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticPvConfig;
    use crate::lifecycle::partition::PartitionGranularity;
    use crate::storage::DbrType;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_action_result_serializes() {
        let ok = serde_json::to_value(ActionResult::ok("done")).unwrap();
        assert_eq!(ok, json!({"status": "ok", "description": "done"}));
        let failed = ActionResult::failed("nope").with_details(json!({"n": 1}));
        assert_eq!(
            serde_json::to_value(failed).unwrap(),
            json!({"status": "failed", "description": "nope", "details": {"n": 1}})
        );
    }

    #[test]
    fn test_admin_action_deserializes() {
        let action: AdminAction = serde_json::from_value(json!({
            "action": "add_gating_interval",
            "scope": "STS",
            "start_millis": 0,
            "end_millis": 1000,
        }))
        .unwrap();
        assert_eq!(
            action,
            AdminAction::AddGatingInterval {
                scope: "STS".to_string(),
                start_millis: 0,
                end_millis: 1000
            }
        );
    }

    #[test]
    fn test_unknown_pv_actions_fail() {
        let engine =
            ArchiveEngine::new(EngineConfig::default(), Arc::new(StaticPvConfig::new()));
        assert!(!engine.pause_archiving("NOPE").is_ok());
        assert!(!engine.resume_archiving("NOPE").is_ok());
        assert!(!engine.delete_pv("NOPE", true).is_ok());
        assert!(matches!(
            engine.start_archiving("NOPE"),
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn test_pause_waits_for_running_pass() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let configs = Arc::new(StaticPvConfig::new());
        configs.insert(PvArchiveConfig::new(
            "P",
            DbrType::ScalarDouble,
            vec![
                StageDescriptor::new(
                    "STS",
                    temp_dir.path().join("sts").display().to_string(),
                    PartitionGranularity::Day,
                ),
                StageDescriptor::new(
                    "LTS",
                    temp_dir.path().join("lts").display().to_string(),
                    PartitionGranularity::Year,
                ),
            ],
        ));
        let engine = ArchiveEngine::new(EngineConfig::default(), configs);
        engine.start_archiving("P").unwrap();
        let job = engine.etl().job("P").unwrap();

        let paused = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let pass = job.lock_pass();
            let pausing = scope.spawn(|| {
                let result = engine.pause_archiving("P");
                paused.store(true, Ordering::SeqCst);
                result
            });
            std::thread::sleep(Duration::from_millis(100));
            assert!(!paused.load(Ordering::SeqCst));
            drop(pass);
            assert!(pausing.join().unwrap().is_ok());
        });
        assert!(paused.load(Ordering::SeqCst));
        assert!(job.is_cancelled());
        assert!(!engine.etl().contains("P"));
        assert!(engine.is_paused("P"));
    }

    #[test]
    fn test_gating_actions() {
        let configs = Arc::new(StaticPvConfig::new());
        configs.insert(PvArchiveConfig::new(
            "G",
            DbrType::ScalarDouble,
            vec![StageDescriptor::new("STS", "/tmp/unused", PartitionGranularity::Day)],
        ));
        let engine = ArchiveEngine::new(EngineConfig::default(), configs);
        assert!(engine.add_gating_interval("G", 0, 1_000).is_ok());
        assert!(!engine.add_gating_interval("G", 5, 5).is_ok());
        assert_eq!(engine.gating().intervals("G").len(), 1);
        assert!(engine.remove_gating_interval("G", 0, 1_000).is_ok());
        assert!(engine.gating().intervals("G").is_empty());
    }
}

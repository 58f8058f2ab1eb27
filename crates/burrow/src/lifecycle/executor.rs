//! Registry and scheduler of ETL jobs.
//!
//! The executor owns one [`EtlJob`] per archived PV. A background loop runs a
//! pass over every job each period; the pass itself runs on a blocking worker
//! so slow storage never stalls the async runtime that accepts live samples.

use crate::lifecycle::etl::{EtlJob, PassSummary};
use crate::storage::{current_timestamp_nanos, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, error, info, trace};

/// Registry of ETL jobs, keyed by PV name.
#[derive(Debug, Default)]
pub struct EtlExecutor {
    jobs: RwLock<HashMap<String, Arc<EtlJob>>>,
    shutdown: Notify,
    stopped: AtomicBool,
}

impl EtlExecutor {
    /// Creates an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job, replacing and cancelling any previous job for its PV.
    pub fn add_job(&self, job: EtlJob) -> Arc<EtlJob> {
        let job = Arc::new(job);
        let previous = self
            .jobs
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(job.pv().to_string(), Arc::clone(&job));
        if let Some(previous) = previous {
            previous.cancel();
        }
        debug!(pv = %job.pv(), "ETL job registered");
        job
    }

    /// Removes and cancels the job for `pv`. Removing an absent job is a no-op.
    pub fn remove_job(&self, pv: &str) -> Option<Arc<EtlJob>> {
        let removed = self
            .jobs
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(pv);
        if let Some(job) = &removed {
            job.cancel();
            debug!(pv = %pv, "ETL job removed");
        }
        removed
    }

    /// Returns the job for `pv`.
    pub fn job(&self, pv: &str) -> Option<Arc<EtlJob>> {
        self.jobs
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(pv)
            .cloned()
    }

    /// Returns true if `pv` has a job.
    pub fn contains(&self, pv: &str) -> bool {
        self.job(pv).is_some()
    }

    /// Returns the number of jobs.
    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|err| err.into_inner()).len()
    }

    /// Returns true if no job is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one pass of every job as of `now`.
    ///
    /// A failing PV is logged and does not stop the pass for the others.
    pub fn run_pass(&self, now: Timestamp) -> PassSummary {
        let jobs: Vec<Arc<EtlJob>> = self
            .jobs
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .values()
            .cloned()
            .collect();

        let mut total = PassSummary::default();
        for job in jobs {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match job.run_pass_at(now) {
                Ok(summary) => total += summary,
                Err(err) => error!(pv = %job.pv(), error = %err, "ETL pass failed"),
            }
        }
        if total.partitions_moved > 0 || total.partitions_failed > 0 {
            info!(
                moved = total.partitions_moved,
                gated = total.partitions_gated,
                failed = total.partitions_failed,
                events = total.events_moved,
                "ETL pass complete"
            );
        }
        total
    }

    /// Starts the periodic pass loop.
    ///
    /// The loop ends after [`EtlExecutor::shutdown`]; a pass in progress
    /// stops at its next partition boundary.
    pub fn start(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.shutdown.notified() => break,
                }
                if self.stopped.load(Ordering::SeqCst) {
                    break;
                }
                trace!("ETL pass tick");

                let executor = Arc::clone(&self);
                let pass = tokio::task::spawn_blocking(move || {
                    executor.run_pass(current_timestamp_nanos())
                });
                if let Err(err) = pass.await {
                    error!(error = %err, "ETL pass task failed");
                }
            }
            debug!("ETL loop stopped");
        })
    }

    /// Stops the pass loop and cancels every job.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for job in self
            .jobs
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .values()
        {
            job.cancel();
        }
        self.shutdown.notify_one();
    }
}

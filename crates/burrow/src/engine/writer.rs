//! Writer scheduler: periodic flushes of channel buffers into the fastest stage.
//!
//! Each flush takes a snapshot of a channel's buffer and appends it to the
//! channel's storage stage outside the buffer lock, so ingestion continues
//! while the write is in progress. Flushes of the same channel are
//! serialized by the channel's flush lock; with [`FlushMode::Global`] every
//! flush in the process is serialized as well.
//!
//! A snapshot whose append fails is logged and counted as lost. It is not
//! replayed: the next cycle writes whatever accumulated since.

use crate::config::{FlushMode, WriterConfig};
use crate::engine::buffer::YearListener;
use crate::engine::channel::ArchiveChannel;
use crate::error::Result;
use crate::storage::Sample;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, error, trace};

/// Counters of the writer.
#[derive(Debug, Default)]
pub struct WriterStats {
    /// Successful snapshot appends.
    pub flushes: AtomicU64,
    /// Failed snapshot appends.
    pub failed_flushes: AtomicU64,
    /// Samples written.
    pub samples_written: AtomicU64,
    /// Samples of failed snapshots.
    pub samples_lost: AtomicU64,
    /// Out-of-cycle flushes triggered by year changes.
    pub year_flushes: AtomicU64,
    /// Channels skipped because a flush of theirs was already running.
    pub busy_skips: AtomicU64,
}

/// Outcome of a flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Channels whose snapshot was written.
    pub channels: usize,
    /// Samples written.
    pub samples: usize,
    /// Channels whose append failed.
    pub failures: usize,
    /// Channels skipped because they were busy.
    pub skipped: usize,
}

/// Periodically drains every registered channel into its storage stage.
#[derive(Debug)]
pub struct WriterScheduler {
    channels: RwLock<HashMap<String, Arc<ArchiveChannel>>>,
    config: WriterConfig,
    global_lock: Mutex<()>,
    stats: WriterStats,
    shutdown: Notify,
}

impl WriterScheduler {
    /// Creates a scheduler.
    pub fn new(config: WriterConfig) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            config,
            global_lock: Mutex::new(()),
            stats: WriterStats::default(),
            shutdown: Notify::new(),
        })
    }

    /// Returns the writer's counters.
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Registers a channel and routes its year changes to this writer.
    pub fn register(self: &Arc<Self>, channel: Arc<ArchiveChannel>) {
        channel.buffer().set_year_listener(Arc::new(YearFlush {
            writer: Arc::downgrade(self),
            channel: Arc::downgrade(&channel),
        }));
        debug!(pv = %channel.pv(), stage = %channel.stage().name(), "channel registered");
        self.channels
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(channel.pv().to_string(), channel);
    }

    /// Removes a channel. Buffered samples that were not flushed are discarded.
    pub fn deregister(&self, pv: &str) -> Option<Arc<ArchiveChannel>> {
        self.channels
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(pv)
    }

    /// Returns the channel for `pv`.
    pub fn channel(&self, pv: &str) -> Option<Arc<ArchiveChannel>> {
        self.channels
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(pv)
            .cloned()
    }

    /// Returns every registered channel.
    pub fn channels(&self) -> Vec<Arc<ArchiveChannel>> {
        self.channels
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Flushes every channel with buffered samples.
    ///
    /// Channels already being flushed are skipped until the next cycle.
    pub fn flush_all(&self) -> FlushSummary {
        let mut summary = FlushSummary::default();
        for channel in self.channels() {
            if channel.buffer().is_empty() {
                continue;
            }
            let _global = self.global_guard();
            let Some(_flush) = channel.try_lock_flush() else {
                trace!(pv = %channel.pv(), "flush in progress, skipping channel");
                self.stats.busy_skips.fetch_add(1, Ordering::Relaxed);
                summary.skipped += 1;
                continue;
            };
            let snapshot = channel.buffer().drain();
            match self.write_snapshot(&channel, &snapshot) {
                Ok(written) => {
                    summary.channels += 1;
                    summary.samples += written;
                }
                Err(_) => summary.failures += 1,
            }
        }
        summary
    }

    /// Flushes one channel, waiting for a flush of it in progress.
    pub fn flush_channel(&self, channel: &ArchiveChannel) -> Result<usize> {
        let _global = self.global_guard();
        let _flush = channel.lock_flush();
        let snapshot = channel.buffer().drain();
        self.write_snapshot(channel, &snapshot)
    }

    /// Starts the periodic flush loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.flush_period();
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.shutdown.notified() => break,
                }
                trace!("writer flush tick");

                let writer = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || writer.flush_all()).await {
                    Ok(summary) if summary.failures > 0 => {
                        error!(failures = summary.failures, "flush cycle had failures")
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "flush task failed"),
                }
            }
            debug!("writer loop stopped");
        })
    }

    /// Stops the flush loop and writes whatever is still buffered.
    ///
    /// Unlike a periodic cycle, the final flush waits for busy channels.
    pub async fn shutdown(self: Arc<Self>) -> Result<FlushSummary> {
        self.shutdown.notify_one();
        let writer = Arc::clone(&self);
        Ok(tokio::task::spawn_blocking(move || writer.flush_remaining()).await?)
    }

    fn flush_remaining(&self) -> FlushSummary {
        let mut summary = FlushSummary::default();
        for channel in self.channels() {
            match self.flush_channel(&channel) {
                Ok(0) => {}
                Ok(written) => {
                    summary.channels += 1;
                    summary.samples += written;
                }
                Err(_) => summary.failures += 1,
            }
        }
        summary
    }

    fn write_snapshot(&self, channel: &ArchiveChannel, snapshot: &[Sample]) -> Result<usize> {
        if snapshot.is_empty() {
            return Ok(0);
        }
        match channel.stage().append(channel.pv(), snapshot) {
            Ok(summary) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .samples_written
                    .fetch_add(summary.samples as u64, Ordering::Relaxed);
                trace!(pv = %channel.pv(), samples = summary.samples, "flushed channel");
                Ok(summary.samples)
            }
            Err(err) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .samples_lost
                    .fetch_add(snapshot.len() as u64, Ordering::Relaxed);
                error!(
                    pv = %channel.pv(),
                    stage = %channel.stage().name(),
                    samples = snapshot.len(),
                    error = %err,
                    "flush failed, snapshot dropped"
                );
                Err(err)
            }
        }
    }

    fn global_guard(&self) -> Option<MutexGuard<'_, ()>> {
        match self.config.flush_mode {
            FlushMode::Global => Some(
                self.global_lock
                    .lock()
                    .unwrap_or_else(|err| err.into_inner()),
            ),
            FlushMode::PerChannel => None,
        }
    }
}

/// Flushes a channel's old-year samples when its data crosses a year.
struct YearFlush {
    writer: Weak<WriterScheduler>,
    channel: Weak<ArchiveChannel>,
}

impl YearListener for YearFlush {
    fn year_changed(&self, pv: &str, old_year: i32, snapshot: Vec<Sample>) {
        let (Some(writer), Some(channel)) = (self.writer.upgrade(), self.channel.upgrade()) else {
            debug!(pv = %pv, "year changed on a detached channel");
            return;
        };
        writer.stats.year_flushes.fetch_add(1, Ordering::Relaxed);
        let _global = writer.global_guard();
        let _flush = channel.lock_flush();
        if let Ok(written) = writer.write_snapshot(&channel, &snapshot) {
            debug!(pv = %pv, old_year, written, "flushed samples of previous year");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageDescriptor;
    use crate::lifecycle::partition::PartitionGranularity;
    use crate::storage::{
        ContainerCache, DbrType, SampleValue, StorageStage, NANOS_PER_SECOND,
    };
    use tempfile::TempDir;

    // 2023-12-31T23:59:58Z
    const END_OF_2023: i64 = 1_704_067_198 * NANOS_PER_SECOND;

    fn writer_with_channel(
        dir: &TempDir,
        mode: FlushMode,
    ) -> (Arc<WriterScheduler>, Arc<ArchiveChannel>) {
        let stage = StorageStage::new(
            StageDescriptor::new(
                "STS",
                dir.path().display().to_string(),
                PartitionGranularity::Year,
            ),
            Arc::new(ContainerCache::new()),
        )
        .unwrap();
        let writer = WriterScheduler::new(WriterConfig::default().with_flush_mode(mode));
        let channel = Arc::new(ArchiveChannel::new(
            "W:1",
            DbrType::ScalarDouble,
            stage,
            1_000,
        ));
        writer.register(Arc::clone(&channel));
        (writer, channel)
    }

    fn sample(ts: i64) -> Sample {
        Sample::new(ts, SampleValue::Double(ts as f64))
    }

    #[test]
    fn test_flush_all_writes_and_empties_buffers() {
        for mode in [FlushMode::PerChannel, FlushMode::Global] {
            let temp_dir = TempDir::new().unwrap();
            let (writer, channel) = writer_with_channel(&temp_dir, mode);
            for i in 0..10 {
                channel.buffer().add(sample(END_OF_2023 - 100 + i));
            }
            let summary = writer.flush_all();
            assert_eq!(summary.channels, 1);
            assert_eq!(summary.samples, 10);
            assert!(channel.buffer().is_empty());
            assert_eq!(writer.flush_all(), FlushSummary::default());
        }
    }

    #[test]
    fn test_busy_channel_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, channel) = writer_with_channel(&temp_dir, FlushMode::PerChannel);
        channel.buffer().add(sample(END_OF_2023));
        let guard = channel.lock_flush();
        assert_eq!(writer.flush_all().skipped, 1);
        drop(guard);
        assert_eq!(writer.flush_all().samples, 1);
    }

    #[test]
    fn test_year_change_flushes_old_year_first() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, channel) = writer_with_channel(&temp_dir, FlushMode::PerChannel);
        channel.buffer().add(sample(END_OF_2023));
        channel.buffer().add(sample(END_OF_2023 + NANOS_PER_SECOND));
        channel.buffer().add(sample(END_OF_2023 + 3 * NANOS_PER_SECOND));

        assert_eq!(writer.stats().year_flushes.load(Ordering::Relaxed), 1);
        let partitions = channel.stage().partitions("W:1").unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(channel.buffer().len(), 1);

        writer.flush_all();
        assert_eq!(channel.stage().partitions("W:1").unwrap().len(), 2);
    }

    #[test]
    fn test_failed_flush_drops_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, channel) = writer_with_channel(&temp_dir, FlushMode::PerChannel);
        channel.buffer().add(sample(END_OF_2023));
        writer.flush_all();

        // A second writer appending behind the partition's last sample fails.
        let other =
            ArchiveChannel::new("W:1", DbrType::ScalarDouble, channel.stage().clone(), 10);
        other.buffer().add(sample(END_OF_2023 - 1));
        assert!(writer.flush_channel(&other).is_err());
        assert!(other.buffer().is_empty());
        assert_eq!(writer.stats().samples_lost.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining_samples() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, channel) = writer_with_channel(&temp_dir, FlushMode::PerChannel);
        let handle = Arc::clone(&writer).start();
        channel.buffer().add(sample(END_OF_2023));

        let summary = Arc::clone(&writer).shutdown().await.unwrap();
        handle.await.unwrap();
        assert!(channel.buffer().is_empty());
        assert!(summary.samples <= 1);
        assert_eq!(writer.stats().samples_written.load(Ordering::Relaxed), 1);
    }
}

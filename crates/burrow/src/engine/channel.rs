//! Archived channels: the live ingestion side of one PV.

use crate::engine::buffer::SampleBuffer;
use crate::storage::{DbrType, Sample, StorageStage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Event delivered by a PV source.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A new value.
    Sample(Sample),
    /// The source (re)connected.
    Connected,
    /// The source lost its connection.
    Disconnected,
}

/// One archived PV on the ingestion path.
#[derive(Debug)]
pub struct ArchiveChannel {
    pv: String,
    buffer: SampleBuffer,
    stage: StorageStage,
    flush_lock: Mutex<()>,
    source_connected: AtomicBool,
    paused: AtomicBool,
}

impl ArchiveChannel {
    /// Creates a channel writing into `stage`, its fastest storage tier.
    pub fn new(
        pv: impl Into<String>,
        dbr_type: DbrType,
        stage: StorageStage,
        capacity: usize,
    ) -> Self {
        let pv = pv.into();
        Self {
            buffer: SampleBuffer::new(pv.clone(), dbr_type, capacity),
            pv,
            stage,
            flush_lock: Mutex::new(()),
            source_connected: AtomicBool::new(true),
            paused: AtomicBool::new(false),
        }
    }

    /// Returns the PV name.
    pub fn pv(&self) -> &str {
        &self.pv
    }

    /// Returns the sample buffer.
    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Returns the stage flushes write to.
    pub fn stage(&self) -> &StorageStage {
        &self.stage
    }

    /// Returns true while archiving is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Pauses or resumes accumulation. A paused channel drops new samples.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.buffer
            .set_connected(!paused && self.source_connected.load(Ordering::SeqCst));
    }

    /// Applies one source event.
    pub fn on_event(&self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Sample(sample) => self.buffer.add(sample),
            ChannelEvent::Connected => {
                self.source_connected.store(true, Ordering::SeqCst);
                self.buffer.set_connected(!self.is_paused());
                info!(pv = %self.pv, "source connected");
                true
            }
            ChannelEvent::Disconnected => {
                self.source_connected.store(false, Ordering::SeqCst);
                self.buffer.set_connected(false);
                info!(pv = %self.pv, buffered = self.buffer.len(), "source disconnected");
                true
            }
        }
    }

    /// Takes the channel's flush lock, waiting for a flush in progress.
    pub(crate) fn lock_flush(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Takes the channel's flush lock unless a flush is in progress.
    pub(crate) fn try_lock_flush(&self) -> Option<MutexGuard<'_, ()>> {
        match self.flush_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(err)) => Some(err.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Feeds source events into `channel` until the sender side closes.
///
/// Runs on a blocking worker: a year change flushes synchronously and must
/// not stall the runtime threads serving other channels. Resolves to the
/// number of accepted samples.
pub fn ingest(
    channel: Arc<ArchiveChannel>,
    mut events: mpsc::Receiver<ChannelEvent>,
) -> JoinHandle<u64> {
    tokio::task::spawn_blocking(move || {
        let mut accepted = 0;
        while let Some(event) = events.blocking_recv() {
            let is_sample = matches!(event, ChannelEvent::Sample(_));
            if channel.on_event(event) && is_sample {
                accepted += 1;
            }
        }
        debug!(pv = %channel.pv(), accepted, "ingestion ended");
        accepted
    })
}

//! Per-channel staging of live samples awaiting a flush.

use crate::lifecycle::partition::year_of;
use crate::storage::{DbrType, Sample, Timestamp};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace};

/// Receives the old-year samples of a buffer when its data crosses a year.
pub trait YearListener: Send + Sync {
    /// Called synchronously with every buffered sample of `old_year`.
    ///
    /// The buffer accepts the first new-year sample only after this returns.
    fn year_changed(&self, pv: &str, old_year: i32, snapshot: Vec<Sample>);
}

/// Counters of one buffer.
#[derive(Debug, Default)]
pub struct BufferStats {
    /// Samples accepted.
    pub accepted: AtomicU64,
    /// Samples dropped because they were not newer than the last accepted one.
    pub dropped_out_of_order: AtomicU64,
    /// Samples dropped because their type differs from the channel's.
    pub dropped_type_mismatch: AtomicU64,
    /// Buffered samples discarded because the buffer was full.
    pub dropped_overflow: AtomicU64,
    /// Samples dropped while the channel was disconnected.
    pub dropped_disconnected: AtomicU64,
    /// Year changes observed.
    pub year_changes: AtomicU64,
}

impl BufferStats {
    /// Returns the total number of dropped samples.
    pub fn dropped(&self) -> u64 {
        self.dropped_out_of_order.load(Ordering::Relaxed)
            + self.dropped_type_mismatch.load(Ordering::Relaxed)
            + self.dropped_overflow.load(Ordering::Relaxed)
            + self.dropped_disconnected.load(Ordering::Relaxed)
    }

    /// Returns the number of accepted samples.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct BufferState {
    samples: VecDeque<Sample>,
    last_timestamp: Option<Timestamp>,
    year: Option<i32>,
    connected: bool,
}

/// Ordered staging list of one channel's samples.
pub struct SampleBuffer {
    pv: String,
    dbr_type: DbrType,
    capacity: usize,
    state: Mutex<BufferState>,
    listener: RwLock<Option<Arc<dyn YearListener>>>,
    stats: BufferStats,
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("pv", &self.pv)
            .field("dbr_type", &self.dbr_type)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl SampleBuffer {
    /// Creates an empty, connected buffer holding at most `capacity` samples.
    pub fn new(pv: impl Into<String>, dbr_type: DbrType, capacity: usize) -> Self {
        Self {
            pv: pv.into(),
            dbr_type,
            capacity: capacity.max(1),
            state: Mutex::new(BufferState {
                samples: VecDeque::new(),
                last_timestamp: None,
                year: None,
                connected: true,
            }),
            listener: RwLock::new(None),
            stats: BufferStats::default(),
        }
    }

    /// Returns the PV name.
    pub fn pv(&self) -> &str {
        &self.pv
    }

    /// Returns the channel's value type.
    pub fn dbr_type(&self) -> DbrType {
        self.dbr_type
    }

    /// Returns the buffer's counters.
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Installs the year-change listener.
    pub fn set_year_listener(&self, listener: Arc<dyn YearListener>) {
        *self.listener.write().unwrap_or_else(|err| err.into_inner()) = Some(listener);
    }

    /// Marks the source connected or disconnected.
    ///
    /// While disconnected new samples are dropped; buffered ones are kept
    /// for the next flush.
    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Returns true while the source is connected.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Adds a sample. Returns false if it was dropped.
    pub fn add(&self, sample: Sample) -> bool {
        let mut state = self.lock();
        if !state.connected {
            self.stats
                .dropped_disconnected
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if sample.dbr_type() != self.dbr_type {
            self.stats
                .dropped_type_mismatch
                .fetch_add(1, Ordering::Relaxed);
            trace!(pv = %self.pv, found = ?sample.dbr_type(), "dropping sample of wrong type");
            return false;
        }
        if let Some(last) = state.last_timestamp {
            if sample.timestamp <= last {
                self.stats
                    .dropped_out_of_order
                    .fetch_add(1, Ordering::Relaxed);
                trace!(pv = %self.pv, ts = sample.timestamp, last, "dropping out-of-order sample");
                return false;
            }
        }
        state.last_timestamp = Some(sample.timestamp);

        let year = year_of(sample.timestamp);
        match state.year {
            Some(old_year) if old_year != year => {
                state.year = Some(year);
                let snapshot: Vec<Sample> = state.samples.drain(..).collect();
                drop(state);

                self.stats.year_changes.fetch_add(1, Ordering::Relaxed);
                debug!(pv = %self.pv, old_year, year, samples = snapshot.len(), "year changed");
                let listener = self
                    .listener
                    .read()
                    .unwrap_or_else(|err| err.into_inner())
                    .clone();
                if let Some(listener) = listener {
                    listener.year_changed(&self.pv, old_year, snapshot);
                }

                // Anything added meanwhile is newer than this sample.
                let mut state = self.lock();
                self.make_room(&mut state);
                state.samples.push_front(sample);
            }
            Some(_) => {
                self.make_room(&mut state);
                state.samples.push_back(sample);
            }
            None => {
                state.year = Some(year);
                state.samples.push_back(sample);
            }
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Takes every buffered sample, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Sample> {
        self.lock().samples.drain(..).collect()
    }

    /// Returns the number of buffered samples.
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the timestamp of the newest accepted sample.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.lock().last_timestamp
    }

    fn make_room(&self, state: &mut BufferState) {
        while state.samples.len() >= self.capacity {
            state.samples.pop_front();
            self.stats.dropped_overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

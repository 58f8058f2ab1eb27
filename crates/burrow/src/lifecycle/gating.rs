//! Gating intervals: time ranges ETL must leave at their current stage.

use crate::storage::TimeRange;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Default cap on intervals kept per scope.
pub const DEFAULT_MAX_INTERVALS: usize = 100;

/// Protected time intervals, grouped by scope.
///
/// Intervals within a scope are kept sorted and disjoint: adding a range
/// that overlaps or touches existing ones coalesces them.
#[derive(Debug)]
pub struct GatingState {
    scopes: RwLock<HashMap<String, Vec<TimeRange>>>,
    max_intervals: usize,
}

impl Default for GatingState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INTERVALS)
    }
}

impl GatingState {
    /// Creates an empty gating state keeping at most `max_intervals` per scope.
    pub fn new(max_intervals: usize) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            max_intervals: max_intervals.max(1),
        }
    }

    /// Protects `range` in `scope`.
    ///
    /// Empty or inverted ranges are ignored and return false. When the scope
    /// exceeds its cap, the oldest intervals are dropped.
    pub fn keep_interval(&self, scope: &str, range: TimeRange) -> bool {
        if range.is_empty() {
            debug!(scope = %scope, ?range, "ignoring empty gating interval");
            return false;
        }
        let mut scopes = self.scopes.write().unwrap_or_else(|err| err.into_inner());
        let intervals = scopes.entry(scope.to_string()).or_default();

        let mut merged = range;
        intervals.retain(|existing| {
            if existing.start <= merged.end && merged.start <= existing.end {
                merged.start = merged.start.min(existing.start);
                merged.end = merged.end.max(existing.end);
                false
            } else {
                true
            }
        });
        let at = intervals.partition_point(|existing| existing.start < merged.start);
        intervals.insert(at, merged);

        if intervals.len() > self.max_intervals {
            let excess = intervals.len() - self.max_intervals;
            let dropped: Vec<TimeRange> = intervals.drain(..excess).collect();
            warn!(scope = %scope, ?dropped, "gating scope full, dropped oldest intervals");
        }
        true
    }

    /// Releases `range` from `scope`, splitting intervals that straddle it.
    pub fn remove_interval(&self, scope: &str, range: TimeRange) {
        if range.is_empty() {
            return;
        }
        let mut scopes = self.scopes.write().unwrap_or_else(|err| err.into_inner());
        let Some(intervals) = scopes.get_mut(scope) else {
            return;
        };

        let mut remaining = Vec::with_capacity(intervals.len() + 1);
        for existing in intervals.drain(..) {
            if !existing.overlaps(&range) {
                remaining.push(existing);
                continue;
            }
            if existing.start < range.start {
                remaining.push(TimeRange::new(existing.start, range.start));
            }
            if range.end < existing.end {
                remaining.push(TimeRange::new(range.end, existing.end));
            }
        }
        if remaining.is_empty() {
            scopes.remove(scope);
        } else {
            *intervals = remaining;
        }
    }

    /// Returns the first protected interval overlapping `window` in any of `scopes`.
    pub fn should_keep(&self, scopes: &[&str], window: TimeRange) -> Option<TimeRange> {
        let all = self.scopes.read().unwrap_or_else(|err| err.into_inner());
        scopes
            .iter()
            .filter_map(|scope| all.get(*scope))
            .flat_map(|intervals| intervals.iter())
            .find(|interval| interval.overlaps(&window))
            .copied()
    }

    /// Returns the intervals of `scope`, sorted by start.
    pub fn intervals(&self, scope: &str) -> Vec<TimeRange> {
        self.scopes
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    /// Drops every interval of `scope`. Returns true if the scope existed.
    pub fn clear_scope(&self, scope: &str) -> bool {
        self.scopes
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(scope)
            .is_some()
    }
}

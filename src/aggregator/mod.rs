use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::clock::{unix_now, BucketUnit};

/// One externally consumed point of a bucketed series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// The metrics tracked per account and globally. One aggregator
/// instance exists per kind; all three share the same reconciliation
/// rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Hashes,
    SuperHashes,
    SolXen,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [Self::Hashes, Self::SuperHashes, Self::SolXen];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hashes => "hashes",
            Self::SuperHashes => "super_hashes",
            Self::SolXen => "sol_xen",
        }
    }
}

/// Aggregator lifecycle. Live increments are accepted only after the
/// first authoritative snapshot has been installed, so a granularity
/// change can never mix live minute-buckets into hour-bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Populated,
}

/// Per-metric map from truncated-timestamp bucket to accumulated
/// value, bounded by a sliding window.
///
/// Polled snapshots are authoritative for every completed bucket and
/// are applied by overwrite; the bucket for the current instant is
/// owned by live increments within a poll cycle, so `merge` drops the
/// incoming value for that one key. Keys older than the window are
/// evicted on merge and excluded from every snapshot.
#[derive(Debug)]
pub struct TimeBucketAggregator {
    unit: BucketUnit,
    window_secs: i64,
    buckets: HashMap<i64, f64>,
    phase: Phase,
}

impl TimeBucketAggregator {
    /// Create an empty aggregator for the given granularity/window pair.
    pub fn new(unit: BucketUnit, window_secs: i64) -> Self {
        Self {
            unit,
            window_secs,
            buckets: HashMap::new(),
            phase: Phase::Uninitialized,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn unit(&self) -> BucketUnit {
        self.unit
    }

    /// Number of retained buckets, including any outside the window
    /// that have not been evicted yet.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Discard all buckets and install `map` as the entire state.
    /// Used on first load and after a granularity change.
    pub fn replace(&mut self, map: HashMap<i64, f64>) {
        self.buckets = map;
        self.phase = Phase::Populated;
    }

    /// Clear all state and return to `Uninitialized`, optionally
    /// switching granularity/window. Increments are dropped until the
    /// next `replace`/`reconcile` installs a fresh snapshot.
    pub fn reset(&mut self, unit: BucketUnit, window_secs: i64) {
        self.unit = unit;
        self.window_secs = window_secs;
        self.buckets.clear();
        self.phase = Phase::Uninitialized;
    }

    /// Apply a polled snapshot: `replace` if no snapshot has been
    /// installed yet, `merge` otherwise.
    pub fn reconcile(&mut self, map: HashMap<i64, f64>) {
        self.reconcile_at(map, unix_now());
    }

    /// `reconcile` with an explicit current time.
    pub fn reconcile_at(&mut self, map: HashMap<i64, f64>, now: i64) {
        match self.phase {
            Phase::Uninitialized => self.replace(map),
            Phase::Populated => self.merge_at(map, now),
        }
    }

    /// Reconcile a polled snapshot with live state.
    ///
    /// The poll's value for the current bucket is assumed staler than
    /// anything already accumulated locally and is discarded; every
    /// other key is overwritten (not summed) because completed buckets
    /// are authoritative upstream. Keys that end up older than the
    /// window are evicted. An empty map is a no-op beyond eviction.
    pub fn merge(&mut self, map: HashMap<i64, f64>) {
        self.merge_at(map, unix_now());
    }

    /// `merge` with an explicit current time.
    pub fn merge_at(&mut self, mut map: HashMap<i64, f64>, now: i64) {
        let current_key = self.unit.truncate(now);
        map.remove(&current_key);

        for (key, value) in map {
            self.buckets.insert(key, value);
        }

        self.evict(now);
        self.phase = Phase::Populated;
    }

    /// Add `amount` to the bucket for the current instant, creating it
    /// at `amount` if absent. The only operation live delta events may
    /// drive. Dropped while `Uninitialized`.
    pub fn increment(&mut self, amount: f64) {
        self.increment_at(amount, unix_now());
    }

    /// `increment` with an explicit current time.
    pub fn increment_at(&mut self, amount: f64, now: i64) {
        if self.phase == Phase::Uninitialized {
            return;
        }

        let key = self.unit.truncate(now);
        *self.buckets.entry(key).or_insert(0.0) += amount;
    }

    /// All buckets within `[now - window, now]` as a time-ascending
    /// series. Buckets outside the window are skipped even if eviction
    /// has not run since they aged out.
    pub fn snapshot(&self) -> Vec<SeriesPoint> {
        self.snapshot_at(unix_now())
    }

    /// `snapshot` with an explicit current time.
    pub fn snapshot_at(&self, now: i64) -> Vec<SeriesPoint> {
        let cutoff = self.window_cutoff(now);

        let mut points: Vec<SeriesPoint> = self
            .buckets
            .iter()
            .filter(|(key, _)| **key >= cutoff)
            .map(|(key, value)| SeriesPoint {
                time: Utc
                    .timestamp_opt(*key, 0)
                    .single()
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                value: *value,
            })
            .collect();

        points.sort_by_key(|p| p.time);
        points
    }

    /// Update the eviction threshold for subsequent snapshots and
    /// merges. Stored keys are not rewritten.
    pub fn set_window(&mut self, window_secs: i64) {
        self.window_secs = window_secs;
    }

    /// Drop buckets older than the window.
    fn evict(&mut self, now: i64) {
        let cutoff = self.window_cutoff(now);
        self.buckets.retain(|key, _| *key >= cutoff);
    }

    fn window_cutoff(&self, now: i64) -> i64 {
        self.unit.truncate(now) - self.window_secs
    }
}

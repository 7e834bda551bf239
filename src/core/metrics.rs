//! Internal counters for store activity.
//!
//! Lock-free atomics sampled by `Storage::stats`. A metrics exporter,
//! if any, sits above the store and reads these snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Store-wide activity counters.
#[derive(Debug)]
pub struct StorageCounters {
    /// Profiles ingested through the segment path.
    pub writes_total: AtomicU64,
    /// Queries served.
    pub reads_total: AtomicU64,
    /// Writes rejected by retention or capacity checks.
    pub writes_rejected: AtomicU64,
    /// Cache entries evicted.
    pub evictions_total: AtomicU64,
    /// Retention sweep passes completed.
    pub retention_sweeps: AtomicU64,
    /// Exemplar entries written.
    pub exemplars_written: AtomicU64,
    /// Exemplar entries removed by truncation.
    pub exemplars_removed: AtomicU64,
    /// Exemplar entries discarded because the flush queue was full.
    pub exemplars_discarded: AtomicU64,
    /// Start time for rate calculations.
    pub start_time: Instant,
}

impl Default for StorageCounters {
    fn default() -> Self {
        Self {
            writes_total: AtomicU64::new(0),
            reads_total: AtomicU64::new(0),
            writes_rejected: AtomicU64::new(0),
            evictions_total: AtomicU64::new(0),
            retention_sweeps: AtomicU64::new(0),
            exemplars_written: AtomicU64::new(0),
            exemplars_removed: AtomicU64::new(0),
            exemplars_discarded: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl StorageCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            writes_total: self.writes_total.load(Ordering::Relaxed),
            reads_total: self.reads_total.load(Ordering::Relaxed),
            writes_rejected: self.writes_rejected.load(Ordering::Relaxed),
            evictions_total: self.evictions_total.load(Ordering::Relaxed),
            retention_sweeps: self.retention_sweeps.load(Ordering::Relaxed),
            exemplars_written: self.exemplars_written.load(Ordering::Relaxed),
            exemplars_removed: self.exemplars_removed.load(Ordering::Relaxed),
            exemplars_discarded: self.exemplars_discarded.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub writes_total: u64,
    pub reads_total: u64,
    pub writes_rejected: u64,
    pub evictions_total: u64,
    pub retention_sweeps: u64,
    pub exemplars_written: u64,
    pub exemplars_removed: u64,
    pub exemplars_discarded: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = StorageCounters::default();
        StorageCounters::incr(&counters.writes_total);
        StorageCounters::add(&counters.exemplars_removed, 3);
        let snap = counters.snapshot();
        assert_eq!(snap.writes_total, 1);
        assert_eq!(snap.exemplars_removed, 3);
        assert_eq!(snap.reads_total, 0);
    }
}

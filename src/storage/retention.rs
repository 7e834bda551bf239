//! Retention policy: the time and size thresholds a garbage-collection
//! pass enforces.
//!
//! A policy is computed fresh per pass from wall-clock time and static
//! configuration; it is never persisted. Thresholds are monotonic with
//! depth — coarser levels aggregate more data per node and may be kept
//! longer.

use crate::core::{RetentionConfig, StorageConfig};
use crate::storage::segment::SegmentGeometry;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Time/size thresholds for one enforcement pass.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    absolute_time: DateTime<Utc>,
    exemplars_time: DateTime<Utc>,
    levels: HashMap<usize, DateTime<Utc>>,
    size_limit: u64,
    reclaim_ratio: f64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            absolute_time: DateTime::UNIX_EPOCH,
            exemplars_time: DateTime::UNIX_EPOCH,
            levels: HashMap::new(),
            size_limit: 0,
            reclaim_ratio: 0.0,
        }
    }
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The policy in effect at `now` for the given configuration.
    pub fn from_config(
        retention: &RetentionConfig,
        storage: &StorageConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let to_chrono = |d: std::time::Duration| Duration::from_std(d).unwrap_or_else(|_| Duration::zero());
        let mut policy = Self::new();
        if !retention.max_age.is_zero() {
            policy.absolute_time = now - to_chrono(retention.max_age);
        }
        if !retention.exemplars_max_age.is_zero() {
            policy.exemplars_time = now - to_chrono(retention.exemplars_max_age);
        }
        for (depth, age) in retention.levels.iter().enumerate() {
            if !age.is_zero() {
                policy.levels.insert(depth, now - to_chrono(*age));
            }
        }
        policy.size_limit = storage.size_limit;
        policy.reclaim_ratio = storage.size_reclaim_ratio;
        policy
    }

    pub fn with_absolute_time(mut self, t: DateTime<Utc>) -> Self {
        self.absolute_time = t;
        self
    }

    pub fn with_exemplars_time(mut self, t: DateTime<Utc>) -> Self {
        self.exemplars_time = t;
        self
    }

    pub fn with_level_time(mut self, depth: usize, t: DateTime<Utc>) -> Self {
        self.levels.insert(depth, t);
        self
    }

    pub fn with_size_limit(mut self, limit: u64, reclaim_ratio: f64) -> Self {
        self.size_limit = limit;
        self.reclaim_ratio = reclaim_ratio;
        self
    }

    pub fn absolute_time(&self) -> DateTime<Utc> {
        self.absolute_time
    }

    pub fn exemplars_time(&self) -> DateTime<Utc> {
        self.exemplars_time
    }

    pub fn levels(&self) -> impl Iterator<Item = (&usize, &DateTime<Utc>)> {
        self.levels.iter()
    }

    pub fn levels_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Whether any time-based threshold is active at all.
    pub fn is_time_based(&self) -> bool {
        self.absolute_time > DateTime::UNIX_EPOCH || !self.levels.is_empty()
    }

    /// The deletion threshold applying to nodes at the given depth:
    /// the per-level threshold when configured, the absolute one
    /// otherwise, whichever is later.
    pub fn threshold_for_level(&self, depth: usize) -> DateTime<Utc> {
        match self.levels.get(&depth) {
            Some(t) => (*t).max(self.absolute_time),
            None => self.absolute_time,
        }
    }

    /// Writes starting before this boundary are rejected outright.
    pub fn lower_time_boundary(&self) -> DateTime<Utc> {
        self.absolute_time
    }

    /// Align every threshold down to its level's bucket span so
    /// enforcement never splits a bucket.
    pub fn normalize(&self, geo: &SegmentGeometry) -> Self {
        let mut out = self.clone();
        out.absolute_time = geo.truncate(out.absolute_time, 0);
        let max_depth = geo.max_depth();
        out.levels = out
            .levels
            .into_iter()
            .map(|(depth, t)| {
                let t = if depth < max_depth {
                    geo.truncate(t, depth)
                } else {
                    t
                };
                (depth, t)
            })
            .collect();
        out
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Bytes to free once disk usage exceeds the size limit: the
    /// overshoot plus a slack fraction of the limit, so enforcement
    /// does not retrigger on the very next write. Zero while under the
    /// limit.
    pub fn capacity_to_reclaim(&self, used: u64) -> u64 {
        if self.size_limit == 0 || used <= self.size_limit {
            return 0;
        }
        used - self.size_limit + (self.size_limit as f64 * self.reclaim_ratio) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_threshold_falls_back_to_absolute() {
        let policy = RetentionPolicy::new()
            .with_absolute_time(t(100))
            .with_level_time(0, t(500));
        assert_eq!(policy.threshold_for_level(0), t(500));
        assert_eq!(policy.threshold_for_level(1), t(100));
    }

    #[test]
    fn test_absolute_wins_when_later() {
        let policy = RetentionPolicy::new()
            .with_absolute_time(t(900))
            .with_level_time(0, t(500));
        assert_eq!(policy.threshold_for_level(0), t(900));
    }

    #[test]
    fn test_from_config() {
        let retention = RetentionConfig {
            max_age: StdDuration::from_secs(100),
            levels: vec![StdDuration::from_secs(100), StdDuration::from_secs(1000)],
            exemplars_max_age: StdDuration::from_secs(50),
        };
        let storage = StorageConfig::default();
        let now = t(10_000);
        let policy = RetentionPolicy::from_config(&retention, &storage, now);
        assert_eq!(policy.absolute_time(), t(9_900));
        assert_eq!(policy.exemplars_time(), t(9_950));
        assert_eq!(policy.threshold_for_level(0), t(9_900));
        assert_eq!(policy.threshold_for_level(1), t(9_900));
        assert!(policy.is_time_based());
    }

    #[test]
    fn test_disabled_config_is_inert() {
        let policy = RetentionPolicy::from_config(
            &RetentionConfig::default(),
            &StorageConfig::default(),
            t(10_000),
        );
        assert!(!policy.is_time_based());
        assert_eq!(policy.capacity_to_reclaim(1 << 30), 0);
    }

    #[test]
    fn test_normalize_truncates_thresholds() {
        let geo = SegmentGeometry::new(StdDuration::from_secs(10), 10, 4);
        let policy = RetentionPolicy::new()
            .with_absolute_time(t(27))
            .with_level_time(1, t(123))
            .normalize(&geo);
        assert_eq!(policy.absolute_time(), t(20));
        assert_eq!(policy.threshold_for_level(1), t(100));
    }

    #[test]
    fn test_capacity_to_reclaim() {
        let mut policy = RetentionPolicy::new();
        policy.size_limit = 1000;
        policy.reclaim_ratio = 0.05;
        assert_eq!(policy.capacity_to_reclaim(900), 0);
        assert_eq!(policy.capacity_to_reclaim(1000), 0);
        assert_eq!(policy.capacity_to_reclaim(1200), 200 + 50);
    }
}

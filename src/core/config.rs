//! Configuration for the profiling store.
//!
//! Sections mirror the store's moving parts: segment geometry and cache
//! behavior, retention thresholds, exemplar batching, and logging.
//! All durations accept humantime strings in YAML (`"10s"`, `"2m"`).

use crate::core::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete configuration for the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage engine configuration
    pub storage: StorageConfig,
    /// Retention configuration
    pub retention: RetentionConfig,
    /// Exemplar (individually addressable profiles) configuration
    pub exemplars: ExemplarsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base time bucket duration (finest segment tree resolution).
    #[serde(with = "humantime_serde")]
    pub resolution: Duration,
    /// Branching factor of the segment tree. Each depth level spans
    /// `resolution * multiplier^depth`.
    pub multiplier: usize,
    /// Maximum number of depth levels a segment tree may grow to.
    pub max_depth: usize,
    /// How long an idle cache entry survives before write-back evicts it.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Cache eviction check interval.
    #[serde(with = "humantime_serde")]
    pub eviction_interval: Duration,
    /// Dirty cache entry persistence interval.
    #[serde(with = "humantime_serde")]
    pub write_back_interval: Duration,
    /// Retention enforcement interval.
    #[serde(with = "humantime_serde")]
    pub retention_interval: Duration,
    /// Fraction of cached entries dropped on an eviction pass.
    pub cache_evict_fraction: f64,
    /// Cached tree count above which an eviction pass runs.
    pub cache_max_entries: usize,
    /// Maximum profile tree nodes persisted per aggregate; larger trees
    /// are truncated with the tail collapsed into an `other` frame.
    /// 0 disables truncation.
    pub max_nodes_serialization: usize,
    /// Application names hidden from label value enumeration.
    pub hide_applications: Vec<String>,
    /// Disk size limit in bytes. 0 disables size-based retention.
    pub size_limit: u64,
    /// Extra fraction of the size limit reclaimed once the limit is hit,
    /// so enforcement does not retrigger on the very next write.
    pub size_reclaim_ratio: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resolution: Duration::from_secs(10),
            multiplier: 10,
            max_depth: 16,
            cache_ttl: Duration::from_secs(120),
            eviction_interval: Duration::from_secs(20),
            write_back_interval: Duration::from_secs(60),
            retention_interval: Duration::from_secs(60),
            cache_evict_fraction: 0.25,
            cache_max_entries: 1 << 16,
            max_nodes_serialization: 2048,
            hide_applications: Vec::new(),
            size_limit: 0,
            size_reclaim_ratio: 0.05,
        }
    }
}

/// Time-based retention thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Absolute maximum age of profiling data. Zero disables.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Per-depth-level maximum ages, index = depth. Coarser levels
    /// aggregate more data per node and may be kept longer.
    pub levels: Vec<Duration>,
    /// Maximum age of exemplar entries. Zero disables.
    #[serde(with = "humantime_serde")]
    pub exemplars_max_age: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::ZERO,
            levels: Vec::new(),
            exemplars_max_age: Duration::ZERO,
        }
    }
}

/// Exemplar batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExemplarsConfig {
    /// Entries buffered before a batch is queued for flush.
    pub batch_size: usize,
    /// Completed batches allowed to queue before new ones are discarded.
    pub batch_queue_size: usize,
    /// Interval at which a non-empty current batch is queued regardless
    /// of fill level.
    #[serde(with = "humantime_serde")]
    pub batch_flush_interval: Duration,
    /// Index entries examined per truncation step, bounding how long the
    /// retention sweep runs between cancellation checks.
    pub truncation_batch_size: usize,
    /// Maximum profile tree nodes persisted per exemplar; larger trees
    /// are truncated with the tail collapsed into an `other` frame.
    pub max_nodes: usize,
}

impl Default for ExemplarsConfig {
    fn default() -> Self {
        Self {
            batch_size: 10 << 10,
            batch_queue_size: 5,
            batch_flush_interval: Duration::from_secs(5),
            truncation_batch_size: 1 << 10,
            max_nodes: 2048,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            exemplars: ExemplarsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| EmberError::parse(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.storage.resolution.is_zero() {
            return Err(EmberError::parse("storage.resolution must be positive"));
        }
        if self.storage.multiplier < 2 {
            return Err(EmberError::parse("storage.multiplier must be at least 2"));
        }
        if self.storage.max_depth == 0 {
            return Err(EmberError::parse("storage.max_depth must be positive"));
        }
        if !(0.0..=1.0).contains(&self.storage.cache_evict_fraction) {
            return Err(EmberError::parse(
                "storage.cache_evict_fraction must be within 0.0..=1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.storage.size_reclaim_ratio) {
            return Err(EmberError::parse(
                "storage.size_reclaim_ratio must be within 0.0..=1.0",
            ));
        }
        // Level thresholds must be monotonic: a coarser level may not be
        // dropped earlier than a finer one.
        let mut prev = self.retention.max_age;
        for (depth, age) in self.retention.levels.iter().enumerate() {
            if !prev.is_zero() && !age.is_zero() && *age < prev {
                return Err(EmberError::parse(format!(
                    "retention.levels[{}] is shorter than the preceding level",
                    depth
                )));
            }
            if !age.is_zero() {
                prev = *age;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_resolution() {
        let mut config = Config::default();
        config.storage.resolution = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_monotonic_levels() {
        let mut config = Config::default();
        config.retention.levels =
            vec![Duration::from_secs(3600), Duration::from_secs(60)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let raw = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(parsed.storage.multiplier, config.storage.multiplier);
        assert_eq!(parsed.storage.resolution, config.storage.resolution);
    }
}

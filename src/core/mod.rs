//! Domain primitives shared across the store: configuration, errors,
//! and activity counters.

pub mod config;
pub mod error;
pub mod metrics;

pub use config::{Config, ExemplarsConfig, LoggingConfig, RetentionConfig, StorageConfig};
pub use error::{EmberError, Result};
pub use metrics::{CounterSnapshot, StorageCounters};

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber from the logging config.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber installed by the embedding application wins.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

//! Emberstore - segmented time-series storage for profiling data.
//!
//! Emberstore ingests sampled call-stack trees ("profiles") tagged with
//! labels, persists them into time-bucketed segments, and answers
//! merge/range queries that reconstruct aggregated flame graphs over
//! arbitrary time windows and label selections.
//!
//! # Architecture
//!
//! - `storage::key`: label-set parsing and canonical segment addressing
//! - `storage::dimension`: inverted index from label pairs to segments
//! - `storage::segment`: the exponential interval tree tracking write
//!   coverage per segment at multiple resolutions
//! - `storage::tree`: call-stack aggregation (the flame graph payload)
//! - `storage::cache` / `storage::kv`: write-back caches over a narrow
//!   embedded key-value interface
//! - `storage::exemplars`: individually addressable profiles, stored
//!   outside the segment-tree aggregation path
//! - `query`: the label-selection query language
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use emberstore::core::Config;
//! use emberstore::storage::{MemoryKv, Storage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Storage::new(Config::default(), Arc::new(MemoryKv::new()))?;
//!     // ... ingest with storage.put, query with storage.get
//!     storage.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod core;
pub mod query;
pub mod storage;

// Re-export core types for convenience
pub use crate::core::{Config, EmberError, Result};
pub use crate::storage::Storage;

//! The profiling-data store.
//!
//! Orchestrates the moving parts: label keys resolve to segments
//! through the dimension index, segments track time coverage in their
//! interval trees, per-bucket profile trees live in write-back caches
//! over the KV collaborator, and background tasks handle write-back,
//! eviction, and retention.

pub mod cache;
pub mod dict;
pub mod dimension;
pub mod exemplars;
pub mod key;
pub mod kv;
pub mod labels;
pub mod retention;
pub mod segment;
pub mod timeline;
pub mod tree;

pub use dimension::Dimension;
pub use exemplars::ExemplarEntry;
pub use key::{parse_key, Key};
pub use kv::{KvStore, MemoryKv};
#[cfg(feature = "persistent")]
pub use kv::RocksKv;
pub use retention::RetentionPolicy;
pub use segment::{AggregationType, Segment, SegmentGeometry, SegmentMetadata, Units};
pub use timeline::Timeline;
pub use tree::Tree;

use crate::core::{Config, CounterSnapshot, EmberError, Result, StorageCounters};
use crate::query::{MatchOp, Query};
use crate::storage::cache::{BincodeCodec, Cache, Codec};
use crate::storage::dict::Dictionary;
use crate::storage::exemplars::Exemplars;
use crate::storage::key::APP_NAME_LABEL;
use crate::storage::labels::Labels;
use chrono::{DateTime, Utc};
use num_rational::Ratio;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// One profile write.
#[derive(Debug, Clone)]
pub struct PutInput {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub key: Key,
    pub val: Tree,
    pub spy_name: String,
    pub sample_rate: u32,
    pub units: Units,
    pub aggregation_type: AggregationType,
}

/// One merge/range query. Exactly one of `key` and `query` must be set.
#[derive(Debug, Clone)]
pub struct GetInput {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub key: Option<Key>,
    pub query: Option<Query>,
}

/// Query result: the merged flame graph, its timeline, and the
/// metadata of the contributing segments.
#[derive(Debug, Clone)]
pub struct GetOutput {
    pub tree: Tree,
    pub timeline: Timeline,
    pub metadata: SegmentMetadata,
}

/// Request to merge individually addressed profiles.
#[derive(Debug, Clone)]
pub struct MergeProfilesInput {
    pub app_name: String,
    pub profile_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MergeProfilesOutput {
    pub tree: Tree,
    pub count: u64,
    pub metadata: SegmentMetadata,
}

/// Cache entry counts, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub segments: usize,
    pub dimensions: usize,
    pub dicts: usize,
    pub trees: usize,
}

fn dimension_key(label_key: &str, label_value: &str) -> String {
    format!("{}:{}", label_key, label_value)
}

struct SegmentCodec {
    geometry: Arc<SegmentGeometry>,
}

impl Codec<Segment> for SegmentCodec {
    fn encode(&self, _key: &str, value: &Segment) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| EmberError::decode(format!("segment encode: {}", e)))
    }

    fn decode(&self, _key: &str, bytes: &[u8]) -> Result<Segment> {
        let mut segment: Segment = bincode::deserialize(bytes)
            .map_err(|e| EmberError::decode(format!("segment decode: {}", e)))?;
        segment.set_geometry(Arc::clone(&self.geometry));
        Ok(segment)
    }

    fn new_value(&self, _key: &str) -> Segment {
        Segment::new(Arc::clone(&self.geometry))
    }
}

struct TreeCodec {
    dicts: Arc<Cache<Dictionary>>,
    max_nodes: usize,
}

impl TreeCodec {
    /// Tree keys start with the normalized segment key; the app name
    /// runs up to the label block.
    fn app_of(key: &str) -> &str {
        key.split('{').next().unwrap_or(key)
    }
}

impl Codec<Tree> for TreeCodec {
    fn encode(&self, key: &str, value: &Tree) -> Result<Vec<u8>> {
        let app = Self::app_of(key);
        let dict = self.dicts.get_or_create(app)?;
        let bytes = {
            let mut dict = dict.write();
            value.serialize(&mut dict, self.max_nodes)
        };
        self.dicts.put(app, dict);
        Ok(bytes)
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<Tree> {
        let dict = self.dicts.get_or_create(Self::app_of(key))?;
        let dict = dict.read();
        Tree::deserialize(&dict, bytes)
    }

    fn new_value(&self, _key: &str) -> Tree {
        Tree::new()
    }
}

struct StorageCore {
    config: Config,
    geometry: Arc<SegmentGeometry>,
    db: Arc<dyn KvStore>,
    labels: Labels,
    segments: Cache<Segment>,
    dimensions: Cache<Dimension>,
    dicts: Arc<Cache<Dictionary>>,
    trees: Cache<Tree>,
    exemplars: Exemplars,
    counters: Arc<StorageCounters>,
    /// Serializes the whole write path. Intentionally broad: the write
    /// path has low parallelism requirements and a single lock keeps
    /// stree growth and dimension updates trivially consistent.
    put_lock: tokio::sync::Mutex<()>,
    /// At most one maintenance task runs at a time.
    maintenance_lock: tokio::sync::Mutex<()>,
}

/// The store. Cheap to share: background tasks hold their own handles
/// to the internals.
pub struct Storage {
    core: Arc<StorageCore>,
    stop: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Storage {
    /// Wire the store over the given KV collaborator and start the
    /// maintenance tasks. Must run inside a tokio runtime.
    pub fn new(config: Config, db: Arc<dyn KvStore>) -> Result<Self> {
        config.validate()?;
        let storage_cfg = &config.storage;
        let geometry = Arc::new(SegmentGeometry::new(
            storage_cfg.resolution,
            storage_cfg.multiplier,
            storage_cfg.max_depth,
        ));
        let ttl = storage_cfg.cache_ttl;
        let counters = Arc::new(StorageCounters::default());

        let dicts = Arc::new(Cache::new(
            Arc::clone(&db),
            Box::new(BincodeCodec),
            "d:",
            ttl,
        ));
        let segments = Cache::new(
            Arc::clone(&db),
            Box::new(SegmentCodec {
                geometry: Arc::clone(&geometry),
            }),
            "s:",
            ttl,
        );
        let dimensions = Cache::new(Arc::clone(&db), Box::new(BincodeCodec), "i:", ttl);
        let trees = Cache::new(
            Arc::clone(&db),
            Box::new(TreeCodec {
                dicts: Arc::clone(&dicts),
                max_nodes: storage_cfg.max_nodes_serialization,
            }),
            "t:",
            ttl,
        );
        let exemplars = Exemplars::new(
            config.exemplars.clone(),
            Arc::clone(&db),
            Arc::clone(&dicts),
            Arc::clone(&counters),
        );

        let core = Arc::new(StorageCore {
            labels: Labels::new(Arc::clone(&db)),
            geometry,
            db,
            segments,
            dimensions,
            dicts,
            trees,
            exemplars,
            counters,
            put_lock: tokio::sync::Mutex::new(()),
            maintenance_lock: tokio::sync::Mutex::new(()),
            config,
        });

        let (stop, _) = watch::channel(false);
        let storage = Self {
            core,
            stop,
            tasks: parking_lot::Mutex::new(Vec::new()),
        };
        storage.spawn_maintenance_tasks();
        Ok(storage)
    }

    fn spawn_maintenance_tasks(&self) {
        let mut tasks = self.tasks.lock();

        let core = Arc::clone(&self.core);
        let stop = self.stop.subscribe();
        tasks.push(tokio::spawn(run_eviction_task(core, stop)));

        let core = Arc::clone(&self.core);
        let stop = self.stop.subscribe();
        tasks.push(tokio::spawn(run_write_back_task(core, stop)));

        let core = Arc::clone(&self.core);
        let stop = self.stop.subscribe();
        tasks.push(tokio::spawn(run_exemplars_flush_task(core, stop)));

        let retention = &self.core.config.retention;
        let retention_enabled = !retention.max_age.is_zero()
            || !retention.levels.is_empty()
            || !retention.exemplars_max_age.is_zero()
            || self.core.config.storage.size_limit > 0;
        if retention_enabled {
            let core = Arc::clone(&self.core);
            let stop = self.stop.subscribe();
            tasks.push(tokio::spawn(run_retention_task(core, stop)));
        }
    }

    /// Ingest one profile.
    pub async fn put(&self, input: PutInput) -> Result<()> {
        let core = &self.core;
        let _guard = core.put_lock.lock().await;

        let policy = core.current_retention_policy();
        let boundary = policy.lower_time_boundary();
        if boundary > DateTime::UNIX_EPOCH && input.start_time < boundary {
            StorageCounters::incr(&core.counters.writes_rejected);
            return Err(EmberError::Retention);
        }
        let size_limit = core.config.storage.size_limit;
        if size_limit > 0 && core.db.approximate_size() >= size_limit {
            StorageCounters::incr(&core.counters.writes_rejected);
            return Err(EmberError::OutOfSpace);
        }

        debug!(
            key = %input.key.normalized(),
            start = input.start_time.timestamp(),
            end = input.end_time.timestamp(),
            samples = input.val.samples(),
            "storage.put"
        );
        StorageCounters::incr(&core.counters.writes_total);

        if input.key.profile_id().is_some() {
            core.exemplars
                .insert(&input.key, &input.val, input.start_time, input.end_time)?;
            return core.ensure_app_segment_exists(&input);
        }

        let sk = input.key.segment_key();
        for (k, v) in input.key.labels() {
            core.labels.put(k, v)?;
        }
        for (k, v) in input.key.labels() {
            let dkey = dimension_key(k, v);
            match core.dimensions.get_or_create(&dkey) {
                Ok(dim) => {
                    dim.write().insert(&sk);
                    core.dimensions.put(&dkey, dim);
                },
                Err(e) => {
                    error!(dimension = %dkey, error = %e, "dimensions cache");
                },
            }
        }

        let seg = core.segments.get_or_create(&sk)?;
        {
            let mut seg = seg.write();
            seg.set_metadata(SegmentMetadata {
                spy_name: input.spy_name.clone(),
                sample_rate: input.sample_rate,
                units: input.units,
                aggregation_type: input.aggregation_type,
            });
            let samples = input.val.samples();
            seg.put(input.start_time, input.end_time, samples, &mut |depth,
                                                                     t,
                                                                     r,
                                                                     addons| {
                let tk = key::tree_key_of(&sk, depth, t);
                let cached = match core.trees.get_or_create(&tk) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(tree = %tk, error = %e, "trees cache");
                        return;
                    },
                };
                let mut clone = input.val.clone_with_ratio(r);
                // A node settling over already-present descendants must
                // fold their finer aggregates in, or the new coarse
                // aggregate would undercount history.
                for addon in addons {
                    let ak = key::tree_key_of(&sk, addon.depth, addon.time);
                    match core.trees.lookup(&ak) {
                        Ok(Some(existing)) => clone.merge(&existing.read()),
                        Ok(None) => {},
                        Err(e) => error!(tree = %ak, error = %e, "addon lookup"),
                    }
                }
                cached.write().merge(&clone);
                core.trees.put(&tk, cached);
            })?;
        }
        core.segments.put(&sk, seg);
        Ok(())
    }

    /// Run a merge/range query. `Ok(None)` means no matching data, not
    /// a failure.
    pub async fn get(&self, input: GetInput) -> Result<Option<GetOutput>> {
        let core = &self.core;
        StorageCounters::incr(&core.counters.reads_total);

        // Individually addressed profiles bypass the segment tree.
        if let Some(key) = &input.key {
            if let Some(profile_id) = key.profile_id() {
                return core
                    .exemplar_output(key.app_name(), &[profile_id], &input)
                    .await;
            }
        }
        if let Some(query) = &input.query {
            let ids = query.profile_ids();
            if !ids.is_empty() {
                return core.exemplar_output(&query.app_name, &ids, &input).await;
            }
        }

        let dimension_keys = match (&input.key, &input.query) {
            (Some(key), _) => core.dimension_keys_by_key(key)?,
            (None, Some(query)) => core.exec_query(query)?,
            (None, None) => {
                return Err(EmberError::storage("key or query must be specified"));
            },
        };

        let mut timeline = Timeline::generate(input.start_time, input.end_time, &core.geometry);
        let mut result: Option<Tree> = None;
        let mut metadata = SegmentMetadata::default();
        let mut aggregation = AggregationType::Sum;
        let mut writes_total: u64 = 0;

        for raw in dimension_keys {
            // Cancellation point per segment.
            tokio::task::yield_now().await;
            let parsed = match key::parse_key(&raw) {
                Ok(k) => k,
                Err(e) => {
                    error!(key = %raw, error = %e, "bad segment key in dimension");
                    continue;
                },
            };
            let sk = parsed.segment_key();
            let Some(seg) = core.segments.lookup(&sk)? else {
                continue;
            };
            let seg = seg.read();
            if seg.metadata().aggregation_type == AggregationType::Average {
                aggregation = AggregationType::Average;
            }
            metadata = seg.metadata().clone();
            timeline.populate(&seg);

            seg.get(input.start_time, input.end_time, &mut |depth,
                                                            _samples,
                                                            writes,
                                                            t,
                                                            r| {
                let tk = key::tree_key_of(&sk, depth, t);
                match core.trees.lookup(&tk) {
                    Ok(Some(tree)) => {
                        let clone = tree.read().clone_with_ratio(r);
                        writes_total += writes;
                        match &mut result {
                            Some(acc) => acc.merge(&clone),
                            None => result = Some(clone),
                        }
                    },
                    Ok(None) => {},
                    Err(e) => error!(tree = %tk, error = %e, "failed to load tree"),
                }
            });
        }

        let Some(mut tree) = result else {
            return Ok(None);
        };
        if writes_total > 0 && aggregation == AggregationType::Average {
            tree = tree.clone_with_ratio(Ratio::new(1, writes_total));
        }
        Ok(Some(GetOutput {
            tree,
            timeline,
            metadata,
        }))
    }

    /// Merge individually addressed profiles, bypassing the segment
    /// tree entirely.
    pub async fn merge_profiles(
        &self,
        input: MergeProfilesInput,
    ) -> Result<Option<MergeProfilesOutput>> {
        let ids: Vec<&str> = input.profile_ids.iter().map(String::as_str).collect();
        let Some((tree, count)) = self.core.exemplars.merge(&input.app_name, &ids).await? else {
            return Ok(None);
        };
        Ok(Some(MergeProfilesOutput {
            tree,
            count,
            metadata: self.core.app_metadata(&input.app_name)?,
        }))
    }

    /// Invoke the callback with each stored exemplar of the given ids.
    pub async fn merge_exemplars(
        &self,
        app_name: &str,
        profile_ids: &[&str],
        cb: &mut dyn FnMut(ExemplarEntry) -> Result<()>,
    ) -> Result<()> {
        self.core.exemplars.fetch(app_name, profile_ids, cb).await
    }

    /// Observed label keys, for autocompletion.
    pub fn get_keys(&self, cb: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        self.core.labels.get_keys(cb)
    }

    /// Observed values of one label key. Values of the reserved name
    /// label are filtered against the application hide list.
    pub fn get_values(&self, label_key: &str, cb: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        let hidden = &self.core.config.storage.hide_applications;
        self.core.labels.get_values(label_key, &mut |v| {
            if label_key == APP_NAME_LABEL && hidden.iter().any(|h| h == v) {
                return true;
            }
            cb(v)
        })
    }

    /// All application names.
    pub fn get_app_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.get_values(APP_NAME_LABEL, &mut |v| {
            names.push(v.to_string());
            true
        })?;
        Ok(names)
    }

    /// Label keys in use by segments matching the query's application.
    pub fn get_keys_by_query(&self, raw: &str, cb: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        let query = crate::query::parse_query(raw)?;
        let app_key = key::parse_key(&Key::app_segment_key(&query.app_name))?;
        let mut found = std::collections::BTreeSet::new();
        for raw_key in self.core.dimension_keys_by_key(&app_key)? {
            let Ok(parsed) = key::parse_key(&raw_key) else {
                continue;
            };
            if parsed.app_name() != query.app_name {
                continue;
            }
            for k in parsed.labels().keys() {
                found.insert(k.clone());
            }
        }
        for k in found {
            if !cb(&k) {
                break;
            }
        }
        Ok(())
    }

    /// Values of one label across segments matching the query's
    /// application.
    pub fn get_values_by_query(
        &self,
        label_key: &str,
        raw: &str,
        cb: &mut dyn FnMut(&str) -> bool,
    ) -> Result<()> {
        let query = crate::query::parse_query(raw)?;
        let app_key = key::parse_key(&Key::app_segment_key(&query.app_name))?;
        let mut found = std::collections::BTreeSet::new();
        for raw_key in self.core.dimension_keys_by_key(&app_key)? {
            let Ok(parsed) = key::parse_key(&raw_key) else {
                continue;
            };
            if let Some(v) = parsed.labels().get(label_key) {
                found.insert(v.clone());
            }
        }
        for v in found {
            if !cb(&v) {
                break;
            }
        }
        Ok(())
    }

    /// Remove the segments matching the key's full label set, with
    /// their trees and index memberships.
    pub async fn delete(&self, key: &Key) -> Result<()> {
        let core = &self.core;
        let mut dims = Vec::new();
        for (k, v) in key.labels() {
            match core.lookup_dimension(&dimension_key(k, v))? {
                Some(d) => dims.push(d),
                None => return Ok(()),
            }
        }
        let refs: Vec<&Dimension> = dims.iter().collect();
        for sk in dimension::intersection(&refs) {
            tokio::task::yield_now().await;
            let parsed = key::parse_key(&sk)?;
            core.delete_segment_and_related_data(&parsed)?;
        }
        Ok(())
    }

    /// Remove an application wholesale: every segment, tree, dimension
    /// membership, exemplar value, and the dictionary.
    pub async fn delete_app(&self, app_name: &str) -> Result<()> {
        let core = &self.core;
        let app_dim_key = dimension_key(APP_NAME_LABEL, app_name);
        if let Some(dim) = core.lookup_dimension(&app_dim_key)? {
            for sk in dim.keys() {
                tokio::task::yield_now().await;
                let parsed = key::parse_key(sk)?;
                core.delete_segment_and_related_data(&parsed)?;
            }
        }
        // The bare app segment holds exemplar metadata and is not
        // listed in any dimension.
        core.segments.delete(&Key::app_segment_key(app_name))?;
        core.dicts.delete(app_name)?;
        core.exemplars_discard_app(app_name)?;
        core.labels.delete_value(APP_NAME_LABEL, app_name)?;
        Ok(())
    }

    /// Enforce time-based retention across every segment. Failures are
    /// logged per segment; the sweep continues.
    pub async fn delete_data_before(&self, policy: &RetentionPolicy) -> Result<()> {
        retention_sweep(&self.core, policy).await
    }

    /// Enforce the size limit by deleting the oldest trees, oldest
    /// first, the reclaim volume divided evenly across segments.
    pub fn enforce_size_based_retention(&self, policy: &RetentionPolicy) -> Result<()> {
        self.core.run_size_retention(policy)
    }

    /// Activity counters snapshot.
    pub fn stats(&self) -> CounterSnapshot {
        self.core.counters.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            segments: self.core.segments.len(),
            dimensions: self.core.dimensions.len(),
            dicts: self.core.dicts.len(),
            trees: self.core.trees.len(),
        }
    }

    /// Approximate bytes held by the KV collaborator.
    pub fn disk_usage(&self) -> u64 {
        self.core.db.approximate_size()
    }

    /// Stop maintenance, drain exemplars, and flush every cache.
    pub async fn close(&self) -> Result<()> {
        let _ = self.stop.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                // A panicking maintenance task must not take the
                // process down; it is logged and the shutdown proceeds.
                error!(error = %e, "maintenance task failed");
            }
        }
        self.core.exemplars.sync();
        self.core.dimensions.flush()?;
        self.core.segments.flush()?;
        self.core.trees.flush()?;
        // Dictionaries flush last: tree encoding writes to them.
        self.core.dicts.flush()?;
        self.core.db.flush()
    }
}

impl StorageCore {
    fn current_retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_config(&self.config.retention, &self.config.storage, Utc::now())
    }

    /// Exemplar writes keep segment metadata on the bare app segment.
    fn ensure_app_segment_exists(&self, input: &PutInput) -> Result<()> {
        let sk = Key::app_segment_key(input.key.app_name());
        let seg = self.segments.get_or_create(&sk)?;
        seg.write().set_metadata(SegmentMetadata {
            spy_name: input.spy_name.clone(),
            sample_rate: input.sample_rate,
            units: input.units,
            aggregation_type: input.aggregation_type,
        });
        self.segments.put(&sk, seg);
        Ok(())
    }

    fn app_metadata(&self, app_name: &str) -> Result<SegmentMetadata> {
        Ok(self
            .segments
            .lookup(&Key::app_segment_key(app_name))?
            .map(|seg| seg.read().metadata().clone())
            .unwrap_or_default())
    }

    async fn exemplar_output(
        &self,
        app_name: &str,
        profile_ids: &[&str],
        input: &GetInput,
    ) -> Result<Option<GetOutput>> {
        let Some((tree, _)) = self.exemplars.merge(app_name, profile_ids).await? else {
            return Ok(None);
        };
        Ok(Some(GetOutput {
            tree,
            timeline: Timeline::generate(input.start_time, input.end_time, &self.geometry),
            metadata: self.app_metadata(app_name)?,
        }))
    }

    fn lookup_dimension(&self, dkey: &str) -> Result<Option<Dimension>> {
        Ok(self.dimensions.lookup(dkey)?.map(|d| d.read().clone()))
    }

    /// Candidate segments for a direct key lookup: the app dimension
    /// intersected with the dimension of every label pair. A label pair
    /// never observed means no segment can match.
    fn dimension_keys_by_key(&self, key: &Key) -> Result<Vec<String>> {
        let Some(app_dim) =
            self.lookup_dimension(&dimension_key(APP_NAME_LABEL, key.app_name()))?
        else {
            return Ok(Vec::new());
        };
        let labels: Vec<_> = key
            .labels()
            .iter()
            .filter(|(k, _)| k.as_str() != APP_NAME_LABEL)
            .collect();
        if labels.is_empty() {
            return Ok(app_dim.keys().to_vec());
        }
        let mut dims = vec![app_dim];
        for (k, v) in labels {
            match self.lookup_dimension(&dimension_key(k, v))? {
                Some(d) => dims.push(d),
                None => return Ok(Vec::new()),
            }
        }
        let refs: Vec<&Dimension> = dims.iter().collect();
        Ok(dimension::intersection(&refs))
    }

    /// Candidate segments for a query: positive matchers narrow via
    /// intersection, negated matchers accumulate into one union that is
    /// subtracted at the end.
    fn exec_query(&self, query: &Query) -> Result<Vec<String>> {
        let Some(app_dim) =
            self.lookup_dimension(&dimension_key(APP_NAME_LABEL, &query.app_name))?
        else {
            return Ok(Vec::new());
        };
        let mut positives: Vec<Dimension> = vec![app_dim];
        let mut negatives: Vec<Dimension> = Vec::new();

        for matcher in &query.matchers {
            match matcher.op {
                MatchOp::Equal => {
                    match self.lookup_dimension(&dimension_key(&matcher.key, &matcher.value))? {
                        Some(d) => positives.push(d),
                        None => return Ok(Vec::new()),
                    }
                },
                MatchOp::EqualRegex => {
                    let d = self.dimensions_matching_regex(&matcher.key, &matcher.value)?;
                    if d.is_empty() {
                        return Ok(Vec::new());
                    }
                    positives.push(d);
                },
                MatchOp::NotEqual => {
                    if let Some(d) =
                        self.lookup_dimension(&dimension_key(&matcher.key, &matcher.value))?
                    {
                        negatives.push(d);
                    }
                },
                MatchOp::NotEqualRegex => {
                    let d = self.dimensions_matching_regex(&matcher.key, &matcher.value)?;
                    if !d.is_empty() {
                        negatives.push(d);
                    }
                },
            }
        }

        let refs: Vec<&Dimension> = positives.iter().collect();
        let positive: Dimension = dimension::intersection(&refs).into_iter().collect();
        if negatives.is_empty() {
            return Ok(positive.keys().to_vec());
        }
        let neg_refs: Vec<&Dimension> = negatives.iter().collect();
        let negative: Dimension = dimension::union(&neg_refs).into_iter().collect();
        Ok(dimension::and_not(&positive, &negative))
    }

    /// Union of the dimensions of every observed value of `key`
    /// matching the pattern.
    fn dimensions_matching_regex(&self, label_key: &str, pattern: &str) -> Result<Dimension> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| EmberError::parse(format!("invalid regex: {}", e)))?;
        let mut values = Vec::new();
        self.labels.get_values(label_key, &mut |v| {
            if re.is_match(v) {
                values.push(v.to_string());
            }
            true
        })?;
        let mut dims = Vec::new();
        for v in values {
            if let Some(d) = self.lookup_dimension(&dimension_key(label_key, &v))? {
                dims.push(d);
            }
        }
        let refs: Vec<&Dimension> = dims.iter().collect();
        Ok(dimension::union(&refs).into_iter().collect())
    }

    fn all_segment_keys(&self) -> Result<Vec<String>> {
        let mut dims = Vec::new();
        let mut apps = Vec::new();
        self.labels.get_values(APP_NAME_LABEL, &mut |v| {
            apps.push(v.to_string());
            true
        })?;
        for app in apps {
            if let Some(d) = self.lookup_dimension(&dimension_key(APP_NAME_LABEL, &app))? {
                dims.push(d);
            }
        }
        let refs: Vec<&Dimension> = dims.iter().collect();
        Ok(dimension::union(&refs))
    }

    /// Time-based retention for one segment. Tree deletion commits
    /// before stree nodes are removed, so an interrupted sweep stays
    /// idempotent.
    fn enforce_segment_retention(&self, sk: &str, policy: &RetentionPolicy) -> Result<()> {
        let Some(seg) = self.segments.lookup(sk)? else {
            return Ok(());
        };
        let mut doomed = Vec::new();
        {
            let seg = seg.read();
            seg.walk_nodes_to_delete(policy, &mut |depth, t| {
                doomed.push(key::tree_key_of(sk, depth, t));
                Ok(())
            })?;
        }
        for tk in &doomed {
            self.trees.delete(tk)?;
        }
        let removed_root = seg.write().delete_nodes_before(policy);
        self.segments.put(sk, seg);
        if removed_root {
            let parsed = key::parse_key(sk)?;
            self.delete_segment_and_related_data(&parsed)?;
        }
        Ok(())
    }

    fn delete_segment_and_related_data(&self, key: &Key) -> Result<()> {
        let sk = key.segment_key();
        self.trees.discard_prefix(&format!("{}:", sk))?;
        self.segments.delete(&sk)?;
        for (k, v) in key.labels() {
            let dkey = dimension_key(k, v);
            let Some(dim) = self.dimensions.lookup(&dkey)? else {
                continue;
            };
            let now_empty = {
                let mut d = dim.write();
                d.delete(&sk);
                d.is_empty()
            };
            if now_empty {
                self.dimensions.delete(&dkey)?;
                self.labels.delete_value(k, v)?;
            } else {
                self.dimensions.put(&dkey, dim);
            }
        }
        // The app dictionary stays while other segments of the app
        // still reference it.
        let app_dim = self.lookup_dimension(&dimension_key(APP_NAME_LABEL, key.app_name()))?;
        if app_dim.map_or(true, |d| d.is_empty()) {
            self.dicts.delete(&key.dict_key())?;
        }
        Ok(())
    }

    fn exemplars_discard_app(&self, app_name: &str) -> Result<()> {
        let prefix = format!("x:{}:", app_name);
        let ops: Vec<_> = self
            .db
            .scan_prefix(prefix.as_bytes(), 0)?
            .into_iter()
            .map(|(key, _)| kv::BatchOp::Delete { key })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        // Timestamp index entries go stale here; truncation tolerates
        // missing data keys and removes them on its next pass.
        self.db.write_batch(ops)
    }

    fn run_size_retention(&self, policy: &RetentionPolicy) -> Result<()> {
        let used = self.db.approximate_size();
        let reclaim = policy.capacity_to_reclaim(used);
        if reclaim == 0 {
            return Ok(());
        }
        let segment_keys = self.all_segment_keys()?;
        if segment_keys.is_empty() {
            return Ok(());
        }
        let share = (reclaim / segment_keys.len() as u64).max(1);
        info!(used, reclaim, segments = segment_keys.len(), "size-based retention");
        for sk in &segment_keys {
            if let Err(e) = self.trees.reclaim_prefix(&format!("{}:", sk), share) {
                error!(segment = %sk, error = %e, "size-based reclaim failed for segment");
            }
        }
        Ok(())
    }

    fn run_write_back_pass(&self) {
        // Trees before dictionaries: encoding trees interns new frame
        // names, and those must persist in the same pass.
        for (name, result) in [
            ("dimensions", self.dimensions.write_back()),
            ("segments", self.segments.write_back()),
            ("trees", self.trees.write_back()),
            ("dicts", self.dicts.write_back()),
        ] {
            match result {
                Ok(expired) if expired > 0 => {
                    debug!(cache = name, expired, "write-back expired idle entries");
                },
                Ok(_) => {},
                Err(e) => error!(cache = name, error = %e, "write-back failed"),
            }
        }
    }

    fn run_eviction_pass(&self) {
        let max_entries = self.config.storage.cache_max_entries;
        if self.trees.len() <= max_entries {
            return;
        }
        match self.trees.evict(self.config.storage.cache_evict_fraction) {
            Ok(evicted) => {
                StorageCounters::add(&self.counters.evictions_total, evicted as u64);
                debug!(evicted, "evicted cached trees");
            },
            Err(e) => error!(error = %e, "tree cache eviction failed"),
        }
    }
}

async fn run_eviction_task(core: Arc<StorageCore>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.storage.eviction_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {
                let _guard = core.maintenance_lock.lock().await;
                core.run_eviction_pass();
            },
        }
    }
}

async fn run_write_back_task(core: Arc<StorageCore>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.storage.write_back_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {
                let _guard = core.maintenance_lock.lock().await;
                core.run_write_back_pass();
            },
        }
    }
}

async fn run_exemplars_flush_task(core: Arc<StorageCore>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.exemplars.batch_flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => {
                core.exemplars.sync();
                return;
            },
            _ = ticker.tick() => {
                core.exemplars.flush_current_batch();
                while core.exemplars.flush_next_queued() {}
            },
        }
    }
}

async fn run_retention_task(core: Arc<StorageCore>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.storage.retention_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {
                let _guard = core.maintenance_lock.lock().await;
                let policy = core.current_retention_policy();
                if policy.is_time_based() {
                    if let Err(e) = retention_sweep(&core, &policy).await {
                        error!(error = %e, "retention sweep failed");
                    }
                }
                if policy.exemplars_time() > DateTime::UNIX_EPOCH {
                    if let Err(e) = core.exemplars.truncate_before(policy.exemplars_time()).await {
                        error!(error = %e, "exemplars truncation failed");
                    }
                }
                if policy.size_limit() > 0 {
                    if let Err(e) = core.run_size_retention(&policy) {
                        error!(error = %e, "size-based retention failed");
                    }
                }
            },
        }
    }
}

/// The sweep body shared by the task and [`Storage::delete_data_before`].
async fn retention_sweep(core: &Arc<StorageCore>, policy: &RetentionPolicy) -> Result<()> {
    let mut apps = Vec::new();
    core.labels.get_values(APP_NAME_LABEL, &mut |v| {
        apps.push(v.to_string());
        true
    })?;
    for app in apps {
        let Some(dim) = core.lookup_dimension(&dimension_key(APP_NAME_LABEL, &app))? else {
            continue;
        };
        for sk in dim.keys() {
            tokio::task::yield_now().await;
            if let Err(e) = core.enforce_segment_retention(sk, policy) {
                error!(segment = %sk, error = %e, "retention sweep failed for segment");
            }
        }
    }
    StorageCounters::incr(&core.counters.retention_sweeps);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn storage() -> Storage {
        Storage::new(Config::default(), Arc::new(MemoryKv::new())).unwrap()
    }

    fn tree_of(stacks: &[(&str, u64)]) -> Tree {
        let mut tree = Tree::new();
        for (stack, value) in stacks {
            tree.insert(stack.as_bytes(), *value);
        }
        tree
    }

    fn put_input(raw_key: &str, st: i64, et: i64, val: Tree) -> PutInput {
        PutInput {
            start_time: t(st),
            end_time: t(et),
            key: parse_key(raw_key).unwrap(),
            val,
            spy_name: "testspy".into(),
            sample_rate: 100,
            units: Units::Samples,
            aggregation_type: AggregationType::Sum,
        }
    }

    fn get_by_key(raw_key: &str, st: i64, et: i64) -> GetInput {
        GetInput {
            start_time: t(st),
            end_time: t(et),
            key: Some(parse_key(raw_key).unwrap()),
            query: None,
        }
    }

    fn get_by_query(raw: &str, st: i64, et: i64) -> GetInput {
        GetInput {
            start_time: t(st),
            end_time: t(et),
            key: None,
            query: Some(crate::query::parse_query(raw).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let s = storage();
        let original = tree_of(&[("a;b", 1), ("a;c", 2)]);
        s.put(put_input("app.cpu{foo=bar}", 10, 19, original.clone()))
            .await
            .unwrap();

        // A fully containing read must reproduce the input exactly.
        let out = s.get(get_by_key("app.cpu{foo=bar}", 0, 30)).await.unwrap().unwrap();
        assert_eq!(out.tree.to_string(), original.to_string());
        assert_eq!(out.metadata.spy_name, "testspy");
        assert_eq!(out.timeline.samples, vec![0, 3, 0]);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_without_data_is_none() {
        let s = storage();
        assert!(s.get(get_by_key("ghost.app", 0, 30)).await.unwrap().is_none());
        assert!(s
            .get(get_by_query(r#"ghost.app{foo="bar"}"#, 0, 30))
            .await
            .unwrap()
            .is_none());
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_requires_key_or_query() {
        let s = storage();
        let input = GetInput {
            start_time: t(0),
            end_time: t(30),
            key: None,
            query: None,
        };
        assert!(s.get(input).await.is_err());
        s.close().await.unwrap();
    }

    async fn put_three_segments(s: &Storage) {
        s.put(put_input("app{foo=bar,baz=qux}", 10, 19, tree_of(&[("first", 1)])))
            .await
            .unwrap();
        s.put(put_input("app{foo=bar,baz=xxx}", 10, 19, tree_of(&[("second", 1)])))
            .await
            .unwrap();
        s.put(put_input("app{waldo=fred,baz=xxx}", 10, 19, tree_of(&[("third", 1)])))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_query_equality_intersection() {
        let s = storage();
        put_three_segments(&s).await;

        let out = s
            .get(get_by_query(r#"app{foo="bar",baz="qux"}"#, 0, 30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.tree.to_string(), "first 1\n");

        // A matcher naming an unobserved pair short-circuits to none.
        assert!(s
            .get(get_by_query(r#"app{foo="nope"}"#, 0, 30))
            .await
            .unwrap()
            .is_none());
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_negated_matcher() {
        let s = storage();
        put_three_segments(&s).await;

        let out = s
            .get(get_by_query(r#"app{baz!="xxx"}"#, 0, 30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.tree.to_string(), "first 1\n");
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_regex_matchers() {
        let s = storage();
        put_three_segments(&s).await;

        let out = s
            .get(get_by_query(r#"app{baz=~"xx"}"#, 0, 30))
            .await
            .unwrap()
            .unwrap();
        let rendered = out.tree.to_string();
        assert!(rendered.contains("second 1"));
        assert!(rendered.contains("third 1"));
        assert!(!rendered.contains("first"));

        let out = s
            .get(get_by_query(r#"app{baz!~"xx"}"#, 0, 30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.tree.to_string(), "first 1\n");
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_profiles() {
        let s = storage();
        let sample = tree_of(&[("a;b", 1), ("a;c", 2)]);

        // A plain write creates the app segment carrying metadata.
        s.put(put_input("app.cpu", 10, 19, sample.clone())).await.unwrap();
        s.put(put_input("app.cpu{profile_id=a}", 10, 19, sample.clone()))
            .await
            .unwrap();
        s.put(put_input("app.cpu{profile_id=a}", 10, 19, sample.clone()))
            .await
            .unwrap();
        s.put(put_input("app.cpu{profile_id=b}", 10, 19, sample.clone()))
            .await
            .unwrap();
        s.core.exemplars.sync();

        let o = s
            .merge_profiles(MergeProfilesInput {
                app_name: "app.cpu".into(),
                profile_ids: vec!["a".into()],
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(o.tree.samples(), 6);

        let o = s
            .merge_profiles(MergeProfilesInput {
                app_name: "app.cpu".into(),
                profile_ids: vec!["b".into()],
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(o.tree.samples(), 3);

        let o = s
            .merge_profiles(MergeProfilesInput {
                app_name: "app.cpu".into(),
                profile_ids: vec!["a".into(), "b".into()],
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(o.tree.samples(), 9);
        assert_eq!(o.count, 2);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exemplar_query_bypass() {
        let s = storage();
        let sample = tree_of(&[("a;b", 1), ("a;c", 2)]);
        s.put(put_input("app.cpu{profile_id=my-profile-id,span_name=x}", 10, 19, sample.clone()))
            .await
            .unwrap();
        // Sets the app segment metadata the bypass reports.
        let mut plain = put_input("app.cpu", 10, 19, sample);
        plain.spy_name = "debugspy".into();
        plain.sample_rate = 42;
        plain.units = Units::Bytes;
        plain.aggregation_type = AggregationType::Average;
        s.put(plain).await.unwrap();
        s.core.exemplars.sync();

        let out = s
            .get(get_by_query(r#"app.cpu{profile_id="my-profile-id"}"#, 0, 30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.tree.samples(), 3);
        assert_eq!(out.metadata.spy_name, "debugspy");
        assert_eq!(out.metadata.sample_rate, 42);
        assert_eq!(out.metadata.units, Units::Bytes);
        assert_eq!(out.metadata.aggregation_type, AggregationType::Average);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_enforcement() {
        let s = storage();
        s.put(put_input("app.cpu", 10, 19, tree_of(&[("old", 1)])))
            .await
            .unwrap();
        s.put(put_input("app.cpu", 20, 29, tree_of(&[("new", 1)])))
            .await
            .unwrap();

        let policy = RetentionPolicy::new().with_absolute_time(t(20));
        s.delete_data_before(&policy).await.unwrap();

        // Only samples recorded at or after the boundary survive.
        let out = s.get(get_by_key("app.cpu", 0, 30)).await.unwrap().unwrap();
        assert_eq!(out.tree.to_string(), "new 1\n");

        // The stale bucket's aggregate is gone from cache and store.
        assert!(s.core.trees.lookup("app.cpu{}:0:10").unwrap().is_none());
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_deletes_whole_segment() {
        let s = storage();
        s.put(put_input("app.cpu{foo=bar}", 10, 19, tree_of(&[("x", 1)])))
            .await
            .unwrap();

        let policy = RetentionPolicy::new().with_absolute_time(t(1_000));
        s.delete_data_before(&policy).await.unwrap();

        assert!(s.get(get_by_key("app.cpu{foo=bar}", 0, 2_000)).await.unwrap().is_none());
        assert!(s.core.segments.lookup("app.cpu{foo=bar}").unwrap().is_none());
        assert!(s.core.dimensions.lookup("foo:bar").unwrap().is_none());
        // Last segment of the app: the dictionary goes too.
        assert!(s.core.dicts.lookup("app.cpu").unwrap().is_none());
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_rejected_by_retention_window() {
        let mut config = Config::default();
        config.retention.max_age = std::time::Duration::from_secs(3600);
        let s = Storage::new(config, Arc::new(MemoryKv::new())).unwrap();

        let err = s
            .put(put_input("app.cpu", 10, 19, tree_of(&[("x", 1)])))
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::Retention));
        assert_eq!(s.stats().writes_rejected, 1);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_rejected_when_out_of_space() {
        let mut config = Config::default();
        config.storage.size_limit = 8;
        let kv = Arc::new(MemoryKv::new());
        kv.set(b"seed", b"0123456789abcdef").unwrap();
        let s = Storage::new(config, kv).unwrap();

        let err = s
            .put(put_input("app.cpu", 10, 19, tree_of(&[("x", 1)])))
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::OutOfSpace));
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_average_aggregation_divides_by_writes() {
        let s = storage();
        for _ in 0..2 {
            let mut input = put_input("app.alloc", 10, 19, tree_of(&[("a;b", 4), ("a;c", 8)]));
            input.aggregation_type = AggregationType::Average;
            input.units = Units::Objects;
            s.put(input).await.unwrap();
        }

        let out = s.get(get_by_key("app.alloc", 0, 30)).await.unwrap().unwrap();
        // Two writes merged into the bucket, divided back out on read.
        assert_eq!(out.tree.to_string(), "a;b 4\na;c 8\n");
        assert_eq!(out.metadata.aggregation_type, AggregationType::Average);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_key() {
        let s = storage();
        put_three_segments(&s).await;

        s.delete(&parse_key("app{foo=bar,baz=qux}").unwrap()).await.unwrap();

        assert!(s
            .get(get_by_query(r#"app{baz="qux"}"#, 0, 30))
            .await
            .unwrap()
            .is_none());
        // The sibling segments survive.
        let out = s.get(get_by_key("app", 0, 30)).await.unwrap().unwrap();
        assert!(out.tree.to_string().contains("second 1"));
        assert!(out.tree.to_string().contains("third 1"));
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_app() {
        let s = storage();
        put_three_segments(&s).await;
        s.put(put_input("other.app", 10, 19, tree_of(&[("keep", 1)])))
            .await
            .unwrap();

        s.delete_app("app").await.unwrap();

        assert!(s.get(get_by_key("app", 0, 30)).await.unwrap().is_none());
        assert_eq!(s.get_app_names().unwrap(), vec!["other.app"]);
        let out = s.get(get_by_key("other.app", 0, 30)).await.unwrap().unwrap();
        assert_eq!(out.tree.to_string(), "keep 1\n");
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_label_enumeration() {
        let s = storage();
        put_three_segments(&s).await;

        let mut keys = Vec::new();
        s.get_keys(&mut |k| {
            keys.push(k.to_string());
            true
        })
        .unwrap();
        assert_eq!(keys, vec!["__name__", "baz", "foo", "waldo"]);

        let mut values = Vec::new();
        s.get_values("baz", &mut |v| {
            values.push(v.to_string());
            true
        })
        .unwrap();
        assert_eq!(values, vec!["qux", "xxx"]);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_label_enumeration_by_query() {
        let s = storage();
        put_three_segments(&s).await;
        s.put(put_input("other.app{zone=a}", 10, 19, tree_of(&[("x", 1)])))
            .await
            .unwrap();

        let mut keys = Vec::new();
        s.get_keys_by_query("app{}", &mut |k| {
            keys.push(k.to_string());
            true
        })
        .unwrap();
        assert_eq!(keys, vec!["__name__", "baz", "foo", "waldo"]);

        let mut values = Vec::new();
        s.get_values_by_query("baz", "app{}", &mut |v| {
            values.push(v.to_string());
            true
        })
        .unwrap();
        assert_eq!(values, vec!["qux", "xxx"]);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_hidden_applications() {
        let mut config = Config::default();
        config.storage.hide_applications = vec!["hidden.app".into()];
        let s = Storage::new(config, Arc::new(MemoryKv::new())).unwrap();

        s.put(put_input("hidden.app", 10, 19, tree_of(&[("x", 1)])))
            .await
            .unwrap();
        s.put(put_input("visible.app", 10, 19, tree_of(&[("x", 1)])))
            .await
            .unwrap();

        assert_eq!(s.get_app_names().unwrap(), vec!["visible.app"]);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_size_based_retention_reclaims_trees() {
        let s = storage();
        let base = 1_000_000_000;
        for i in 0..3 {
            s.put(put_input(
                "app.cpu",
                base + i * 10,
                base + i * 10 + 9,
                tree_of(&[("a;b", 1), ("a;c", 2)]),
            ))
            .await
            .unwrap();
        }
        // Trees must be on disk before size enforcement can see them.
        s.core.run_write_back_pass();
        assert!(s.disk_usage() > 0);

        let policy = RetentionPolicy::new().with_size_limit(1, 0.0);
        s.enforce_size_based_retention(&policy).unwrap();

        let remaining = s.core.db.scan_prefix(b"t:", 0).unwrap();
        assert!(remaining.is_empty());
        assert!(s.get(get_by_key("app.cpu", base - 10, base + 40)).await.unwrap().is_none());
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_survives_write_back_and_cache_drop() {
        let s = storage();
        let original = tree_of(&[("main;work", 5), ("main;idle", 1)]);
        s.put(put_input("app.cpu{host=a}", 10, 19, original.clone()))
            .await
            .unwrap();

        // Persist everything and drop it from the caches, then read
        // through from the store.
        s.core.run_write_back_pass();
        s.core.trees.evict(1.0).unwrap();
        s.core.segments.evict(1.0).unwrap();
        s.core.dimensions.evict(1.0).unwrap();
        s.core.dicts.evict(1.0).unwrap();

        let out = s.get(get_by_key("app.cpu{host=a}", 0, 30)).await.unwrap().unwrap();
        assert_eq!(out.tree.to_string(), original.to_string());
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let s = storage();
        s.put(put_input("app.cpu", 10, 19, tree_of(&[("x", 1)])))
            .await
            .unwrap();
        let _ = s.get(get_by_key("app.cpu", 0, 30)).await.unwrap();

        let stats = s.stats();
        assert_eq!(stats.writes_total, 1);
        assert_eq!(stats.reads_total, 1);
        assert!(s.cache_stats().segments >= 1);
        s.close().await.unwrap();
    }
}

//! Storage for individually addressable profiles.
//!
//! A write whose key carries a `profile_id` label bypasses the segment
//! tree: its tree is merged into a single entry keyed by
//! `(app, profile_id)`. Entries accumulate in a bounded batch queue and
//! are flushed by a background task; a timestamp-ordered secondary
//! index makes range truncation cheap.

use crate::core::{EmberError, ExemplarsConfig, Result, StorageCounters};
use crate::storage::cache::Cache;
use crate::storage::dict::Dictionary;
use crate::storage::key::{Key, APP_NAME_LABEL, PROFILE_ID_LABEL};
use crate::storage::kv::{BatchOp, KvStore};
use crate::storage::tree::Tree;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error};

/// Exemplar value keyspace: `x:<app>:<profile-id>`.
const DATA_PREFIX: &str = "x:";
/// Timestamp index keyspace: `xt:<end-nanos>:<app>:<profile-id>`.
const TIMESTAMP_PREFIX: &str = "xt:";

const EXEMPLAR_FORMAT_V1: u8 = 1;

/// One stored exemplar.
#[derive(Debug, Clone)]
pub struct ExemplarEntry {
    pub app_name: String,
    pub profile_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Label set minus the app name and profile id, which are already
    /// part of the key.
    pub labels: BTreeMap<String, String>,
    pub tree: Tree,
}

impl ExemplarEntry {
    fn merge(&mut self, other: &ExemplarEntry) {
        self.tree.merge(&other.tree);
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
    }

    fn serialize(&self, dict: &mut Dictionary, max_nodes: usize) -> Vec<u8> {
        let mut out = vec![EXEMPLAR_FORMAT_V1];
        out.extend_from_slice(&self.tree.serialize(dict, max_nodes));
        let trailer = (
            self.start_time.timestamp_nanos_opt().unwrap_or(0),
            self.end_time.timestamp_nanos_opt().unwrap_or(0),
            &self.labels,
        );
        out.extend_from_slice(&bincode::serialize(&trailer).unwrap_or_default());
        out
    }

    fn deserialize(
        dict: &Dictionary,
        app_name: &str,
        profile_id: &str,
        bytes: &[u8],
    ) -> Result<Self> {
        let mut buf = bytes;
        let Some((&version, rest)) = buf.split_first() else {
            return Err(EmberError::decode("exemplar: empty input"));
        };
        if version != EXEMPLAR_FORMAT_V1 {
            return Err(EmberError::Decode {
                message: format!("exemplar: unknown format version {}", version),
            });
        }
        buf = rest;
        let tree = Tree::deserialize_consume(dict, &mut buf)?;
        let (start_nanos, end_nanos, labels): (i64, i64, BTreeMap<String, String>) =
            bincode::deserialize(buf)
                .map_err(|e| EmberError::decode(format!("exemplar trailer: {}", e)))?;
        Ok(Self {
            app_name: app_name.to_string(),
            profile_id: profile_id.to_string(),
            start_time: DateTime::from_timestamp_nanos(start_nanos),
            end_time: DateTime::from_timestamp_nanos(end_nanos),
            labels,
            tree,
        })
    }
}

fn data_key(app_name: &str, profile_id: &str) -> String {
    format!("{}{}:{}", DATA_PREFIX, app_name, profile_id)
}

/// Zero-padded nanos keep the index in chronological = lexicographic
/// order.
fn timestamp_key(end_time: DateTime<Utc>, app_name: &str, profile_id: &str) -> String {
    format!(
        "{}{:020}:{}:{}",
        TIMESTAMP_PREFIX,
        end_time.timestamp_nanos_opt().unwrap_or(0),
        app_name,
        profile_id
    )
}

/// Split a timestamp index key into `(end-nanos, data key)`.
fn parse_timestamp_key(key: &[u8]) -> Option<(i64, String)> {
    let key = std::str::from_utf8(key).ok()?;
    let rest = key.strip_prefix(TIMESTAMP_PREFIX)?;
    let (ts, id) = rest.split_once(':')?;
    let nanos: i64 = ts.parse().ok()?;
    Some((nanos, format!("{}{}", DATA_PREFIX, id)))
}

#[derive(Default)]
struct ExemplarsBatch {
    entries: HashMap<String, ExemplarEntry>,
}

/// The exemplar store shared between the ingestion path and the flush
/// task.
pub struct Exemplars {
    config: ExemplarsConfig,
    db: Arc<dyn KvStore>,
    dicts: Arc<Cache<Dictionary>>,
    counters: Arc<StorageCounters>,
    current: Mutex<ExemplarsBatch>,
    queue: Mutex<VecDeque<ExemplarsBatch>>,
}

impl Exemplars {
    pub fn new(
        config: ExemplarsConfig,
        db: Arc<dyn KvStore>,
        dicts: Arc<Cache<Dictionary>>,
        counters: Arc<StorageCounters>,
    ) -> Self {
        Self {
            config,
            db,
            dicts,
            counters,
            current: Mutex::new(ExemplarsBatch::default()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Buffer one exemplar write. The key must carry `profile_id`.
    pub fn insert(
        &self,
        key: &Key,
        tree: &Tree,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        if tree.samples() == 0 {
            return Ok(());
        }
        let Some(profile_id) = key.profile_id() else {
            return Err(EmberError::storage("profile id label required"));
        };
        let app_name = key.app_name();
        let entry_key = data_key(app_name, profile_id);

        let mut current = self.current.lock();
        if current.entries.len() >= self.config.batch_size {
            let full = std::mem::take(&mut *current);
            self.enqueue(full);
        }
        match current.entries.get_mut(&entry_key) {
            Some(existing) => {
                existing.tree.merge(tree);
                existing.end_time = existing.end_time.max(end_time);
            },
            None => {
                let mut labels = key.labels().clone();
                labels.remove(APP_NAME_LABEL);
                labels.remove(PROFILE_ID_LABEL);
                current.entries.insert(
                    entry_key,
                    ExemplarEntry {
                        app_name: app_name.to_string(),
                        profile_id: profile_id.to_string(),
                        start_time,
                        end_time,
                        labels,
                        tree: tree.clone(),
                    },
                );
            },
        }
        Ok(())
    }

    fn enqueue(&self, batch: ExemplarsBatch) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.batch_queue_size {
            StorageCounters::add(
                &self.counters.exemplars_discarded,
                batch.entries.len() as u64,
            );
            return;
        }
        queue.push_back(batch);
    }

    /// Queue the current batch for flushing if it holds anything.
    pub fn flush_current_batch(&self) {
        let mut current = self.current.lock();
        if current.entries.is_empty() {
            return;
        }
        let full = std::mem::take(&mut *current);
        drop(current);
        self.enqueue(full);
    }

    /// Flush one queued batch; returns false once the queue is empty.
    pub fn flush_next_queued(&self) -> bool {
        let Some(batch) = self.queue.lock().pop_front() else {
            return false;
        };
        if let Err(e) = self.flush_batch(batch) {
            error!(error = %e, "failed to write exemplars batch");
        }
        true
    }

    /// Synchronously drain everything buffered. Shutdown and test
    /// barrier.
    pub fn sync(&self) {
        self.flush_current_batch();
        while self.flush_next_queued() {}
    }

    fn flush_batch(&self, batch: ExemplarsBatch) -> Result<()> {
        if batch.entries.is_empty() {
            return Ok(());
        }
        debug!(entries = batch.entries.len(), "flushing exemplars batch");
        let mut ops = Vec::with_capacity(batch.entries.len() * 2);
        let written = batch.entries.len() as u64;
        for (entry_key, mut entry) in batch.entries {
            // Merge with the stored entry, if any, so a profile written
            // across batches stays a single addressable value.
            if let Some(stored) = self.db.get(entry_key.as_bytes())? {
                let dict = self.dicts.get_or_create(&entry.app_name)?;
                let existing = {
                    let dict = dict.read();
                    ExemplarEntry::deserialize(
                        &dict,
                        &entry.app_name,
                        &entry.profile_id,
                        &stored,
                    )?
                };
                entry.merge(&existing);
            }

            let dict = self.dicts.get_or_create(&entry.app_name)?;
            let bytes = {
                let mut dict = dict.write();
                entry.serialize(&mut dict, self.config.max_nodes)
            };
            self.dicts.put(&entry.app_name, dict);

            ops.push(BatchOp::Set {
                key: timestamp_key(entry.end_time, &entry.app_name, &entry.profile_id)
                    .into_bytes(),
                value: Vec::new(),
            });
            ops.push(BatchOp::Set {
                key: entry_key.into_bytes(),
                value: bytes,
            });
        }
        self.db.write_batch(ops)?;
        StorageCounters::add(&self.counters.exemplars_written, written);
        Ok(())
    }

    /// Invoke the callback with each requested profile. Missing ids are
    /// skipped, not an error.
    pub async fn fetch(
        &self,
        app_name: &str,
        profile_ids: &[&str],
        cb: &mut dyn FnMut(ExemplarEntry) -> Result<()>,
    ) -> Result<()> {
        let Some(dict) = self.dicts.lookup(app_name)? else {
            return Ok(());
        };
        for profile_id in profile_ids {
            // Cancellation point per profile id.
            tokio::task::yield_now().await;
            let Some(bytes) = self.db.get(data_key(app_name, profile_id).as_bytes())? else {
                continue;
            };
            let entry = {
                let dict = dict.read();
                ExemplarEntry::deserialize(&dict, app_name, profile_id, &bytes)?
            };
            cb(entry)?;
        }
        Ok(())
    }

    /// Merge the requested profiles into one tree. `None` when nothing
    /// matched.
    pub async fn merge(
        &self,
        app_name: &str,
        profile_ids: &[&str],
    ) -> Result<Option<(Tree, u64)>> {
        let mut merged: Option<Tree> = None;
        let mut count = 0u64;
        self.fetch(app_name, profile_ids, &mut |entry| {
            count += 1;
            match &mut merged {
                Some(t) => t.merge(&entry.tree),
                None => merged = Some(entry.tree),
            }
            Ok(())
        })
        .await?;
        Ok(merged.map(|t| (t, count)))
    }

    /// Delete every exemplar whose end time precedes the cutoff, in
    /// bounded batches. Idempotent and resumable: progress is visible
    /// in the store after every batch, and the future may be dropped
    /// between batches.
    pub async fn truncate_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_nanos = cutoff.timestamp_nanos_opt().unwrap_or(0);
        let mut removed = 0u64;
        loop {
            // Anything still buffered must reach the store first, or a
            // stale entry could be resurrected by a later flush.
            self.sync();

            let scanned = self
                .db
                .scan_prefix(TIMESTAMP_PREFIX.as_bytes(), self.config.truncation_batch_size)?;
            let mut done = scanned.len() < self.config.truncation_batch_size;
            let mut ops = Vec::new();
            for (key, _) in &scanned {
                match parse_timestamp_key(key) {
                    None => {
                        // A malformed index entry must not wedge the
                        // sweep; drop it and move on.
                        ops.push(BatchOp::Delete { key: key.clone() });
                    },
                    Some((nanos, data)) => {
                        if nanos > cutoff_nanos {
                            done = true;
                            break;
                        }
                        ops.push(BatchOp::Delete { key: key.clone() });
                        ops.push(BatchOp::Delete {
                            key: data.into_bytes(),
                        });
                        removed += 1;
                    },
                }
            }
            if !ops.is_empty() {
                self.db.write_batch(ops)?;
            }
            if done {
                break;
            }
            // Cancellation point per batch.
            tokio::task::yield_now().await;
        }
        StorageCounters::add(&self.counters.exemplars_removed, removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::BincodeCodec;
    use crate::storage::key::parse_key;
    use crate::storage::kv::MemoryKv;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn exemplars() -> Exemplars {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let dicts = Arc::new(Cache::new(
            Arc::clone(&kv),
            Box::new(BincodeCodec),
            "d:",
            std::time::Duration::from_secs(60),
        ));
        Exemplars::new(
            ExemplarsConfig::default(),
            kv,
            dicts,
            Arc::new(StorageCounters::default()),
        )
    }

    fn sample_tree() -> Tree {
        let mut tree = Tree::new();
        tree.insert(b"a;b", 1);
        tree.insert(b"a;c", 2);
        tree
    }

    #[tokio::test]
    async fn test_insert_merges_same_profile() {
        let e = exemplars();
        let key = parse_key("app.cpu{profile_id=a}").unwrap();
        e.insert(&key, &sample_tree(), t(10), t(19)).unwrap();
        e.insert(&key, &sample_tree(), t(10), t(19)).unwrap();
        let key_b = parse_key("app.cpu{profile_id=b}").unwrap();
        e.insert(&key_b, &sample_tree(), t(10), t(19)).unwrap();
        e.sync();

        let (tree, count) = e.merge("app.cpu", &["a"]).await.unwrap().unwrap();
        assert_eq!(tree.samples(), 6);
        assert_eq!(count, 1);

        let (tree, _) = e.merge("app.cpu", &["b"]).await.unwrap().unwrap();
        assert_eq!(tree.samples(), 3);

        let (tree, count) = e.merge("app.cpu", &["a", "b"]).await.unwrap().unwrap();
        assert_eq!(tree.samples(), 9);
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_merge_across_flushes() {
        let e = exemplars();
        let key = parse_key("app.cpu{profile_id=a}").unwrap();
        e.insert(&key, &sample_tree(), t(10), t(19)).unwrap();
        e.sync();
        e.insert(&key, &sample_tree(), t(20), t(29)).unwrap();
        e.sync();

        let mut fetched = Vec::new();
        e.fetch("app.cpu", &["a"], &mut |entry| {
            fetched.push(entry);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].tree.samples(), 6);
        assert_eq!(fetched[0].start_time, t(10));
        assert_eq!(fetched[0].end_time, t(29));
    }

    #[tokio::test]
    async fn test_fetch_skips_missing_ids() {
        let e = exemplars();
        let key = parse_key("app.cpu{profile_id=a}").unwrap();
        e.insert(&key, &sample_tree(), t(10), t(19)).unwrap();
        e.sync();

        let (tree, count) = e.merge("app.cpu", &["a", "ghost"]).await.unwrap().unwrap();
        assert_eq!(count, 1);
        assert_eq!(tree.samples(), 3);

        assert!(e.merge("app.cpu", &["ghost"]).await.unwrap().is_none());
        assert!(e.merge("unknown.app", &["a"]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_labels_stripped_of_reserved() {
        let e = exemplars();
        let key = parse_key("app.cpu{profile_id=a,region=eu}").unwrap();
        e.insert(&key, &sample_tree(), t(10), t(19)).unwrap();
        e.sync();

        let mut fetched = Vec::new();
        e.fetch("app.cpu", &["a"], &mut |entry| {
            fetched.push(entry);
            Ok(())
        })
        .await
        .unwrap();
        let labels = &fetched[0].labels;
        assert_eq!(labels.get("region").map(String::as_str), Some("eu"));
        assert!(!labels.contains_key(APP_NAME_LABEL));
        assert!(!labels.contains_key(PROFILE_ID_LABEL));
    }

    #[tokio::test]
    async fn test_truncate_before() {
        let e = exemplars();
        let old = parse_key("app.cpu{profile_id=old}").unwrap();
        let new = parse_key("app.cpu{profile_id=new}").unwrap();
        e.insert(&old, &sample_tree(), t(10), t(19)).unwrap();
        e.insert(&new, &sample_tree(), t(100), t(109)).unwrap();
        e.sync();

        let removed = e.truncate_before(t(50)).await.unwrap();
        assert_eq!(removed, 1);

        assert!(e.merge("app.cpu", &["old"]).await.unwrap().is_none());
        assert!(e.merge("app.cpu", &["new"]).await.unwrap().is_some());

        // Idempotent: nothing left below the cutoff.
        assert_eq!(e.truncate_before(t(50)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_without_profile_id_is_rejected() {
        let e = exemplars();
        let key = parse_key("app.cpu{}").unwrap();
        assert!(e.insert(&key, &sample_tree(), t(10), t(19)).is_err());
    }

    #[tokio::test]
    async fn test_empty_tree_is_ignored() {
        let e = exemplars();
        let key = parse_key("app.cpu{profile_id=a}").unwrap();
        e.insert(&key, &Tree::new(), t(10), t(19)).unwrap();
        e.sync();
        assert!(e.merge("app.cpu", &["a"]).await.unwrap().is_none());
    }
}

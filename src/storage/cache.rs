//! Write-back cache in front of one KV keyspace.
//!
//! Each entity kind (segments, dimensions, dictionaries, trees) gets
//! its own statically-typed cache instance over its own key prefix.
//! Entries are shared as `Arc<RwLock<V>>`; the cache is their sole
//! owner, with eviction and write-back moving them to and from the
//! store.

use crate::core::Result;
use crate::storage::kv::{BatchOp, KvStore};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Serialization strategy for one cached entity kind. `key` is the
/// logical (unprefixed) key; codecs may derive context from it, as the
/// tree codec does for the per-app dictionary.
pub trait Codec<V>: Send + Sync {
    fn encode(&self, key: &str, value: &V) -> Result<Vec<u8>>;
    fn decode(&self, key: &str, bytes: &[u8]) -> Result<V>;
    /// A fresh value for a full cache miss in `get_or_create`.
    fn new_value(&self, key: &str) -> V;
}

/// Plain bincode codec for kinds without serialization context.
pub struct BincodeCodec;

impl<V> Codec<V> for BincodeCodec
where
    V: serde::Serialize + serde::de::DeserializeOwned + Default,
{
    fn encode(&self, _key: &str, value: &V) -> Result<Vec<u8>> {
        bincode::serialize(value)
            .map_err(|e| crate::core::EmberError::decode(format!("encode: {}", e)))
    }

    fn decode(&self, _key: &str, bytes: &[u8]) -> Result<V> {
        bincode::deserialize(bytes)
            .map_err(|e| crate::core::EmberError::decode(format!("decode: {}", e)))
    }

    fn new_value(&self, _key: &str) -> V {
        V::default()
    }
}

struct CacheEntry<V> {
    value: Arc<RwLock<V>>,
    dirty: bool,
    last_access: Instant,
}

/// Write-back cache keyed by string over one KV prefix.
pub struct Cache<V> {
    db: Arc<dyn KvStore>,
    codec: Box<dyn Codec<V>>,
    prefix: &'static str,
    ttl: Duration,
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
}

impl<V> Cache<V> {
    pub fn new(
        db: Arc<dyn KvStore>,
        codec: Box<dyn Codec<V>>,
        prefix: &'static str,
        ttl: Duration,
    ) -> Self {
        Self {
            db,
            codec,
            prefix,
            ttl,
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    fn db_key(&self, key: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(self.prefix.as_bytes());
        out.extend_from_slice(key.as_bytes());
        out
    }

    /// Fetch an entry, reading through to the store on a miss. `None`
    /// means the key exists nowhere; a decode failure is a hard error.
    pub fn lookup(&self, key: &str) -> Result<Option<Arc<RwLock<V>>>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.last_access = Instant::now();
            return Ok(Some(Arc::clone(&entry.value)));
        }
        let Some(bytes) = self.db.get(&self.db_key(key))? else {
            return Ok(None);
        };
        let value = Arc::new(RwLock::new(self.codec.decode(key, &bytes)?));
        entries.put(
            key.to_string(),
            CacheEntry {
                value: Arc::clone(&value),
                dirty: false,
                last_access: Instant::now(),
            },
        );
        Ok(Some(value))
    }

    /// Persist an entry on its next write-back.
    pub fn put(&self, key: &str, value: Arc<RwLock<V>>) {
        let mut entries = self.entries.lock();
        entries.put(
            key.to_string(),
            CacheEntry {
                value,
                dirty: true,
                last_access: Instant::now(),
            },
        );
    }

    /// Drop an entry from cache and store.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().pop(key);
        self.db.delete(&self.db_key(key))
    }

    /// Drop every entry whose key starts with the given logical prefix,
    /// from cache and store, without persisting pending changes.
    pub fn discard_prefix(&self, key_prefix: &str) -> Result<()> {
        {
            let mut entries = self.entries.lock();
            let doomed: Vec<String> = entries
                .iter()
                .map(|(k, _)| k)
                .filter(|k| k.starts_with(key_prefix))
                .cloned()
                .collect();
            for k in doomed {
                entries.pop(&k);
            }
        }
        let db_prefix = self.db_key(key_prefix);
        let ops = self
            .db
            .scan_prefix(&db_prefix, 0)?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect::<Vec<_>>();
        if ops.is_empty() {
            return Ok(());
        }
        self.db.write_batch(ops)
    }

    /// Delete persisted entries under a logical prefix, in key order,
    /// until roughly `target_bytes` have been reclaimed. Returns the
    /// bytes freed. Dirty cache-only entries hold no store bytes and
    /// are left alone.
    pub fn reclaim_prefix(&self, key_prefix: &str, target_bytes: u64) -> Result<u64> {
        let db_prefix = self.db_key(key_prefix);
        let mut freed = 0u64;
        let mut ops = Vec::new();
        let mut doomed = Vec::new();
        for (key, value) in self.db.scan_prefix(&db_prefix, 0)? {
            if freed >= target_bytes {
                break;
            }
            freed += (key.len() + value.len()) as u64;
            if let Ok(k) = std::str::from_utf8(&key[self.prefix.len()..]) {
                doomed.push(k.to_string());
            }
            ops.push(BatchOp::Delete { key });
        }
        if ops.is_empty() {
            return Ok(0);
        }
        self.db.write_batch(ops)?;
        let mut entries = self.entries.lock();
        for k in doomed {
            entries.pop(&k);
        }
        Ok(freed)
    }

    /// Persist every dirty entry, then drop the ones idle past the TTL.
    pub fn write_back(&self) -> Result<usize> {
        let mut entries = self.entries.lock();
        let mut ops = Vec::new();
        let mut written = Vec::new();
        let mut expired = Vec::new();
        for (key, entry) in entries.iter() {
            if entry.dirty {
                let bytes = self.codec.encode(key, &entry.value.read())?;
                ops.push(BatchOp::Set {
                    key: self.db_key(key),
                    value: bytes,
                });
                written.push(key.clone());
            }
            if entry.last_access.elapsed() > self.ttl {
                expired.push(key.clone());
            }
        }
        if !ops.is_empty() {
            self.db.write_batch(ops)?;
        }
        for key in &written {
            if let Some(entry) = entries.peek_mut(key) {
                entry.dirty = false;
            }
        }
        let dropped = expired.len();
        for key in expired {
            entries.pop(&key);
        }
        Ok(dropped)
    }

    /// Persist and drop the least-recently-used fraction of entries.
    /// Returns how many were evicted.
    pub fn evict(&self, fraction: f64) -> Result<usize> {
        let mut entries = self.entries.lock();
        let count = ((entries.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
        let mut ops = Vec::new();
        let mut evicted = 0;
        for _ in 0..count {
            let Some((key, entry)) = entries.pop_lru() else {
                break;
            };
            if entry.dirty {
                let bytes = self.codec.encode(&key, &entry.value.read())?;
                ops.push(BatchOp::Set {
                    key: self.db_key(&key),
                    value: bytes,
                });
            }
            evicted += 1;
        }
        if !ops.is_empty() {
            self.db.write_batch(ops)?;
        }
        Ok(evicted)
    }

    /// Persist everything and empty the cache. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        let mut ops = Vec::new();
        while let Some((key, entry)) = entries.pop_lru() {
            if entry.dirty {
                let bytes = self.codec.encode(&key, &entry.value.read())?;
                ops.push(BatchOp::Set {
                    key: self.db_key(&key),
                    value: bytes,
                });
            }
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.db.write_batch(ops)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V> Cache<V> {
    /// Fetch an entry, creating a fresh one on a full miss.
    pub fn get_or_create(&self, key: &str) -> Result<Arc<RwLock<V>>> {
        if let Some(value) = self.lookup(key)? {
            return Ok(value);
        }
        let value = Arc::new(RwLock::new(self.codec.new_value(key)));
        let mut entries = self.entries.lock();
        entries.put(
            key.to_string(),
            CacheEntry {
                value: Arc::clone(&value),
                dirty: false,
                last_access: Instant::now(),
            },
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryKv;
    use pretty_assertions::assert_eq;

    fn cache(ttl: Duration) -> (Arc<MemoryKv>, Cache<Vec<String>>) {
        let kv = Arc::new(MemoryKv::new());
        let cache = Cache::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Box::new(BincodeCodec),
            "x:",
            ttl,
        );
        (kv, cache)
    }

    #[test]
    fn test_lookup_miss_and_create() {
        let (_kv, cache) = cache(Duration::from_secs(60));
        assert!(cache.lookup("a").unwrap().is_none());
        let v = cache.get_or_create("a").unwrap();
        v.write().push("one".into());
        cache.put("a", v);
        assert_eq!(cache.lookup("a").unwrap().unwrap().read().len(), 1);
    }

    #[test]
    fn test_write_back_persists_dirty() {
        let (kv, cache) = cache(Duration::from_secs(60));
        let v = cache.get_or_create("a").unwrap();
        v.write().push("one".into());
        cache.put("a", v);
        assert!(kv.get(b"x:a").unwrap().is_none());

        cache.write_back().unwrap();
        assert!(kv.get(b"x:a").unwrap().is_some());
        // Still cached: TTL has not passed.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_write_back_expires_idle_entries() {
        let (kv, cache) = cache(Duration::ZERO);
        let v = cache.get_or_create("a").unwrap();
        v.write().push("one".into());
        cache.put("a", v);

        cache.write_back().unwrap();
        assert_eq!(cache.len(), 0);

        // Read-through restores the persisted value.
        let back = cache.lookup("a").unwrap().unwrap();
        assert_eq!(back.read().as_slice(), &["one".to_string()]);
        assert_eq!(kv.get(b"x:a").unwrap().is_some(), true);
    }

    #[test]
    fn test_evict_persists_before_dropping() {
        let (kv, cache) = cache(Duration::from_secs(60));
        for name in ["a", "b", "c", "d"] {
            let v = cache.get_or_create(name).unwrap();
            v.write().push(name.to_string());
            cache.put(name, v);
        }
        let evicted = cache.evict(0.5).unwrap();
        assert_eq!(evicted, 2);
        assert_eq!(cache.len(), 2);
        // The least recently used entries went to the store.
        assert!(kv.get(b"x:a").unwrap().is_some());
        assert!(kv.get(b"x:b").unwrap().is_some());
    }

    #[test]
    fn test_delete_removes_everywhere() {
        let (kv, cache) = cache(Duration::from_secs(60));
        let v = cache.get_or_create("a").unwrap();
        v.write().push("one".into());
        cache.put("a", v);
        cache.write_back().unwrap();

        cache.delete("a").unwrap();
        assert!(cache.lookup("a").unwrap().is_none());
        assert!(kv.get(b"x:a").unwrap().is_none());
    }

    #[test]
    fn test_discard_prefix() {
        let (kv, cache) = cache(Duration::from_secs(60));
        for name in ["app{}:0:10", "app{}:0:20", "other{}:0:10"] {
            let v = cache.get_or_create(name).unwrap();
            v.write().push(name.to_string());
            cache.put(name, v);
        }
        cache.write_back().unwrap();

        cache.discard_prefix("app{}:").unwrap();
        assert!(cache.lookup("app{}:0:10").unwrap().is_none());
        assert!(cache.lookup("app{}:0:20").unwrap().is_none());
        assert!(cache.lookup("other{}:0:10").unwrap().is_some());
        assert!(kv.get(b"x:other{}:0:10").unwrap().is_some());
    }

    #[test]
    fn test_flush_empties_cache() {
        let (kv, cache) = cache(Duration::from_secs(60));
        let v = cache.get_or_create("a").unwrap();
        v.write().push("one".into());
        cache.put("a", v);

        cache.flush().unwrap();
        assert_eq!(cache.len(), 0);
        assert!(kv.get(b"x:a").unwrap().is_some());
    }

    #[test]
    fn test_decode_failure_is_hard_error() {
        let (kv, cache) = cache(Duration::from_secs(60));
        kv.set(b"x:bad", &[0xff, 0xff]).unwrap();
        assert!(cache.lookup("bad").is_err());
    }
}

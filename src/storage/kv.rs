//! Narrow interface to the embedded key-value collaborator.
//!
//! The store only needs an ordered byte-oriented map with transactional
//! batch writes and prefix iteration; everything else about persistence
//! stays behind this trait. The in-memory implementation is the
//! default; a RocksDB-backed one is available behind the `persistent`
//! feature.

use crate::core::Result;
#[cfg(feature = "persistent")]
use crate::core::EmberError;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// One operation of a transactional batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered byte-oriented embedded store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Apply every operation or none.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Key-ordered entries under a prefix. `limit == 0` means
    /// unlimited.
    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Rough number of stored bytes, for capacity checks.
    fn approximate_size(&self) -> u64;

    fn flush(&self) -> Result<()>;
}

/// BTreeMap-backed store. Keeps everything ordered in memory; fine for
/// tests and for deployments that treat the store as a cache.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut entries = self.entries.write();
        for op in ops {
            match op {
                BatchOp::Set { key, value } => {
                    entries.insert(key, value);
                },
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                },
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read();
        let mut out = Vec::new();
        for (k, v) in entries.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.clone(), v.clone()));
            if limit != 0 && out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    fn approximate_size(&self) -> u64 {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// RocksDB-backed store.
#[cfg(feature = "persistent")]
pub struct RocksKv {
    db: rocksdb::DB,
}

#[cfg(feature = "persistent")]
impl RocksKv {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);
        let db = rocksdb::DB::open(&options, path)
            .map_err(|e| EmberError::storage(format!("rocksdb open: {}", e)))?;
        Ok(Self { db })
    }
}

#[cfg(feature = "persistent")]
impl KvStore for RocksKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| EmberError::storage(format!("rocksdb get: {}", e)))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put(key, value)
            .map_err(|e| EmberError::storage(format!("rocksdb put: {}", e)))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .delete(key)
            .map_err(|e| EmberError::storage(format!("rocksdb delete: {}", e)))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Set { key, value } => batch.put(key, value),
                BatchOp::Delete { key } => batch.delete(key),
            }
        }
        self.db
            .write(batch)
            .map_err(|e| EmberError::storage(format!("rocksdb write batch: {}", e)))
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.prefix_iterator(prefix) {
            let (k, v) =
                item.map_err(|e| EmberError::storage(format!("rocksdb iterator: {}", e)))?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
            if limit != 0 && out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    fn approximate_size(&self) -> u64 {
        self.db
            .property_int_value("rocksdb.total-sst-files-size")
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| EmberError::storage(format!("rocksdb flush: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_get_delete() {
        let kv = MemoryKv::new();
        kv.set(b"a", b"1").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));
        kv.delete(b"a").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_ordered() {
        let kv = MemoryKv::new();
        kv.set(b"t:b", b"2").unwrap();
        kv.set(b"t:a", b"1").unwrap();
        kv.set(b"s:x", b"9").unwrap();

        let hits = kv.scan_prefix(b"t:", 0).unwrap();
        let keys: Vec<_> = hits.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"t:a".as_slice(), b"t:b".as_slice()]);
    }

    #[test]
    fn test_scan_prefix_limit() {
        let kv = MemoryKv::new();
        for i in 0..5u8 {
            kv.set(&[b'p', b':', b'0' + i], b"v").unwrap();
        }
        assert_eq!(kv.scan_prefix(b"p:", 2).unwrap().len(), 2);
    }

    #[test]
    fn test_write_batch_atomic_view() {
        let kv = MemoryKv::new();
        kv.set(b"a", b"1").unwrap();
        kv.write_batch(vec![
            BatchOp::Delete { key: b"a".to_vec() },
            BatchOp::Set {
                key: b"b".to_vec(),
                value: b"2".to_vec(),
            },
        ])
        .unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);
        assert_eq!(kv.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_approximate_size() {
        let kv = MemoryKv::new();
        assert_eq!(kv.approximate_size(), 0);
        kv.set(b"ab", b"cdef").unwrap();
        assert_eq!(kv.approximate_size(), 6);
    }

    #[cfg(feature = "persistent")]
    #[test]
    fn test_rocks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = RocksKv::open(dir.path()).unwrap();
        kv.set(b"t:a", b"1").unwrap();
        kv.set(b"t:b", b"2").unwrap();
        kv.set(b"s:x", b"9").unwrap();
        assert_eq!(kv.get(b"t:a").unwrap(), Some(b"1".to_vec()));
        let hits = kv.scan_prefix(b"t:", 0).unwrap();
        assert_eq!(hits.len(), 2);
        kv.delete(b"t:a").unwrap();
        assert_eq!(kv.get(b"t:a").unwrap(), None);
    }
}

//! Observed label keys and values.
//!
//! A flat index over the metadata keyspace feeding autocompletion:
//! `l:<key>` marks a key as seen, `lv:<key>:<value>` a concrete pair.

use crate::core::Result;
use crate::storage::kv::KvStore;
use std::sync::Arc;

const KEY_PREFIX: &str = "l:";
const VALUE_PREFIX: &str = "lv:";

pub struct Labels {
    db: Arc<dyn KvStore>,
}

impl Labels {
    pub fn new(db: Arc<dyn KvStore>) -> Self {
        Self { db }
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .set(format!("{}{}", KEY_PREFIX, key).as_bytes(), &[])?;
        self.db
            .set(format!("{}{}:{}", VALUE_PREFIX, key, value).as_bytes(), &[])
    }

    pub fn delete_value(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .delete(format!("{}{}:{}", VALUE_PREFIX, key, value).as_bytes())
    }

    /// Iterate observed label keys; the callback returns false to stop.
    pub fn get_keys(&self, cb: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        for (k, _) in self.db.scan_prefix(KEY_PREFIX.as_bytes(), 0)? {
            let Ok(k) = std::str::from_utf8(&k) else {
                continue;
            };
            if !cb(&k[KEY_PREFIX.len()..]) {
                break;
            }
        }
        Ok(())
    }

    /// Iterate observed values of one key; the callback returns false
    /// to stop.
    pub fn get_values(&self, key: &str, cb: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        let prefix = format!("{}{}:", VALUE_PREFIX, key);
        for (k, _) in self.db.scan_prefix(prefix.as_bytes(), 0)? {
            let Ok(k) = std::str::from_utf8(&k) else {
                continue;
            };
            if !cb(&k[prefix.len()..]) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryKv;
    use pretty_assertions::assert_eq;

    fn labels() -> Labels {
        Labels::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn test_keys_and_values() {
        let l = labels();
        l.put("__name__", "app.cpu").unwrap();
        l.put("region", "eu").unwrap();
        l.put("region", "us").unwrap();

        let mut keys = Vec::new();
        l.get_keys(&mut |k| {
            keys.push(k.to_string());
            true
        })
        .unwrap();
        assert_eq!(keys, vec!["__name__", "region"]);

        let mut values = Vec::new();
        l.get_values("region", &mut |v| {
            values.push(v.to_string());
            true
        })
        .unwrap();
        assert_eq!(values, vec!["eu", "us"]);
    }

    #[test]
    fn test_early_stop() {
        let l = labels();
        l.put("region", "eu").unwrap();
        l.put("region", "us").unwrap();
        let mut count = 0;
        l.get_values("region", &mut |_| {
            count += 1;
            false
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_delete_value() {
        let l = labels();
        l.put("region", "eu").unwrap();
        l.delete_value("region", "eu").unwrap();
        let mut values = Vec::new();
        l.get_values("region", &mut |v| {
            values.push(v.to_string());
            true
        })
        .unwrap();
        assert!(values.is_empty());
    }
}

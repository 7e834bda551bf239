//! Per-application frame-name dictionary.
//!
//! Profile trees for one application share most of their frame names,
//! so serialized trees store compact ids interned here instead of
//! repeating the strings in every time bucket.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Bidirectional `String ⇄ u32` interner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dictionary {
    names: Vec<String>,
    #[serde(skip)]
    index: FxHashMap<String, u32>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning its stable id.
    pub fn put(&mut self, name: &str) -> u32 {
        if self.index.is_empty() && !self.names.is_empty() {
            self.rebuild_index();
        }
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    /// Resolve an id back to its name.
    pub fn get(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    // The reverse index is skipped during serialization; restore it
    // lazily after a load.
    fn rebuild_index(&mut self) {
        self.index = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let mut d = Dictionary::new();
        let a = d.put("main");
        let b = d.put("work");
        assert_ne!(a, b);
        assert_eq!(d.put("main"), a);
        assert_eq!(d.get(a), Some("main"));
        assert_eq!(d.get(b), Some("work"));
        assert_eq!(d.get(99), None);
    }

    #[test]
    fn test_index_survives_serde() {
        let mut d = Dictionary::new();
        d.put("main");
        d.put("work");
        let bytes = bincode::serialize(&d).unwrap();
        let mut back: Dictionary = bincode::deserialize(&bytes).unwrap();
        // Ids must be stable across the round trip.
        assert_eq!(back.put("main"), 0);
        assert_eq!(back.put("new"), 2);
    }
}

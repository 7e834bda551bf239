//! Inverted index from one label pair to the segments carrying it.
//!
//! A dimension is identified by `<label-key>:<label-value>` and holds a
//! sorted, deduplicated list of segment keys. Keeping the list sorted is
//! what makes the merge-scan set algebra below linear.

use serde::{Deserialize, Serialize};

/// The sorted set of segment keys observed for one label pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    keys: Vec<String>,
}

impl Dimension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a segment key, keeping sort order. Idempotent.
    pub fn insert(&mut self, key: &str) {
        if let Err(pos) = self.keys.binary_search_by(|k| k.as_str().cmp(key)) {
            self.keys.insert(pos, key.to_string());
        }
    }

    /// Remove a segment key if present.
    pub fn delete(&mut self, key: &str) {
        if let Ok(pos) = self.keys.binary_search_by(|k| k.as_str().cmp(key)) {
            self.keys.remove(pos);
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<String> for Dimension {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        let mut keys: Vec<String> = iter.into_iter().collect();
        keys.sort();
        keys.dedup();
        Self { keys }
    }
}

/// Multiway intersection over sorted key lists.
///
/// Repeatedly find the greatest current head, advance every other
/// cursor past smaller elements; when all heads agree the key is
/// emitted. Stops as soon as any input is exhausted.
pub fn intersection(dimensions: &[&Dimension]) -> Vec<String> {
    match dimensions.len() {
        0 => return Vec::new(),
        1 => return dimensions[0].keys.clone(),
        _ => {},
    }

    let mut cursors = vec![0usize; dimensions.len()];
    let mut out = Vec::new();

    'scan: loop {
        // The lexicographically greatest head is the only candidate the
        // remaining inputs could all still contain.
        let mut max = "";
        for (d, &c) in dimensions.iter().zip(&cursors) {
            match d.keys.get(c) {
                None => break 'scan,
                Some(k) if k.as_str() > max => max = k.as_str(),
                Some(_) => {},
            }
        }

        let mut all_match = true;
        for (i, d) in dimensions.iter().enumerate() {
            while let Some(k) = d.keys.get(cursors[i]) {
                if k.as_str() >= max {
                    break;
                }
                cursors[i] += 1;
            }
            match d.keys.get(cursors[i]) {
                None => break 'scan,
                Some(k) => {
                    if k != max {
                        all_match = false;
                    }
                },
            }
        }

        if all_match {
            out.push(max.to_string());
            for c in &mut cursors {
                *c += 1;
            }
        }
    }

    out
}

/// Multiway union over sorted key lists, deduplicated.
pub fn union(dimensions: &[&Dimension]) -> Vec<String> {
    match dimensions.len() {
        0 => return Vec::new(),
        1 => return dimensions[0].keys.clone(),
        _ => {},
    }

    let mut cursors = vec![0usize; dimensions.len()];
    let mut out: Vec<String> = Vec::new();

    loop {
        let mut min: Option<&str> = None;
        for (d, &c) in dimensions.iter().zip(&cursors) {
            if let Some(k) = d.keys.get(c) {
                if min.map_or(true, |m| k.as_str() < m) {
                    min = Some(k.as_str());
                }
            }
        }
        let Some(min) = min else { break };
        out.push(min.to_string());
        let min = out.last().unwrap().as_str();
        for (i, d) in dimensions.iter().enumerate() {
            while d.keys.get(cursors[i]).is_some_and(|k| k == min) {
                cursors[i] += 1;
            }
        }
    }

    out
}

/// Keys of `a` that are not in `b`. Both inputs sorted; linear merge.
pub fn and_not(a: &Dimension, b: &Dimension) -> Vec<String> {
    let mut out = Vec::new();
    let mut j = 0;
    for k in &a.keys {
        while b.keys.get(j).is_some_and(|bk| bk.as_str() < k.as_str()) {
            j += 1;
        }
        if b.keys.get(j).map_or(true, |bk| bk != k) {
            out.push(k.clone());
        }
    }
    out
}

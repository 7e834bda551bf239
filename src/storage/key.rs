//! Label-set keys and their canonical forms.
//!
//! A key is an ordered label map with the reserved `__name__` label
//! holding the application name. Its normalized form addresses the
//! segment, tree, and dictionary keyspaces, so normalization must be
//! deterministic and collision-free for a given label set.

use crate::core::{EmberError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// The reserved label holding the application name.
pub const APP_NAME_LABEL: &str = "__name__";

/// The label marking an individually addressable profile. Writes
/// carrying it bypass the segment tree.
pub const PROFILE_ID_LABEL: &str = "profile_id";

/// Tag keys that may not appear as query matchers.
pub const RESERVED_TAG_KEYS: &[&str] = &[APP_NAME_LABEL];

/// A parsed label-set identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    labels: BTreeMap<String, String>,
}

impl Key {
    /// Build a key directly from a label map.
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self { labels }
    }

    /// The segment key of the bare application (no labels): `app{}`.
    /// Exemplar metadata lives on this segment.
    pub fn app_segment_key(app_name: &str) -> String {
        format!("{}{{}}", app_name)
    }

    /// The application name, empty if the reserved label is missing.
    pub fn app_name(&self) -> &str {
        self.labels.get(APP_NAME_LABEL).map_or("", String::as_str)
    }

    /// All labels, including the reserved ones.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn add_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    /// The `profile_id` label, if this key addresses an exemplar.
    pub fn profile_id(&self) -> Option<&str> {
        self.labels.get(PROFILE_ID_LABEL).map(String::as_str)
    }

    /// Canonical form: app name first, then all non-reserved labels
    /// sorted by key. Used as the segment cache/storage key and as a
    /// hash input, so it must be stable.
    pub fn normalized(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(self.app_name());
        out.push('{');
        let mut first = true;
        for (k, v) in &self.labels {
            if k == APP_NAME_LABEL {
                continue;
            }
            if !first {
                out.push(',');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            first = false;
        }
        out.push('}');
        out
    }

    /// The segment keyspace address.
    pub fn segment_key(&self) -> String {
        self.normalized()
    }

    /// The tree keyspace address for one bucket:
    /// `<segment>:<depth>:<unix-seconds>`.
    pub fn tree_key(&self, depth: usize, t: DateTime<Utc>) -> String {
        tree_key_of(&self.segment_key(), depth, t)
    }

    /// The dictionary keyspace address. Dictionaries are shared per
    /// application.
    pub fn dict_key(&self) -> String {
        self.app_name().to_string()
    }
}

/// Derive a tree key from an already-normalized segment key.
pub fn tree_key_of(segment_key: &str, depth: usize, t: DateTime<Utc>) -> String {
    format!("{}:{}:{}", segment_key, depth, t.timestamp())
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

/// Parse `name{k=v,...}` into a [`Key`]. Whitespace around names, keys,
/// and values is trimmed. A bare `name` with no brace block is
/// accepted; an unterminated block is a parse error.
pub fn parse_key(raw: &str) -> Result<Key> {
    let raw = raw.trim();
    let mut labels = BTreeMap::new();

    let (name, rest) = match raw.find('{') {
        None => (raw, None),
        Some(i) => {
            let body = &raw[i + 1..];
            let Some(end) = body.find('}') else {
                return Err(EmberError::Parse {
                    message: format!("malformed key '{}': unterminated '{{'", raw),
                });
            };
            if !body[end + 1..].trim().is_empty() {
                return Err(EmberError::Parse {
                    message: format!("malformed key '{}': trailing input", raw),
                });
            }
            (&raw[..i], Some(&body[..end]))
        },
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(EmberError::parse("application name is required"));
    }
    labels.insert(APP_NAME_LABEL.to_string(), name.to_string());

    if let Some(body) = rest {
        for pair in body.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((k, v)) = pair.split_once('=') else {
                return Err(EmberError::Parse {
                    message: format!("malformed key '{}': expected k=v, got '{}'", raw, pair),
                });
            };
            labels.insert(k.trim().to_string(), v.trim().to_string());
        }
    }

    Ok(Key { labels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_bare_name() {
        let k = parse_key("app.cpu").unwrap();
        assert_eq!(k.app_name(), "app.cpu");
        assert_eq!(k.normalized(), "app.cpu{}");
    }

    #[test]
    fn test_parse_labels_sorted() {
        let k = parse_key("app.cpu{zebra=1,alpha=2}").unwrap();
        assert_eq!(k.normalized(), "app.cpu{alpha=2,zebra=1}");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let k = parse_key("  app.cpu { foo = bar , baz = qux } ").unwrap();
        assert_eq!(k.normalized(), "app.cpu{baz=qux,foo=bar}");
    }

    #[test]
    fn test_parse_rejects_unterminated_brace() {
        assert!(parse_key("app.cpu{foo=bar").is_err());
    }

    #[test]
    fn test_parse_rejects_missing_name() {
        assert!(parse_key("{foo=bar}").is_err());
        assert!(parse_key("   ").is_err());
    }

    #[test]
    fn test_normalization_idempotent() {
        for raw in [
            "app.cpu",
            "app.cpu{}",
            "app.cpu{b=2,a=1}",
            "app.cpu{profile_id=xyz,region=eu}",
        ] {
            let once = parse_key(raw).unwrap().normalized();
            let twice = parse_key(&once).unwrap().normalized();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_profile_id() {
        let k = parse_key("app.cpu{profile_id=abc}").unwrap();
        assert_eq!(k.profile_id(), Some("abc"));
        assert!(parse_key("app.cpu{}").unwrap().profile_id().is_none());
    }

    #[test]
    fn test_tree_key_derivation() {
        let k = parse_key("app.cpu{foo=bar}").unwrap();
        let t = Utc.timestamp_opt(170, 0).unwrap();
        assert_eq!(k.tree_key(2, t), "app.cpu{foo=bar}:2:170");
        assert_eq!(k.dict_key(), "app.cpu");
    }

    #[test]
    fn test_app_segment_key() {
        assert_eq!(Key::app_segment_key("app.cpu"), "app.cpu{}");
    }
}

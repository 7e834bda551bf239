//! Label-selection query language.
//!
//! Queries take the form `app{key="value",other!~"re.*"}` and select
//! segments by intersecting the dimensions their matchers name.

pub mod parser;

pub use parser::parse_query;

use crate::storage::key::{PROFILE_ID_LABEL, RESERVED_TAG_KEYS};

/// Matcher comparison operators, in increasing priority order: operators
/// narrowing the result set (equality) evaluate before the ones
/// subtracting from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchOp {
    /// `!~`
    NotEqualRegex,
    /// `!=`
    NotEqual,
    /// `=~`
    EqualRegex,
    /// `=`
    Equal,
}

impl MatchOp {
    /// Whether the operator narrows the result set. Negated operators
    /// widen the set to subtract and cannot short-circuit.
    pub fn is_positive(self) -> bool {
        matches!(self, Self::Equal | Self::EqualRegex)
    }
}

/// One `key op "value"` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatcher {
    pub key: String,
    pub value: String,
    pub op: MatchOp,
}

/// A parsed query: application name plus tag matchers sorted by
/// operator priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub app_name: String,
    pub matchers: Vec<TagMatcher>,
}

impl Query {
    /// The profile IDs selected by `profile_id="..."` matchers, if any.
    /// Such a query bypasses the segment tree entirely.
    pub fn profile_ids(&self) -> Vec<&str> {
        self.matchers
            .iter()
            .filter(|m| m.key == PROFILE_ID_LABEL && m.op == MatchOp::Equal)
            .map(|m| m.value.as_str())
            .collect()
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{{", self.app_name)?;
        for (i, m) in self.matchers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let op = match m.op {
                MatchOp::Equal => "=",
                MatchOp::NotEqual => "!=",
                MatchOp::EqualRegex => "=~",
                MatchOp::NotEqualRegex => "!~",
            };
            write!(f, "{}{}\"{}\"", m.key, op, m.value)?;
        }
        f.write_str("}")
    }
}

/// Whether a tag key is reserved and may not appear as a matcher.
pub fn is_tag_key_reserved(key: &str) -> bool {
    RESERVED_TAG_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_id_extraction() {
        let q = parse_query(r#"app.cpu{profile_id="abc123"}"#).unwrap();
        assert_eq!(q.profile_ids(), vec!["abc123"]);

        let q = parse_query(r#"app.cpu{region="eu"}"#).unwrap();
        assert!(q.profile_ids().is_empty());
    }

    #[test]
    fn test_display_round_trip() {
        let q = parse_query(r#"app{foo="bar",baz!="qux"}"#).unwrap();
        let again = parse_query(&q.to_string()).unwrap();
        assert_eq!(q, again);
    }
}

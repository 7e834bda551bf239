//! Query parser using nom.

use super::{is_tag_key_reserved, MatchOp, Query, TagMatcher};
use crate::core::{EmberError, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, opt, value as nom_value},
    multi::separated_list0,
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};

/// Parse a query string into a [`Query`].
///
/// Matchers are sorted by operator priority so that positive matchers
/// are evaluated (and can short-circuit) before negated ones.
pub fn parse_query(input: &str) -> Result<Query> {
    let input = input.trim();

    match query(input) {
        Ok((remaining, q)) => {
            if !remaining.trim().is_empty() {
                return Err(EmberError::Parse {
                    message: format!("unexpected input after query: '{}'", remaining),
                });
            }
            validate(q)
        },
        Err(e) => Err(EmberError::Parse {
            message: format!("failed to parse query: {}", e),
        }),
    }
}

fn validate(mut q: Query) -> Result<Query> {
    if q.app_name.is_empty() {
        return Err(EmberError::parse("application name is required"));
    }
    for m in &q.matchers {
        if is_tag_key_reserved(&m.key) {
            return Err(EmberError::Parse {
                message: format!("tag key '{}' is reserved", m.key),
            });
        }
        if matches!(m.op, MatchOp::EqualRegex | MatchOp::NotEqualRegex) {
            regex::Regex::new(&m.value).map_err(|e| EmberError::Parse {
                message: format!("invalid regex for '{}': {}", m.key, e),
            })?;
        }
    }
    q.matchers.sort_by(|a, b| b.op.cmp(&a.op));
    Ok(q)
}

fn query(input: &str) -> IResult<&str, Query> {
    map(
        tuple((app_name, opt(matcher_block))),
        |(app_name, matchers)| Query {
            app_name: app_name.trim().to_string(),
            matchers: matchers.unwrap_or_default(),
        },
    )(input)
}

/// Application names run until the matcher block opens.
fn app_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != '{' && c != '}')(input)
}

fn matcher_block(input: &str) -> IResult<&str, Vec<TagMatcher>> {
    delimited(
        char('{'),
        terminated(
            separated_list0(char(','), preceded(multispace0, matcher)),
            // Tolerate a trailing comma.
            opt(preceded(multispace0, char(','))),
        ),
        preceded(multispace0, char('}')),
    )(input)
}

fn matcher(input: &str) -> IResult<&str, TagMatcher> {
    map(
        tuple((
            tag_key,
            preceded(multispace0, operator),
            preceded(multispace0, quoted_value),
        )),
        |(key, op, value)| TagMatcher {
            key: key.to_string(),
            value: value.to_string(),
            op,
        },
    )(input)
}

fn tag_key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')(input)
}

/// Longest operators first, so `!=` does not parse as `!` + garbage.
fn operator(input: &str) -> IResult<&str, MatchOp> {
    alt((
        nom_value(MatchOp::NotEqualRegex, tag("!~")),
        nom_value(MatchOp::NotEqual, tag("!=")),
        nom_value(MatchOp::EqualRegex, tag("=~")),
        nom_value(MatchOp::Equal, tag("=")),
    ))(input)
}

fn quoted_value(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c: char| c != '"'), char('"'))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bare_app_name() {
        let q = parse_query("app.cpu").unwrap();
        assert_eq!(q.app_name, "app.cpu");
        assert!(q.matchers.is_empty());
    }

    #[test]
    fn test_empty_matcher_block() {
        let q = parse_query("app.cpu{}").unwrap();
        assert_eq!(q.app_name, "app.cpu");
        assert!(q.matchers.is_empty());
    }

    #[test]
    fn test_matchers() {
        let q = parse_query(r#"app.cpu{foo="bar", baz!="qux", re=~"a.*", nre!~"b.*"}"#).unwrap();
        assert_eq!(q.matchers.len(), 4);
        // Sorted: positive equality first, negated regex last.
        assert_eq!(q.matchers[0].op, MatchOp::Equal);
        assert_eq!(q.matchers[0].key, "foo");
        assert_eq!(q.matchers[1].op, MatchOp::EqualRegex);
        assert_eq!(q.matchers[2].op, MatchOp::NotEqual);
        assert_eq!(q.matchers[3].op, MatchOp::NotEqualRegex);
        assert_eq!(q.matchers[3].value, "b.*");
    }

    #[test]
    fn test_trailing_comma() {
        let q = parse_query(r#"app{foo="bar",}"#).unwrap();
        assert_eq!(q.matchers.len(), 1);
    }

    #[test]
    fn test_rejects_unterminated_block() {
        assert!(parse_query(r#"app{foo="bar""#).is_err());
    }

    #[test]
    fn test_rejects_reserved_key() {
        assert!(parse_query(r#"app{__name__="other"}"#).is_err());
    }

    #[test]
    fn test_rejects_bad_regex() {
        assert!(parse_query(r#"app{foo=~"["}"#).is_err());
    }

    #[test]
    fn test_rejects_missing_app() {
        assert!(parse_query(r#"{foo="bar"}"#).is_err());
    }
}

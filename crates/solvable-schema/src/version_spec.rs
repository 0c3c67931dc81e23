//! Version constraints such as `>=1.2,<2|3.1.*`.
//!
//! `,` binds tighter than `|`, so `1.2|>=1.5,<2` means
//! `1.2 OR (>=1.5 AND <2)`.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;

use crate::version::{Version, VersionError};

/// Errors produced while parsing a [`VersionSpec`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionSpecError {
    /// The constraint string is empty or has an empty `,`/`|` clause.
    #[error("empty version constraint in '{0}'")]
    Empty(String),

    /// A clause could not be parsed as a version.
    #[error("invalid version in constraint '{spec}': {source}")]
    InvalidVersion {
        /// The full constraint text.
        spec: String,
        /// The underlying version error.
        source: VersionError,
    },

    /// Parenthesised groups are not supported.
    #[error("unsupported version constraint '{0}'")]
    Unsupported(String),
}

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

/// A single clause of a version constraint.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Any version.
    Any,
    /// `op version`, e.g. `>=1.2`.
    Compare(Operator, Version),
    /// `1.2.*`, `=1.2` or `==1.2.*`.
    StartsWith(Version),
    /// `!=1.2.*`.
    NotStartsWith(Version),
    /// `~=1.2.3`: at least `1.2.3` and starting with `1.2`.
    Compatible(Version, Version),
    /// A version with a wildcard in the middle, matched against the text.
    Glob(Regex),
}

impl Constraint {
    fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Compare(op, other) => match op {
                Operator::Eq => version == other,
                Operator::Ne => version != other,
                Operator::Gt => version > other,
                Operator::Ge => version >= other,
                Operator::Lt => version < other,
                Operator::Le => version <= other,
            },
            Self::StartsWith(prefix) => version.starts_with(prefix),
            Self::NotStartsWith(prefix) => !version.starts_with(prefix),
            Self::Compatible(lower, prefix) => version >= lower && version.starts_with(prefix),
            Self::Glob(re) => re.is_match(version.as_str()),
        }
    }
}

/// A parsed version constraint: an OR of ANDs of [`Constraint`]s.
///
/// # Example
///
/// ```
/// use solvable_schema::{Version, VersionSpec};
///
/// let spec: VersionSpec = ">=1.2,<2|3.1.*".parse().unwrap();
/// assert!(spec.matches(&"1.5".parse::<Version>().unwrap()));
/// assert!(spec.matches(&"3.1.4".parse::<Version>().unwrap()));
/// assert!(!spec.matches(&"2.0".parse::<Version>().unwrap()));
/// ```
#[derive(Debug, Clone)]
pub struct VersionSpec {
    source: String,
    alternatives: Vec<Vec<Constraint>>,
}

impl VersionSpec {
    /// The constraint text as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the constraint accepts every version.
    pub fn is_any(&self) -> bool {
        self.alternatives
            .iter()
            .any(|all| all.iter().all(|c| matches!(c, Constraint::Any)))
    }

    /// Test a version against the constraint.
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|all| all.iter().all(|c| c.matches(version)))
    }
}

fn parse_version(text: &str, spec: &str) -> Result<Version, VersionSpecError> {
    text.parse().map_err(|source| VersionSpecError::InvalidVersion {
        spec: spec.to_string(),
        source,
    })
}

/// Strip a trailing `.*` or `*` wildcard, returning the prefix if one was present.
fn strip_wildcard(text: &str) -> Option<&str> {
    text.strip_suffix(".*").or_else(|| text.strip_suffix('*'))
}

fn glob_regex(text: &str, spec: &str) -> Result<Regex, VersionSpecError> {
    let pattern = text
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{pattern}$")).map_err(|_| VersionSpecError::Unsupported(spec.to_string()))
}

fn parse_clause(clause: &str, spec: &str) -> Result<Constraint, VersionSpecError> {
    let clause = clause.trim();
    if clause.is_empty() {
        return Err(VersionSpecError::Empty(spec.to_string()));
    }
    if clause == "*" || clause == "*.*" {
        return Ok(Constraint::Any);
    }

    const OPERATORS: [(&str, Option<Operator>); 8] = [
        ("==", Some(Operator::Eq)),
        ("!=", Some(Operator::Ne)),
        (">=", Some(Operator::Ge)),
        ("<=", Some(Operator::Le)),
        ("~=", None),
        (">", Some(Operator::Gt)),
        ("<", Some(Operator::Lt)),
        ("=", None),
    ];

    for (prefix, op) in OPERATORS {
        let Some(rest) = clause.strip_prefix(prefix) else {
            continue;
        };
        let rest = rest.trim();
        return match (prefix, op) {
            ("~=", _) => {
                let lower = parse_version(rest, spec)?;
                let prefix_text = rest.rsplit_once('.').map_or(rest, |(head, _)| head);
                let prefix_version = parse_version(prefix_text, spec)?;
                Ok(Constraint::Compatible(lower, prefix_version))
            }
            ("=", _) => {
                let body = strip_wildcard(rest).unwrap_or(rest);
                Ok(Constraint::StartsWith(parse_version(body, spec)?))
            }
            (_, Some(Operator::Eq)) => match strip_wildcard(rest) {
                Some(body) => Ok(Constraint::StartsWith(parse_version(body, spec)?)),
                None => Ok(Constraint::Compare(Operator::Eq, parse_version(rest, spec)?)),
            },
            (_, Some(Operator::Ne)) => match strip_wildcard(rest) {
                Some(body) => Ok(Constraint::NotStartsWith(parse_version(body, spec)?)),
                None => Ok(Constraint::Compare(Operator::Ne, parse_version(rest, spec)?)),
            },
            (_, Some(op)) => {
                let body = strip_wildcard(rest).unwrap_or(rest);
                Ok(Constraint::Compare(op, parse_version(body, spec)?))
            }
            (_, None) => Err(VersionSpecError::Unsupported(spec.to_string())),
        };
    }

    if let Some(body) = strip_wildcard(clause) {
        if !body.contains('*') {
            return Ok(Constraint::StartsWith(parse_version(body, spec)?));
        }
    }
    if clause.contains('*') {
        return Ok(Constraint::Glob(glob_regex(clause, spec)?));
    }
    Ok(Constraint::Compare(
        Operator::Eq,
        parse_version(clause, spec)?,
    ))
}

impl FromStr for VersionSpec {
    type Err = VersionSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source: String = s.split_whitespace().collect();
        if source.is_empty() {
            return Err(VersionSpecError::Empty(s.to_string()));
        }
        if source.contains(['(', ')']) {
            return Err(VersionSpecError::Unsupported(source));
        }

        let alternatives = source
            .split('|')
            .map(|alternative| {
                alternative
                    .split(',')
                    .map(|clause| parse_clause(clause, &source))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source,
            alternatives,
        })
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(spec: &str, version: &str) -> bool {
        let spec: VersionSpec = spec.parse().unwrap();
        spec.matches(&version.parse().unwrap())
    }

    #[test]
    fn test_operators() {
        assert!(matches(">=1.2", "1.2"));
        assert!(matches(">=1.2", "1.10"));
        assert!(!matches(">1.2", "1.2.0"));
        assert!(matches("<2.0a0", "1.99"));
        assert!(!matches("<2.0a0", "2.0"));
        assert!(!matches("<2.0a0", "2.0rc1"));
        assert!(matches("!=1.2", "1.3"));
        assert!(matches("==1.2", "1.2.0"));
        assert!(matches("1.2", "1.2"));
        assert!(!matches("1.2", "1.2.1"));
    }

    #[test]
    fn test_fuzzy_and_wildcards() {
        assert!(matches("1.2.*", "1.2.7"));
        assert!(matches("1.2*", "1.2.7"));
        assert!(!matches("1.2.*", "1.20"));
        assert!(matches("=1.2", "1.2.3"));
        assert!(matches("*", "0.0.1"));
        assert!(!matches("!=1.2.*", "1.2.3"));
        assert!(matches("!=1.2.*", "1.3"));
        assert!(matches("1.*.3", "1.7.3"));
        assert!(!matches("1.*.3", "1.7.4"));
    }

    #[test]
    fn test_compatible_release() {
        assert!(matches("~=1.4.5", "1.4.9"));
        assert!(!matches("~=1.4.5", "1.5.0"));
        assert!(!matches("~=1.4.5", "1.4.4"));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        assert!(matches("1.0|>=1.5,<2", "1.0"));
        assert!(matches("1.0|>=1.5,<2", "1.7"));
        assert!(!matches("1.0|>=1.5,<2", "1.2"));
        assert!(!matches("1.0|>=1.5,<2", "2.1"));
    }

    #[test]
    fn test_whitespace_is_ignored() {
        let spec: VersionSpec = ">= 1.2 , < 2".parse().unwrap();
        assert_eq!(spec.as_str(), ">=1.2,<2");
        assert!(spec.matches(&"1.5".parse().unwrap()));
    }

    #[test]
    fn test_invalid_specs() {
        assert!(matches!(
            "".parse::<VersionSpec>(),
            Err(VersionSpecError::Empty(_))
        ));
        assert!(matches!(
            ">=1.2,".parse::<VersionSpec>(),
            Err(VersionSpecError::Empty(_))
        ));
        assert!(matches!(
            "(>=1|<0)".parse::<VersionSpec>(),
            Err(VersionSpecError::Unsupported(_))
        ));
    }
}

//! Conda version ordering.
//!
//! Conda versions are not semver. A version string is split into an optional
//! epoch (`1!`), a main part and an optional local part (`+local`). Each part
//! is a dot separated list of segments and every segment is a run of numeric
//! and alphabetic components, so `1.2rc3` becomes `[[1], [2, "rc", 3]]`.
//! Missing trailing segments compare as zero, which makes `1.1 == 1.1.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while parsing a [`Version`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The version string is empty.
    #[error("empty version string")]
    Empty,

    /// The epoch before `!` is not a non-negative integer.
    #[error("invalid epoch in version '{0}'")]
    InvalidEpoch(String),

    /// The version contains a character conda does not allow.
    #[error("invalid character '{ch}' in version '{version}'")]
    InvalidCharacter {
        /// The offending character.
        ch: char,
        /// The full version string.
        version: String,
    },

    /// Two separators follow each other (e.g. `1..2`) or a part is empty.
    #[error("empty segment in version '{0}'")]
    EmptySegment(String),

    /// A numeric component does not fit into 64 bits.
    #[error("numeric component too large in version '{0}'")]
    NumberTooLarge(String),
}

/// One component of a version segment.
///
/// The variant order is the comparison order: `dev` sorts before every
/// string, strings before numbers and `post` after everything.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// The special `dev` marker.
    Dev,
    /// Any other alphabetic run, lowercased.
    Str(String),
    /// A numeric run.
    Num(u64),
    /// The special `post` marker.
    Post,
}

impl Component {
    /// Whether this component is alphabetic (everything but [`Component::Num`]).
    pub fn is_alpha(&self) -> bool {
        !matches!(self, Self::Num(_))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => f.write_str("dev"),
            Self::Str(s) => f.write_str(s),
            Self::Num(n) => write!(f, "{n}"),
            Self::Post => f.write_str("post"),
        }
    }
}

const ZERO: Component = Component::Num(0);

/// A parsed conda version with `VersionOrder` comparison semantics.
///
/// Equality is order-equality: `Version::from_str("1.1")` equals `1.1.0`.
/// The original text is kept for display.
///
/// # Example
///
/// ```
/// use solvable_schema::Version;
///
/// let a: Version = "1.2.3".parse().unwrap();
/// let b: Version = "1.2.3rc1".parse().unwrap();
/// assert!(b < a);
/// ```
#[derive(Clone)]
pub struct Version {
    source: String,
    epoch: u64,
    segments: Vec<Vec<Component>>,
    local: Vec<Vec<Component>>,
}

impl Version {
    /// The version text as it was parsed.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The epoch (`N!` prefix), zero when absent.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Segments of the main version part, each a list of components.
    pub fn segments(&self) -> &[Vec<Component>] {
        &self.segments
    }

    /// Segments of the local version part (after `+`), empty when absent.
    pub fn local(&self) -> &[Vec<Component>] {
        &self.local
    }

    /// Conda's `startswith` test used by `1.2.*` style specs.
    ///
    /// All segments of `prefix` but the last must compare equal; the last
    /// segment must match component-wise, with a trailing string component
    /// matched as a string prefix (so `1.1a` starts with `1.1a` and `1.1alpha`).
    pub fn starts_with(&self, prefix: &Version) -> bool {
        if self.epoch != prefix.epoch {
            return false;
        }
        let (ours, theirs) = if prefix.local.is_empty() {
            (&self.segments, &prefix.segments)
        } else {
            if cmp_segments(&self.segments, &prefix.segments) != Ordering::Equal {
                return false;
            }
            (&self.local, &prefix.local)
        };

        let Some((last, leading)) = theirs.split_last() else {
            return true;
        };
        let n = leading.len();
        let head = &ours[..n.min(ours.len())];
        if cmp_segments(head, leading) != Ordering::Equal {
            return false;
        }

        let segment: &[Component] = ours.get(n).map_or(&[], Vec::as_slice);
        let Some((last_component, leading_components)) = last.split_last() else {
            return true;
        };
        let m = leading_components.len();
        if cmp_components(&segment[..m.min(segment.len())], leading_components)
            != Ordering::Equal
        {
            return false;
        }

        match (segment.get(m), last_component) {
            (Some(Component::Str(have)), Component::Str(want)) => have.starts_with(want.as_str()),
            (Some(have), want) => have == want,
            (None, _) => false,
        }
    }
}

fn cmp_components(a: &[Component], b: &[Component]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).unwrap_or(&ZERO);
        let right = b.get(i).unwrap_or(&ZERO);
        match left.cmp(right) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn cmp_segments(a: &[Vec<Component>], b: &[Vec<Component>]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).map_or(&[][..], Vec::as_slice);
        let right = b.get(i).map_or(&[][..], Vec::as_slice);
        match cmp_components(left, right) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn parse_part(part: &str, full: &str) -> Result<Vec<Vec<Component>>, VersionError> {
    if part.is_empty() {
        return Err(VersionError::EmptySegment(full.to_string()));
    }

    // A trailing underscore is significant (`1.1_` sorts between `1.1dev` and
    // `1.1a`); every other underscore or dash is a plain separator.
    let (body, trailing_underscore) = match part.strip_suffix('_') {
        Some(body) => (body, true),
        None => (part, false),
    };
    let body = body.replace(['_', '-'], ".");

    let mut segments = Vec::new();
    for raw in body.split('.') {
        if raw.is_empty() {
            return Err(VersionError::EmptySegment(full.to_string()));
        }
        segments.push(parse_segment(raw, full)?);
    }
    if trailing_underscore {
        if let Some(last) = segments.last_mut() {
            last.push(Component::Str("_".to_string()));
        }
    }
    Ok(segments)
}

fn parse_segment(raw: &str, full: &str) -> Result<Vec<Component>, VersionError> {
    let mut components = Vec::new();
    let mut rest = raw;
    while let Some(first) = rest.chars().next() {
        let numeric = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != numeric)
            .unwrap_or(rest.len());
        let run = &rest[..end];
        let component = if numeric {
            Component::Num(
                run.parse()
                    .map_err(|_| VersionError::NumberTooLarge(full.to_string()))?,
            )
        } else {
            match run {
                "dev" => Component::Dev,
                "post" => Component::Post,
                other => Component::Str(other.to_string()),
            }
        };
        components.push(component);
        rest = &rest[end..];
    }
    if components.first().is_some_and(Component::is_alpha) {
        components.insert(0, Component::Num(0));
    }
    Ok(components)
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = s.trim();
        if source.is_empty() {
            return Err(VersionError::Empty);
        }
        let lowered = source.to_lowercase();
        if let Some(ch) = lowered
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+' | '!')))
        {
            return Err(VersionError::InvalidCharacter {
                ch,
                version: source.to_string(),
            });
        }

        let (epoch, rest) = match lowered.split_once('!') {
            Some((epoch, rest)) => (
                epoch
                    .parse()
                    .map_err(|_| VersionError::InvalidEpoch(source.to_string()))?,
                rest,
            ),
            None => (0, lowered.as_str()),
        };
        let (main, local) = match rest.split_once('+') {
            Some((main, local)) => (main, Some(local)),
            None => (rest, None),
        };

        Ok(Self {
            source: source.to_string(),
            epoch,
            segments: parse_part(main, source)?,
            local: match local {
                Some(local) => parse_part(local, source)?,
                None => Vec::new(),
            },
        })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| cmp_segments(&self.segments, &other.segments))
            .then_with(|| cmp_segments(&self.local, &other.local))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({:?})", self.source)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

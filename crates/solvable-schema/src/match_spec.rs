//! Conda match specs: `name [version [build]]`.
//!
//! Accepted forms:
//!
//! - `numpy`, `numpy 1.26.*`, `numpy >=1.26,<2 py312*`
//! - `numpy=1.26`, `numpy=1.26.4=py312h_0`, `numpy==1.26.4`, `numpy>=1.26`
//! - `conda-forge::numpy`, `numpy[version='>=1.26', build=py312*]`

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;

use crate::version::Version;
use crate::version_spec::{VersionSpec, VersionSpecError};

/// Errors produced while parsing a [`MatchSpec`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchSpecError {
    /// The spec is empty (or only a comment).
    #[error("empty match spec")]
    Empty,

    /// The spec does not start with a package name.
    #[error("missing package name in '{0}'")]
    MissingName(String),

    /// More than three whitespace separated parts.
    #[error("too many parts in match spec '{0}'")]
    TooManyParts(String),

    /// A `[...]` section is not closed or has an invalid entry.
    #[error("invalid bracket section in '{0}'")]
    InvalidBrackets(String),

    /// The version part could not be parsed.
    #[error("invalid version in match spec '{spec}': {source}")]
    InvalidVersion {
        /// The full spec text.
        spec: String,
        /// The underlying constraint error.
        source: VersionSpecError,
    },
}

/// Matches a build string exactly or through a `*` glob.
#[derive(Debug, Clone)]
pub struct BuildMatcher {
    source: String,
    glob: Option<Regex>,
}

impl BuildMatcher {
    fn new(source: &str) -> Self {
        let glob = source.contains('*').then(|| {
            let pattern = source
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            Regex::new(&format!("^{pattern}$"))
        });
        Self {
            source: source.to_string(),
            glob: glob.and_then(Result::ok),
        }
    }

    /// The build pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Test a concrete build string.
    pub fn matches(&self, build: &str) -> bool {
        match &self.glob {
            Some(re) => re.is_match(build),
            None => self.source == build,
        }
    }
}

/// A parsed match spec.
///
/// # Example
///
/// ```
/// use solvable_schema::MatchSpec;
///
/// let spec: MatchSpec = "python 3.12.* *_cpython".parse().unwrap();
/// assert_eq!(spec.name(), "python");
/// assert!(spec.matches("python", &"3.12.4".parse().unwrap(), "h1234_0_cpython"));
/// assert!(!spec.matches("python", &"3.11.0".parse().unwrap(), "h1234_0_cpython"));
/// ```
#[derive(Debug, Clone)]
pub struct MatchSpec {
    source: String,
    name: String,
    version: Option<VersionSpec>,
    build: Option<BuildMatcher>,
}

impl MatchSpec {
    /// The package name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version constraint, if any.
    pub fn version(&self) -> Option<&VersionSpec> {
        self.version.as_ref()
    }

    /// The build matcher, if any.
    pub fn build(&self) -> Option<&BuildMatcher> {
        self.build.as_ref()
    }

    /// The spec text as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Test a concrete `(name, version, build)` triple.
    pub fn matches(&self, name: &str, version: &Version, build: &str) -> bool {
        self.name == name
            && self.version.as_ref().is_none_or(|v| v.matches(version))
            && self.build.as_ref().is_none_or(|b| b.matches(build))
    }
}

/// The package name of a requirement string, without parsing the rest.
///
/// Works on anything that starts with a name, including unparsed pin
/// expressions and specs such as `numpy>=1.2`.
///
/// ```
/// use solvable_schema::spec_name;
///
/// assert_eq!(spec_name("numpy >=1.2"), "numpy");
/// assert_eq!(spec_name("numpy>=1.2"), "numpy");
/// assert_eq!(spec_name("  libblas"), "libblas");
/// ```
pub fn spec_name(spec: &str) -> &str {
    let spec = spec.trim();
    let end = spec
        .find(|c: char| c.is_whitespace() || matches!(c, '=' | '<' | '>' | '!' | '~' | '['))
        .unwrap_or(spec.len());
    &spec[..end]
}

/// Raw version and build strings of a spec, as conda-build sees them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawParts {
    /// The package name.
    pub name: String,
    /// The version text, if present.
    pub version: Option<String>,
    /// The build text, if present.
    pub build: Option<String>,
}

impl RawParts {
    /// Split a spec into name, version and build text without validating them.
    ///
    /// # Errors
    ///
    /// Returns [`MatchSpecError`] for empty specs, a missing name, malformed
    /// brackets or more than three parts.
    pub fn parse(input: &str) -> Result<Self, MatchSpecError> {
        let text = input.split('#').next().unwrap_or_default().trim();
        if text.is_empty() {
            return Err(MatchSpecError::Empty);
        }

        let (text, bracket) = split_brackets(text, input)?;
        let text = text.rsplit_once("::").map_or(text, |(_, rest)| rest).trim();

        let name = spec_name(text);
        if name.is_empty() {
            return Err(MatchSpecError::MissingName(input.to_string()));
        }
        let (mut version, mut build) = split_version_build(text[name.len()..].trim(), input)?;

        if let Some(v) = bracket.version {
            version = Some(v);
        }
        if let Some(b) = bracket.build {
            build = Some(b);
        }

        Ok(Self {
            name: name.to_string(),
            version,
            build,
        })
    }
}

#[derive(Default)]
struct Bracket {
    version: Option<String>,
    build: Option<String>,
}

fn split_brackets<'a>(text: &'a str, input: &str) -> Result<(&'a str, Bracket), MatchSpecError> {
    let Some(start) = text.find('[') else {
        return Ok((text, Bracket::default()));
    };
    let inner = text[start + 1..]
        .strip_suffix(']')
        .ok_or_else(|| MatchSpecError::InvalidBrackets(input.to_string()))?;

    let mut bracket = Bracket::default();
    for entry in inner.split(',').filter(|e| !e.trim().is_empty()) {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| MatchSpecError::InvalidBrackets(input.to_string()))?;
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        match key.trim() {
            "version" => bracket.version = Some(value),
            "build" => bracket.build = Some(value),
            _ => {}
        }
    }
    Ok((&text[..start], bracket))
}

fn is_operator_char(c: char) -> bool {
    matches!(c, '=' | '<' | '>' | '!' | '~' | ',' | '|')
}

fn split_version_build(
    rest: &str,
    input: &str,
) -> Result<(Option<String>, Option<String>), MatchSpecError> {
    if rest.is_empty() {
        return Ok((None, None));
    }

    // Glue operators that were separated from their operand (`>= 1.2`,
    // `>=1.2 , <2`) back together before splitting off the build.
    let mut tokens: Vec<String> = Vec::new();
    for token in rest.split_whitespace() {
        let glue = tokens
            .last()
            .is_some_and(|prev| prev.ends_with(is_operator_char))
            || token.starts_with([',', '|']);
        match tokens.last_mut() {
            Some(prev) if glue => prev.push_str(token),
            _ => tokens.push(token.to_string()),
        }
    }

    match tokens.as_slice() {
        [single] => {
            // `=1.2=build` is the conda `name=version=build` form; a lone
            // `=1.2` stays fuzzy and is left for the version parser.
            if let Some(body) = single.strip_prefix('=').filter(|b| !b.starts_with('=')) {
                if let Some((version, build)) = body.split_once('=') {
                    if !version.is_empty()
                        && !build.is_empty()
                        && !version.contains(is_operator_char)
                        && !build.contains(is_operator_char)
                    {
                        return Ok((Some(version.to_string()), Some(build.to_string())));
                    }
                }
            }
            Ok((Some(single.clone()), None))
        }
        [version, build] => Ok((Some(version.clone()), Some(build.clone()))),
        _ => Err(MatchSpecError::TooManyParts(input.to_string())),
    }
}

impl FromStr for MatchSpec {
    type Err = MatchSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = RawParts::parse(s)?;
        let version = match raw.version.as_deref() {
            None => None,
            Some(text) => Some(text.parse::<VersionSpec>().map_err(|source| {
                MatchSpecError::InvalidVersion {
                    spec: s.to_string(),
                    source,
                }
            })?),
        };
        let build = raw.build.as_deref().map(BuildMatcher::new);

        Ok(Self {
            source: s.trim().to_string(),
            name: raw.name,
            version,
            build,
        })
    }
}

impl fmt::Display for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

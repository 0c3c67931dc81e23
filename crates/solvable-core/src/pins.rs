//! Pin expression evaluation.
//!
//! Run requirements may reference the concrete versions resolved for host
//! or build, either through `pin_compatible(...)` expressions or through the
//! variant's `pin_run_as_build` table. This module turns those into version
//! ranges.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use solvable_schema::{Component, Version, spec_name};
use thiserror::Error;

use crate::requirements::RequirementSet;

/// Requirements dropped after pinning. `parquet-cpp` produces a self
/// reference for `arrow-cpp`.
pub const PROBLEMATIC_REQS: [&str; 1] = ["parquet-cpp"];

pub const DEFAULT_MIN_PIN: &str = "x.x.x.x.x.x";
pub const DEFAULT_MAX_PIN: &str = "x";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    #[error("Very odd pinning: {0}!")]
    Malformed(String),

    #[error("Very odd pinning: {req}! Package {name} not found in host or build")]
    MissingDependency { req: String, name: String },

    #[error("Very odd pinning: {req}! Package {name} found but no version")]
    MissingVersion { req: String, name: String },

    #[error("Build string cannot be given for pin_compatible with exact=True! {0}")]
    ExactWithBuild(String),

    #[error("No version or lower bound found for pin_compatible!")]
    NoVersion,

    #[error("numpy x.x specified, but numpy not in build requirements.")]
    NumpyNotInBuild,

    #[error("cannot pin against version '{0}'")]
    InvalidVersion(String),
}

/// A `pin_run_as_build` entry of a variant config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRunAsBuild {
    #[serde(default)]
    pub min_pin: Option<String>,
    #[serde(default)]
    pub max_pin: Option<String>,
}

impl PinRunAsBuild {
    /// A single pin string (`x.x`) is used for both bounds.
    pub fn both(pin: &str) -> Self {
        Self {
            min_pin: Some(pin.to_string()),
            max_pin: Some(pin.to_string()),
        }
    }
}

fn pin_len(pin: &str) -> usize {
    pin.split('.').count()
}

fn bump(component: &Component) -> String {
    match component {
        Component::Num(n) => (n + 1).to_string(),
        other => {
            let mut text = other.to_string();
            match text.pop() {
                Some(last) => {
                    text.push(char::from_u32(last as u32 + 1).unwrap_or(last));
                    text
                }
                None => text,
            }
        }
    }
}

fn join_tokens(tokens: &[&Component], nesting: Option<usize>, bump_last: bool) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if bump_last && i + 1 == tokens.len() {
            out.push_str(&bump(token));
        } else {
            out.push_str(&token.to_string());
        }
        if Some(i) != nesting {
            out.push('.');
        }
    }
    if out.ends_with('.') {
        out.pop();
    }
    out
}

/// Compute a `>=lower,<upper` range from pin expressions.
///
/// `min_pin`/`max_pin` are `x` patterns; their number of components is how
/// many version components are kept. The upper bound bumps its last kept
/// component and gets an `a0` pre-release suffix so pre-releases of the next
/// version are excluded.
///
/// ```
/// use solvable_core::pins::apply_pin_expressions;
///
/// assert_eq!(apply_pin_expressions("1.2.3", Some("x.x.x.x.x.x"), Some("x")).unwrap(), ">=1.2.3,<2.0a0");
/// assert_eq!(apply_pin_expressions("1.2.3", Some("x.x.x.x.x.x"), Some("x.x")).unwrap(), ">=1.2.3,<1.3.0a0");
/// assert_eq!(apply_pin_expressions("1.1.1k", Some("x.x.x"), Some("x.x.x")).unwrap(), ">=1.1.1k,<1.1.2a");
/// ```
pub fn apply_pin_expressions(
    version: &str,
    min_pin: Option<&str>,
    max_pin: Option<&str>,
) -> Result<String, PinError> {
    let base = version
        .strip_suffix(".*")
        .or_else(|| version.strip_suffix('*'))
        .unwrap_or(version);
    let parsed: Version = base
        .parse()
        .map_err(|_| PinError::InvalidVersion(version.to_string()))?;

    let segments = parsed.segments();
    let nesting = segments.len().checked_sub(1);
    let flat: Vec<&Component> = segments.iter().flatten().collect();

    let lower = min_pin
        .map(pin_len)
        .map(|n| join_tokens(&flat[..n.min(flat.len())], nesting, false))
        .filter(|s| !s.is_empty());
    let upper = max_pin
        .map(|p| pin_len(p).min(flat.len()))
        .filter(|n| *n > 0)
        .map(|n| {
            let mut upper = join_tokens(&flat[..n], nesting, true);
            if flat.get(n).is_some_and(|c| c.is_alpha()) {
                upper.push('a');
            } else {
                upper.push_str(".0a0");
            }
            upper
        });

    let mut parts = Vec::new();
    if let Some(lower) = lower {
        // A pre-release sorts below its truncated lower bound; keep it
        // installable by anchoring on the full version instead.
        let below = lower
            .parse::<Version>()
            .is_ok_and(|lower_version| parsed < lower_version);
        if below {
            parts.push(format!(">={version}"));
        } else {
            parts.push(format!(">={lower}"));
        }
    }
    if let Some(upper) = upper {
        parts.push(format!("<{upper}"));
    }
    Ok(parts.join(","))
}

/// A parsed `pin_compatible(name, ...)` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinCompatible {
    pub name: String,
    pub lower_bound: Option<String>,
    pub upper_bound: Option<String>,
    pub min_pin: Option<String>,
    pub max_pin: Option<String>,
    pub exact: bool,
    /// Build string written after the closing parenthesis.
    pub build: Option<String>,
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

fn optional_arg(value: &str) -> Option<String> {
    let value = strip_quotes(value);
    (!value.is_empty() && value != "None").then(|| value.to_string())
}

impl PinCompatible {
    pub fn is_pin_compatible(req: &str) -> bool {
        req.contains("pin_compatible(")
    }

    pub fn parse(req: &str) -> Result<Self, PinError> {
        let malformed = || PinError::Malformed(req.to_string());
        let body = req
            .trim()
            .strip_prefix("pin_compatible(")
            .ok_or_else(malformed)?;
        let (args, trailing) = body.rsplit_once(')').ok_or_else(malformed)?;
        let build = Some(trailing.trim().to_string()).filter(|b| !b.is_empty());

        let mut parts = args.split(',');
        let name = strip_quotes(parts.next().unwrap_or_default()).to_string();
        if name.is_empty() {
            return Err(malformed());
        }

        let mut pin = Self {
            name,
            lower_bound: None,
            upper_bound: None,
            min_pin: Some(DEFAULT_MIN_PIN.to_string()),
            max_pin: Some(DEFAULT_MAX_PIN.to_string()),
            exact: false,
            build,
        };

        let mut position = 0;
        for part in parts.map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = match part.split_once('=') {
                Some((key, value)) => (key.trim(), value),
                None => {
                    position += 1;
                    let key = match position {
                        1 => "lower_bound",
                        2 => "upper_bound",
                        3 => "min_pin",
                        4 => "max_pin",
                        5 => "exact",
                        _ => return Err(malformed()),
                    };
                    (key, part)
                }
            };
            match key {
                "lower_bound" => pin.lower_bound = optional_arg(value),
                "upper_bound" => pin.upper_bound = optional_arg(value),
                "min_pin" => pin.min_pin = optional_arg(value),
                "max_pin" => pin.max_pin = optional_arg(value),
                "exact" => pin.exact = strip_quotes(value).eq_ignore_ascii_case("true"),
                _ => return Err(malformed()),
            }
        }
        Ok(pin)
    }

    /// The version range for a dependency resolved at `version`/`build`.
    pub fn evaluate(&self, version: &str, build: &str) -> Result<String, PinError> {
        if self.exact {
            return Ok(format!("{version} {build}").trim().to_string());
        }
        let base = self.lower_bound.as_deref().unwrap_or(version);
        if base.is_empty() {
            return Err(PinError::NoVersion);
        }
        match &self.upper_bound {
            Some(upper) if self.min_pin.is_some() || self.lower_bound.is_some() => {
                Ok(format!(">={base},<{upper}"))
            }
            Some(upper) => Ok(format!("<{upper}")),
            None => apply_pin_expressions(base, self.min_pin.as_deref(), self.max_pin.as_deref()),
        }
    }

    /// The requirement used when the dependency cannot be looked up.
    pub fn unpinned(&self) -> String {
        match &self.build {
            Some(build) => format!("{} * {build}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Concrete `version build` of resolved host or build dependencies by name.
#[derive(Debug, Clone, Default)]
pub struct PinLookup(HashMap<String, Vec<String>>);

impl PinLookup {
    /// Build from solved `name version build` strings, skipping `exclude`.
    pub fn new<S: AsRef<str>>(resolved: &[String], exclude: &[S]) -> Self {
        let mut map = HashMap::new();
        for dep in resolved {
            let mut tokens = dep.split_whitespace();
            let Some(name) = tokens.next() else { continue };
            if exclude.iter().any(|e| e.as_ref() == name) {
                continue;
            }
            map.insert(name.to_string(), tokens.map(str::to_string).collect());
        }
        Self(map)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn version(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|t| t.first()).map(String::as_str)
    }

    pub fn build(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|t| t.get(1)).map(String::as_str)
    }
}

/// Per-output inputs of [`apply_pins`].
#[derive(Debug, Clone, Copy)]
pub struct PinContext<'a> {
    pub is_cross: bool,
    pub noarch: bool,
    pub strict: bool,
    pub pin_run_as_build: &'a BTreeMap<String, PinRunAsBuild>,
    pub variant: &'a BTreeMap<String, String>,
}

fn replace_pin_compatible(req: &str, lookup: &PinLookup, strict: bool) -> Result<String, PinError> {
    let pin = match PinCompatible::parse(req) {
        Ok(pin) => pin,
        Err(err) if strict => return Err(err),
        Err(err) => {
            tracing::warn!("Failed to parse {req}, dropping the pin: {err}");
            let name = req
                .split_once("pin_compatible(")
                .and_then(|(_, args)| args.split([',', ')']).next())
                .map_or_else(|| spec_name(req), strip_quotes);
            return Ok(name.to_string());
        }
    };

    let evaluated = match lookup.version(&pin.name) {
        None if !lookup.contains(&pin.name) => Err(PinError::MissingDependency {
            req: req.to_string(),
            name: pin.name.clone(),
        }),
        None => Err(PinError::MissingVersion {
            req: req.to_string(),
            name: pin.name.clone(),
        }),
        Some(version) => {
            let build = lookup.build(&pin.name).unwrap_or_default();
            if pin.exact && pin.build.is_some() && !build.is_empty() {
                Err(PinError::ExactWithBuild(req.to_string()))
            } else {
                pin.evaluate(version, build)
            }
        }
    };

    match evaluated {
        Ok(range) => {
            let mut out = format!("{} {range}", pin.name);
            if let Some(build) = &pin.build {
                out.push(' ');
                out.push_str(build);
            }
            Ok(out.trim().to_string())
        }
        Err(err) if strict => Err(err),
        Err(err) => {
            tracing::debug!("pin_compatible fallback for {req}: {err}");
            Ok(pin.unpinned())
        }
    }
}

fn pin_from_build(dep: &str, lookup: &PinLookup, ctx: &PinContext<'_>) -> Result<String, PinError> {
    let tokens: Vec<&str> = dep.split_whitespace().collect();
    let Some(&name) = tokens.first() else {
        return Ok(dep.to_string());
    };
    let build = tokens.get(2).copied().unwrap_or_default();
    let version = lookup
        .version(name)
        .filter(|v| !v.is_empty())
        .or_else(|| ctx.variant.get(name).map(String::as_str))
        .and_then(|v| v.split_whitespace().next());

    let pin = match (version, ctx.pin_run_as_build.get(name)) {
        (Some(version), Some(cfg))
            if !(name == "python" && ctx.noarch) && lookup.contains(name) =>
        {
            Some(apply_pin_expressions(
                version,
                cfg.min_pin.as_deref(),
                cfg.max_pin.as_deref(),
            )?)
        }
        _ if dep.starts_with("numpy") && dep.contains("x.x") => {
            let version = lookup.version(name).ok_or(PinError::NumpyNotInBuild)?;
            Some(apply_pin_expressions(version, Some("x.x"), Some("x.x"))?)
        }
        _ => None,
    };

    Ok(match pin {
        Some(pin) => [name, pin.as_str(), build]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" "),
        None => dep.to_string(),
    })
}

/// Evaluate pins in `requirements` against the resolved host or build set.
///
/// Cross-compiling outputs pin against `host`, native ones against `build`.
/// Output names are removed from the lookup so an output never pins against
/// itself. Problematic requirements are dropped afterwards.
pub fn apply_pins<S: AsRef<str>>(
    requirements: &RequirementSet,
    host: &[String],
    build: &[String],
    output_names: &[S],
    ctx: &PinContext<'_>,
) -> Result<RequirementSet, PinError> {
    let pin_deps = if ctx.is_cross { host } else { build };
    let lookup = PinLookup::new(pin_deps, output_names);

    let mut pinned = RequirementSet::new();
    for req in requirements.iter() {
        let resolved = if PinCompatible::is_pin_compatible(req) {
            replace_pin_compatible(req, &lookup, ctx.strict)?
        } else {
            match pin_from_build(req, &lookup, ctx) {
                Ok(dep) => dep,
                Err(err) if ctx.strict => return Err(err),
                Err(err) => {
                    tracing::warn!("Failed to apply pin for {req}, falling back to req: {err}");
                    if req.contains("x.x") {
                        spec_name(req).to_string()
                    } else {
                        req.to_string()
                    }
                }
            }
        };
        pinned.push(&resolved);
    }

    Ok(pinned
        .iter()
        .filter(|req| !PROBLEMATIC_REQS.contains(&spec_name(req)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        pin_run_as_build: &'a BTreeMap<String, PinRunAsBuild>,
        variant: &'a BTreeMap<String, String>,
    ) -> PinContext<'a> {
        PinContext {
            is_cross: false,
            noarch: false,
            strict: false,
            pin_run_as_build,
            variant,
        }
    }

    #[test]
    fn test_pin_expressions() {
        assert_eq!(
            apply_pin_expressions("1.2.3", Some(DEFAULT_MIN_PIN), Some(DEFAULT_MAX_PIN)).unwrap(),
            ">=1.2.3,<2.0a0"
        );
        assert_eq!(
            apply_pin_expressions("1.2.3", Some(DEFAULT_MIN_PIN), Some("x.x")).unwrap(),
            ">=1.2.3,<1.3.0a0"
        );
        assert_eq!(
            apply_pin_expressions("1.2.3", Some("x.x"), Some("x.x.x")).unwrap(),
            ">=1.2,<1.2.4.0a0"
        );
        assert_eq!(
            apply_pin_expressions("1.2", Some("x.x"), Some("x.x.x.x")).unwrap(),
            ">=1.2,<1.3.0a0"
        );
        assert_eq!(
            apply_pin_expressions("3.10.*", Some("x.x"), Some("x.x")).unwrap(),
            ">=3.10,<3.11.0a0"
        );
        assert_eq!(
            apply_pin_expressions("1.2.3", None, Some("x")).unwrap(),
            "<2.0a0"
        );
    }

    #[test]
    fn test_pre_release_lower_bound() {
        assert_eq!(
            apply_pin_expressions("1.2.3rc1", Some("x.x.x"), Some("x")).unwrap(),
            ">=1.2.3rc1,<2.0a0"
        );
    }

    #[test]
    fn test_pin_compatible_parsing() {
        let pin = PinCompatible::parse("pin_compatible('numpy', max_pin='x.x') py*").unwrap();
        assert_eq!(pin.name, "numpy");
        assert_eq!(pin.max_pin.as_deref(), Some("x.x"));
        assert_eq!(pin.min_pin.as_deref(), Some(DEFAULT_MIN_PIN));
        assert_eq!(pin.build.as_deref(), Some("py*"));

        let pin = PinCompatible::parse("pin_compatible(\"libfoo\", \"1.0\", \"3.0\")").unwrap();
        assert_eq!(pin.lower_bound.as_deref(), Some("1.0"));
        assert_eq!(pin.upper_bound.as_deref(), Some("3.0"));

        assert!(PinCompatible::parse("foo pin_compatible('x')").is_err());
    }

    #[test]
    fn test_pin_compatible_evaluation() {
        let exact = PinCompatible::parse("pin_compatible('numpy', exact=True)").unwrap();
        assert_eq!(exact.evaluate("1.26.4", "py312h_0").unwrap(), "1.26.4 py312h_0");

        let bounded = PinCompatible::parse("pin_compatible('numpy', upper_bound='3.0')").unwrap();
        assert_eq!(bounded.evaluate("1.26.4", "py312h_0").unwrap(), ">=1.26.4,<3.0");

        let lower = PinCompatible::parse("pin_compatible('numpy', lower_bound='1.20', max_pin='x')").unwrap();
        assert_eq!(lower.evaluate("1.26.4", "py312h_0").unwrap(), ">=1.20,<2.0a0");

        let upper_only =
            PinCompatible::parse("pin_compatible('numpy', min_pin=None, upper_bound='3.0')").unwrap();
        assert_eq!(upper_only.evaluate("1.26.4", "").unwrap(), "<3.0");
    }

    #[test]
    fn test_apply_pins_uses_build_for_native() {
        let prab = BTreeMap::new();
        let variant = BTreeMap::new();
        let reqs: RequirementSet = ["pin_compatible('numpy', max_pin='x.x')", "python", "parquet-cpp"]
            .into_iter()
            .collect();
        let host = vec!["numpy 2.0.0 py312h_0".to_string()];
        let build = vec!["numpy 1.26.4 py312h_0".to_string()];

        let native = apply_pins(&reqs, &host, &build, &["mypkg"], &ctx(&prab, &variant)).unwrap();
        assert_eq!(native.to_vec(), vec!["numpy >=1.26.4,<1.27.0a0", "python"]);

        let mut cross = ctx(&prab, &variant);
        cross.is_cross = true;
        let cross = apply_pins(&reqs, &host, &build, &["mypkg"], &cross).unwrap();
        assert_eq!(cross.to_vec(), vec!["numpy >=2.0.0,<2.1.0a0", "python"]);
    }

    #[test]
    fn test_missing_pin_target_is_lenient_by_default() {
        let prab = BTreeMap::new();
        let variant = BTreeMap::new();
        let reqs: RequirementSet = ["pin_compatible('libfoo') *_cpu", "pin_compatible('libbar')"]
            .into_iter()
            .collect();

        let lenient = apply_pins(&reqs, &[], &[], &[] as &[&str], &ctx(&prab, &variant)).unwrap();
        assert_eq!(lenient.to_vec(), vec!["libfoo * *_cpu", "libbar"]);

        let mut strict = ctx(&prab, &variant);
        strict.strict = true;
        let err = apply_pins(&reqs, &[], &[], &[] as &[&str], &strict).unwrap_err();
        assert!(matches!(err, PinError::MissingDependency { .. }));
    }

    #[test]
    fn test_self_reference_is_not_a_pin_target() {
        let prab = BTreeMap::new();
        let variant = BTreeMap::new();
        let reqs: RequirementSet = ["pin_compatible('mypkg')"].into_iter().collect();
        let build = vec!["mypkg 1.0 h_0".to_string()];
        let out = apply_pins(&reqs, &[], &build, &["mypkg"], &ctx(&prab, &variant)).unwrap();
        assert_eq!(out.to_vec(), vec!["mypkg"]);
    }

    #[test]
    fn test_pin_run_as_build() {
        let mut prab = BTreeMap::new();
        prab.insert("python".to_string(), PinRunAsBuild::both("x.x"));
        let variant = BTreeMap::new();
        let reqs: RequirementSet = ["python", "numpy x.x", "zlib"].into_iter().collect();
        let build = vec![
            "python 3.12.4 h_0_cpython".to_string(),
            "numpy 1.26.4 py312h_0".to_string(),
        ];

        let out = apply_pins(&reqs, &[], &build, &[] as &[&str], &ctx(&prab, &variant)).unwrap();
        assert_eq!(
            out.to_vec(),
            vec!["python >=3.12,<3.13.0a0", "numpy >=1.26,<1.27.0a0", "zlib"]
        );

        let mut noarch = ctx(&prab, &variant);
        noarch.noarch = true;
        let out = apply_pins(&reqs, &[], &build, &[] as &[&str], &noarch).unwrap();
        assert_eq!(out.to_vec()[0], "python");
    }

    #[test]
    fn test_numpy_xx_without_build_falls_back() {
        let prab = BTreeMap::new();
        let variant = BTreeMap::new();
        let reqs: RequirementSet = ["numpy x.x"].into_iter().collect();
        let out = apply_pins(&reqs, &[], &[], &[] as &[&str], &ctx(&prab, &variant)).unwrap();
        assert_eq!(out.to_vec(), vec!["numpy"]);
    }
}

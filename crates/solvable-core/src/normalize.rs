//! Spec normalization into conda-build form.
//!
//! conda-build reads `numpy 1.1` as `numpy 1.1.*`; the solver reads it as an
//! exact version. Normalizing rewrites every bare version clause so both agree.

use solvable_schema::{MatchSpecError, RawParts};
use thiserror::Error;

/// Clauses starting with one of these are left alone.
const NO_STAR_PREFIXES: [&str; 7] = ["!=", "==", ">", "<", ">=", "<=", "~="];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedSpecError {
    #[error("spec '{0}' has build but not version!")]
    BuildWithoutVersion(String),

    #[error("invalid spec '{spec}': {source}")]
    Parse {
        spec: String,
        source: MatchSpecError,
    },
}

/// Append `.*` to every bare `,`/`|` clause of a version constraint.
///
/// A clause is bare unless it starts with a comparison operator or already
/// contains `*`. A leading single `=` is dropped (`=1.2` is `1.2.*`).
pub fn munge_version_star(version: &str) -> String {
    let mut out = String::with_capacity(version.len() + 4);
    for (i, and_part) in version.split(',').enumerate() {
        if i > 0 {
            out.push(',');
        }
        for (j, clause) in and_part.split('|').enumerate() {
            if j > 0 {
                out.push('|');
            }
            let clause = clause.trim();
            if NO_STAR_PREFIXES.iter().any(|p| clause.starts_with(p)) || clause.contains('*') {
                out.push_str(clause);
            } else {
                out.push_str(clause.strip_prefix('=').unwrap_or(clause));
                out.push_str(".*");
            }
        }
    }
    out
}

/// Normalize a requirement spec to `name [version [build]]` with munged stars.
///
/// ```
/// use solvable_core::normalize::normalize;
///
/// assert_eq!(normalize("numpy 1.1").unwrap(), "numpy 1.1.*");
/// assert_eq!(normalize("numpy >=1.1").unwrap(), "numpy >=1.1");
/// assert_eq!(normalize("numpy 1.1|2.0").unwrap(), "numpy 1.1.*|2.0.*");
/// ```
pub fn normalize(spec: &str) -> Result<String, MalformedSpecError> {
    let parts = RawParts::parse(spec).map_err(|source| MalformedSpecError::Parse {
        spec: spec.to_string(),
        source,
    })?;

    let version = parts.version.filter(|v| !v.is_empty());
    let build = parts.build.filter(|b| !b.is_empty());
    if build.is_some() && version.is_none() {
        return Err(MalformedSpecError::BuildWithoutVersion(spec.to_string()));
    }

    let mut out = parts.name;
    if let Some(version) = version {
        out.push(' ');
        out.push_str(&munge_version_star(&version));
    }
    if let Some(build) = build {
        out.push(' ');
        out.push_str(&build);
    }
    Ok(out)
}

/// Normalize a list of specs, failing on the first malformed one.
pub fn normalize_all<S: AsRef<str>>(specs: &[S]) -> Result<Vec<String>, MalformedSpecError> {
    specs.iter().map(|s| normalize(s.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_munging() {
        assert_eq!(normalize("numpy 1.1").unwrap(), "numpy 1.1.*");
        assert_eq!(normalize("numpy >=1.1").unwrap(), "numpy >=1.1");
        assert_eq!(normalize("numpy 1.1|2.0").unwrap(), "numpy 1.1.*|2.0.*");
        assert_eq!(normalize("numpy =1.1").unwrap(), "numpy 1.1.*");
        assert_eq!(normalize("numpy=1.1").unwrap(), "numpy 1.1.*");
        assert_eq!(normalize("numpy >=1.1,<2|3").unwrap(), "numpy >=1.1,<2|3.*");
        assert_eq!(normalize("numpy ~=1.1").unwrap(), "numpy ~=1.1");
        assert_eq!(normalize("numpy 1.*").unwrap(), "numpy 1.*");
        assert_eq!(normalize("numpy").unwrap(), "numpy");
    }

    #[test]
    fn test_build_string_is_kept() {
        assert_eq!(
            normalize("python 3.12 *_cpython").unwrap(),
            "python 3.12.* *_cpython"
        );
        assert_eq!(
            normalize("numpy=1.26.4=py312h_0").unwrap(),
            "numpy 1.26.4.* py312h_0"
        );
    }

    #[test]
    fn test_build_without_version_fails() {
        assert_eq!(
            normalize("pkg[build=buildstr]").unwrap_err(),
            MalformedSpecError::BuildWithoutVersion("pkg[build=buildstr]".to_string())
        );
        assert!(matches!(
            normalize(""),
            Err(MalformedSpecError::Parse { .. })
        ));
    }

    #[test]
    fn test_idempotent() {
        for spec in [
            "numpy 1.1",
            "numpy >=1.1",
            "numpy 1.1|2.0",
            "python 3.12 *_cpython",
            "libblas * *mkl",
            "zlib =1.2,!=1.2.5",
            "openssl >=3.1.2,<4.0a0",
            "numpy=1.26.4=py312h_0",
        ] {
            let once = normalize(spec).unwrap();
            assert_eq!(normalize(&once).unwrap(), once, "not idempotent for {spec}");
        }
    }
}

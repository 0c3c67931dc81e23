//! Run exports: constraints a package injects into its dependents.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::match_spec::spec_name;

/// One of the five run-export buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RunExportKind {
    /// Added to run requirements of packages that have this in host.
    Weak,
    /// Added to host and run requirements of packages that have this in build.
    Strong,
    /// Added to run requirements of `noarch` packages.
    Noarch,
    /// Added to `run_constrained` like [`RunExportKind::Weak`].
    WeakConstrains,
    /// Added to `run_constrained` like [`RunExportKind::Strong`].
    StrongConstrains,
}

impl RunExportKind {
    /// All buckets in canonical order.
    pub const ALL: [Self; 5] = [
        Self::Weak,
        Self::Strong,
        Self::Noarch,
        Self::WeakConstrains,
        Self::StrongConstrains,
    ];

    /// The key used in recipes and metadata files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weak => "weak",
            Self::Strong => "strong",
            Self::Noarch => "noarch",
            Self::WeakConstrains => "weak_constrains",
            Self::StrongConstrains => "strong_constrains",
        }
    }
}

impl fmt::Display for RunExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunExportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown run export bucket: {s}"))
    }
}

/// The run exports of one package, or an aggregate over several.
///
/// All five buckets are always present. Merging is a bucket-wise set union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunExports {
    /// `weak` bucket.
    #[serde(default)]
    pub weak: BTreeSet<String>,
    /// `strong` bucket.
    #[serde(default)]
    pub strong: BTreeSet<String>,
    /// `noarch` bucket.
    #[serde(default)]
    pub noarch: BTreeSet<String>,
    /// `weak_constrains` bucket.
    #[serde(default)]
    pub weak_constrains: BTreeSet<String>,
    /// `strong_constrains` bucket.
    #[serde(default)]
    pub strong_constrains: BTreeSet<String>,
}

/// The result of canonicalizing raw run-exports metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Canonicalized {
    /// The canonical record.
    pub run_exports: RunExports,
    /// Mapping keys that are not run-export buckets; they were dropped.
    pub ignored_keys: Vec<String>,
}

fn collect_specs(value: &Value, into: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() {
                into.insert(s.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                if let Value::String(s) = item {
                    let s = s.trim();
                    if !s.is_empty() {
                        into.insert(s.to_string());
                    }
                }
            }
        }
        _ => {}
    }
}

impl RunExports {
    /// Borrow one bucket.
    pub fn bucket(&self, kind: RunExportKind) -> &BTreeSet<String> {
        match kind {
            RunExportKind::Weak => &self.weak,
            RunExportKind::Strong => &self.strong,
            RunExportKind::Noarch => &self.noarch,
            RunExportKind::WeakConstrains => &self.weak_constrains,
            RunExportKind::StrongConstrains => &self.strong_constrains,
        }
    }

    /// Mutably borrow one bucket.
    pub fn bucket_mut(&mut self, kind: RunExportKind) -> &mut BTreeSet<String> {
        match kind {
            RunExportKind::Weak => &mut self.weak,
            RunExportKind::Strong => &mut self.strong,
            RunExportKind::Noarch => &mut self.noarch,
            RunExportKind::WeakConstrains => &mut self.weak_constrains,
            RunExportKind::StrongConstrains => &mut self.strong_constrains,
        }
    }

    /// Whether every bucket is empty.
    pub fn is_empty(&self) -> bool {
        RunExportKind::ALL
            .into_iter()
            .all(|kind| self.bucket(kind).is_empty())
    }

    /// Union `other` into `self`, bucket by bucket.
    pub fn merge(&mut self, other: &RunExports) {
        for kind in RunExportKind::ALL {
            self.bucket_mut(kind)
                .extend(other.bucket(kind).iter().cloned());
        }
    }

    /// A copy without entries whose package name is in `names`.
    pub fn without_names<S: AsRef<str>>(&self, names: &[S]) -> RunExports {
        let mut out = self.clone();
        for kind in RunExportKind::ALL {
            out.bucket_mut(kind)
                .retain(|entry| !names.iter().any(|n| n.as_ref() == spec_name(entry)));
        }
        out
    }

    /// Canonicalize raw run-exports metadata.
    ///
    /// A single string or a flat list is the `weak` bucket; a mapping is read
    /// bucket by bucket. Keys that are not bucket names are reported in
    /// [`Canonicalized::ignored_keys`] and dropped. Anything else (including
    /// `null`) is empty.
    ///
    /// ```
    /// use serde_json::json;
    /// use solvable_schema::RunExports;
    ///
    /// let out = RunExports::from_value(&json!(["libzlib >=1.3,<2.0a0"]));
    /// assert!(out.run_exports.weak.contains("libzlib >=1.3,<2.0a0"));
    /// ```
    pub fn from_value(value: &Value) -> Canonicalized {
        let mut out = Canonicalized::default();
        match value {
            Value::String(_) | Value::Array(_) => {
                collect_specs(value, &mut out.run_exports.weak);
            }
            Value::Object(map) => {
                for (key, entries) in map {
                    match key.parse::<RunExportKind>() {
                        Ok(kind) => collect_specs(entries, out.run_exports.bucket_mut(kind)),
                        Err(_) => out.ignored_keys.push(key.clone()),
                    }
                }
            }
            _ => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RunExports {
        RunExports::from_value(&json!({
            "weak": ["libfoo >=1.2,<2.0a0"],
            "strong": ["libgcc >=13"],
            "strong_constrains": ["sysroot_linux-64 >=2.17"],
        }))
        .run_exports
    }

    #[test]
    fn test_canonical_forms() {
        let single = RunExports::from_value(&json!("libfoo 1.*"));
        assert_eq!(single.run_exports.weak.len(), 1);
        assert!(single.ignored_keys.is_empty());

        let mapping = RunExports::from_value(&json!({"weak": "a", "noarch": ["b"], "bogus": ["c"]}));
        assert!(mapping.run_exports.weak.contains("a"));
        assert!(mapping.run_exports.noarch.contains("b"));
        assert_eq!(mapping.ignored_keys, vec!["bogus".to_string()]);

        assert!(RunExports::from_value(&Value::Null).run_exports.is_empty());
    }

    #[test]
    fn test_merge_is_monotonic() {
        let a = sample();
        let b = RunExports::from_value(&json!({"weak": ["libbar"], "strong": ["libgcc >=13"]})).run_exports;

        let mut merged = a.clone();
        merged.merge(&b);
        for kind in RunExportKind::ALL {
            assert!(merged.bucket(kind).is_superset(a.bucket(kind)));
            assert!(merged.bucket(kind).is_superset(b.bucket(kind)));
        }

        let mut same = a.clone();
        same.merge(&RunExports::default());
        assert_eq!(same, a);
    }

    #[test]
    fn test_without_names() {
        let filtered = sample().without_names(&["libfoo"]);
        assert!(filtered.weak.is_empty());
        assert_eq!(filtered.strong.len(), 1);
    }
}

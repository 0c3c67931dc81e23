//! Repodata wire types.
//!
//! These mirror the `repodata.json` layout served by conda channels. Only the
//! fields the solver needs are modelled; unknown fields are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// The kind of a `noarch` package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoArchKind {
    /// Platform independent data or scripts.
    Generic,
    /// Pure python package installed into the target python.
    Python,
}

/// Accepts the legacy boolean `noarch: true` as well as `"generic"`/`"python"`.
fn deserialize_noarch<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<NoArchKind>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Kind(NoArchKind),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None | Some(Raw::Flag(false)) => None,
        Some(Raw::Flag(true)) => Some(NoArchKind::Generic),
        Some(Raw::Kind(kind)) => Some(kind),
    })
}

/// One package entry of a repodata file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageRecord {
    /// Package name.
    pub name: String,

    /// Version string (conda version syntax).
    pub version: String,

    /// Build string, e.g. `py312h1234_0`.
    pub build: String,

    /// Build number.
    #[serde(default)]
    pub build_number: u64,

    /// Run dependencies as match specs.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Constraints on packages that are not dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constrains: Vec<String>,

    /// Space or comma separated features tracked by this build.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub track_features: String,

    /// Upload timestamp in milliseconds (older records use seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    /// The subdir the record lives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,

    /// `noarch` kind, if any.
    #[serde(
        default,
        deserialize_with = "deserialize_noarch",
        skip_serializing_if = "Option::is_none"
    )]
    pub noarch: Option<NoArchKind>,

    /// SHA-256 of the artifact, if published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// MD5 of the artifact, if published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl PackageRecord {
    /// Create a record with the required fields and defaults for the rest.
    pub fn new(name: impl Into<String>, version: impl Into<String>, build: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            build: build.into(),
            build_number: 0,
            depends: Vec::new(),
            constrains: Vec::new(),
            track_features: String::new(),
            timestamp: None,
            subdir: None,
            noarch: None,
            sha256: None,
            md5: None,
        }
    }

    /// Number of tracked features; builds with features are de-prioritised.
    pub fn feature_count(&self) -> usize {
        self.track_features
            .split([' ', ','])
            .filter(|f| !f.is_empty())
            .count()
    }

    /// Timestamp normalised to milliseconds.
    pub fn timestamp_millis(&self) -> u64 {
        match self.timestamp {
            // Values below ~2001-09 in milliseconds are really seconds.
            Some(ts) if ts < 1_000_000_000_000 => ts * 1000,
            Some(ts) => ts,
            None => 0,
        }
    }
}

/// The `info` block of a repodata file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoDataInfo {
    /// The subdir this file describes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
}

/// A channel subdir's `repodata.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepoData {
    /// Repository metadata.
    #[serde(default)]
    pub info: RepoDataInfo,

    /// `.tar.bz2` artifacts keyed by file name.
    #[serde(default)]
    pub packages: BTreeMap<String, PackageRecord>,

    /// `.conda` artifacts keyed by file name.
    #[serde(default, rename = "packages.conda")]
    pub conda_packages: BTreeMap<String, PackageRecord>,

    /// File names removed from the channel.
    #[serde(default)]
    pub removed: Vec<String>,

    /// Repodata format version.
    #[serde(default)]
    pub repodata_version: u64,
}

impl RepoData {
    /// Iterate over `(file name, record)` pairs.
    ///
    /// When an artifact is published in both formats only the `.conda` entry
    /// is yielded.
    pub fn records(&self) -> impl Iterator<Item = (&str, &PackageRecord)> {
        let conda = self
            .conda_packages
            .iter()
            .map(|(name, record)| (name.as_str(), record));
        let tarballs = self
            .packages
            .iter()
            .filter(|(name, _)| {
                let stem = archive_stem(name);
                !self.conda_packages.contains_key(&format!("{stem}.conda"))
            })
            .map(|(name, record)| (name.as_str(), record));
        conda.chain(tarballs)
    }
}

/// The format of a conda artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    /// Legacy bzip2 compressed tarball.
    TarBz2,
    /// Zip container with zstd compressed `info-*` and `pkg-*` tarballs.
    Conda,
}

impl ArchiveType {
    /// Detect the archive type from a file name.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.ends_with(".tar.bz2") {
            Some(Self::TarBz2)
        } else if filename.ends_with(".conda") {
            Some(Self::Conda)
        } else {
            None
        }
    }

    /// The file extension including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::TarBz2 => ".tar.bz2",
            Self::Conda => ".conda",
        }
    }
}

/// Strip the archive extension from an artifact file name.
///
/// ```
/// use solvable_schema::archive_stem;
///
/// assert_eq!(archive_stem("zlib-1.3-h0_1.conda"), "zlib-1.3-h0_1");
/// assert_eq!(archive_stem("zlib-1.3-h0_1.tar.bz2"), "zlib-1.3-h0_1");
/// ```
pub fn archive_stem(filename: &str) -> &str {
    ArchiveType::from_filename(filename)
        .and_then(|kind| filename.strip_suffix(kind.extension()))
        .unwrap_or(filename)
}

/// Split an artifact file name into `(name, version, build)`.
///
/// Package names may contain dashes, versions and builds may not.
pub fn split_artifact_name(filename: &str) -> Option<(&str, &str, &str)> {
    let stem = archive_stem(filename);
    let (rest, build) = stem.rsplit_once('-')?;
    let (name, version) = rest.rsplit_once('-')?;
    Some((name, version, build))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repodata_parsing() {
        let json = r#"{
            "info": {"subdir": "linux-64"},
            "packages": {
                "zlib-1.3-h0_1.tar.bz2": {"name": "zlib", "version": "1.3", "build": "h0_1", "build_number": 1, "depends": [], "timestamp": 1700000000},
                "old-1.0-0.tar.bz2": {"name": "old", "version": "1.0", "build": "0", "noarch": true}
            },
            "packages.conda": {
                "zlib-1.3-h0_1.conda": {"name": "zlib", "version": "1.3", "build": "h0_1", "build_number": 1, "depends": [], "noarch": "python", "license": "Zlib"}
            },
            "repodata_version": 1
        }"#;
        let repodata: RepoData = serde_json::from_str(json).unwrap();
        assert_eq!(repodata.info.subdir.as_deref(), Some("linux-64"));

        let names: Vec<&str> = repodata.records().map(|(f, _)| f).collect();
        assert_eq!(names, vec!["zlib-1.3-h0_1.conda", "old-1.0-0.tar.bz2"]);

        assert_eq!(
            repodata.packages["old-1.0-0.tar.bz2"].noarch,
            Some(NoArchKind::Generic)
        );
        assert_eq!(
            repodata.conda_packages["zlib-1.3-h0_1.conda"].noarch,
            Some(NoArchKind::Python)
        );
        assert_eq!(
            repodata.packages["zlib-1.3-h0_1.tar.bz2"].timestamp_millis(),
            1_700_000_000_000
        );
    }

    #[test]
    fn test_split_artifact_name() {
        assert_eq!(
            split_artifact_name("ca-certificates-2024.2.2-hbcca054_0.conda"),
            Some(("ca-certificates", "2024.2.2", "hbcca054_0"))
        );
        assert_eq!(split_artifact_name("garbage"), None);
    }

    #[test]
    fn test_feature_count() {
        let mut record = PackageRecord::new("python", "3.9", "0_pypy");
        assert_eq!(record.feature_count(), 0);
        record.track_features = "pypy".to_string();
        assert_eq!(record.feature_count(), 1);
    }
}

//! Synthetic packages for platform capabilities.
//!
//! Recipes constrain the machine they run on through `__glibc`, `__cuda`,
//! `__osx` and friends. No channel ships these, so the registry generates a
//! catalog of every version a build machine might provide, scoped per subdir.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use solvable_schema::{ALL_PLATFORMS, NoArchKind, PackageRecord, RepoData, RepoDataInfo, Subdir};

use crate::io::MetadataFetchError;

/// Channel label reported for virtual packages in solutions.
pub const VIRTUAL_CHANNEL: &str = "@virtual";

pub const MAX_GLIBC_MINOR: u32 = 50;

/// Highest major and minor generated for forward-looking CUDA and macOS
/// versions.
pub const MAX_FUTURE_VERSION: u32 = 16;

pub const MINIMUM_CUDA_VERS: [&str; 13] = [
    "9.2", "10.0", "10.1", "10.2", "11.0", "11.1", "11.2", "11.3", "11.4", "11.5", "11.6",
    "11.7", "11.8",
];

/// macOS versions only available to `osx-64`.
pub const LEGACY_OSX_VERS: [&str; 8] = [
    "10.9", "10.10", "10.11", "10.12", "10.13", "10.14", "10.15", "10.16",
];

pub const ARCHSPEC_NAMES: [&str; 10] = [
    "x86", "x86_64", "aarch64", "armv6l", "armv7l", "ppc64le", "ppc64", "s390x", "riscv32",
    "riscv64",
];

pub const ARCHSPEC_X86_64_VERSIONS: [&str; 4] = ["x86_64_v1", "x86_64_v2", "x86_64_v3", "x86_64_v4"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualPackage {
    pub name: String,
    pub version: String,
    pub build: String,
}

impl VirtualPackage {
    fn new(name: &str, version: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            version: version.into(),
            build: "0".to_string(),
        }
    }

    pub fn filename(&self) -> String {
        format!("{}-{}-{}.tar.bz2", self.name, self.version, self.build)
    }

    pub fn to_record(&self, subdir: &Subdir, timestamp: u64) -> PackageRecord {
        let mut record = PackageRecord::new(&self.name, &self.version, &self.build);
        record.subdir = Some(subdir.to_string());
        record.timestamp = Some(timestamp);
        if subdir.is_noarch() {
            record.noarch = Some(NoArchKind::Generic);
        }
        record
    }
}

/// The generated catalog, keyed by subdir.
#[derive(Debug, Clone)]
pub struct VirtualPackageRegistry {
    by_subdir: BTreeMap<Subdir, BTreeSet<VirtualPackage>>,
    timestamp: u64,
}

fn future_versions(first_major: u32) -> impl Iterator<Item = String> {
    (first_major..=MAX_FUTURE_VERSION)
        .flat_map(|major| (0..=MAX_FUTURE_VERSION).map(move |minor| format!("{major}.{minor}")))
}

#[derive(Deserialize)]
struct PackageSummary {
    #[serde(default)]
    versions: Vec<String>,
}

/// Ask the package index which `cuda-version` releases exist.
pub async fn query_cuda_versions(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<String>, MetadataFetchError> {
    let summary: PackageSummary = client
        .get(url)
        .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(summary.versions)
}

impl VirtualPackageRegistry {
    /// Build the catalog. `cuda_versions` are added to the built-in minimum.
    pub fn build(cuda_versions: &[String]) -> Self {
        let mut registry = Self {
            by_subdir: BTreeMap::new(),
            timestamp: chrono::Utc::now().timestamp_millis().unsigned_abs(),
        };
        let noarch = [Subdir::noarch()];

        for minor in 12..=MAX_GLIBC_MINOR {
            registry.add(VirtualPackage::new("__glibc", format!("2.{minor}")), &noarch);
        }

        let cuda: BTreeSet<String> = MINIMUM_CUDA_VERS
            .iter()
            .map(ToString::to_string)
            .chain(future_versions(12))
            .chain(cuda_versions.iter().cloned())
            .collect();
        for version in cuda {
            registry.add(VirtualPackage::new("__cuda", version), &noarch);
        }

        let osx_64 = [Subdir::from_parts("osx", "64")];
        let osx_all = [Subdir::from_parts("osx", "64"), Subdir::from_parts("osx", "arm64")];
        for version in LEGACY_OSX_VERS {
            registry.add(VirtualPackage::new("__osx", version), &osx_64);
        }
        for version in future_versions(11) {
            registry.add(VirtualPackage::new("__osx", version), &osx_all);
        }

        for arch in ARCHSPEC_NAMES.iter().chain(&ARCHSPEC_X86_64_VERSIONS) {
            let mut package = VirtualPackage::new("__archspec", "1");
            package.build = (*arch).to_string();
            registry.add(package, &noarch);
        }

        let platforms: Vec<Subdir> = ALL_PLATFORMS
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect();
        let scoped = |pred: fn(&Subdir) -> bool| -> Vec<Subdir> {
            platforms.iter().filter(|s| pred(s)).cloned().collect()
        };
        registry.add(VirtualPackage::new("__win", "0"), &scoped(Subdir::is_windows));
        registry.add(VirtualPackage::new("__linux", "0"), &scoped(Subdir::is_linux));
        registry.add(VirtualPackage::new("__unix", "0"), &scoped(Subdir::is_unix));

        tracing::debug!(
            subdirs = registry.by_subdir.len(),
            "built virtual package registry"
        );
        registry
    }

    /// Build the catalog, adding CUDA versions from a live query when enabled.
    ///
    /// A failing query is logged and ignored.
    pub async fn discover(client: &Client, config: &crate::config::VirtualPackagesConfig) -> Self {
        let mut cuda = Vec::new();
        if config.query_cuda {
            let timeout = Duration::from_secs(config.cuda_query_timeout_secs);
            match query_cuda_versions(client, &config.cuda_query_url, timeout).await {
                Ok(versions) => cuda = versions,
                Err(e) => tracing::debug!("CUDA version query failed, using built-in list: {e}"),
            }
        }
        Self::build(&cuda)
    }

    fn add(&mut self, package: VirtualPackage, subdirs: &[Subdir]) {
        for subdir in subdirs {
            self.by_subdir
                .entry(subdir.clone())
                .or_default()
                .insert(package.clone());
        }
    }

    /// Packages scoped to exactly `subdir`.
    pub fn packages(&self, subdir: &Subdir) -> impl Iterator<Item = &VirtualPackage> {
        self.by_subdir.get(subdir).into_iter().flatten()
    }

    /// `(filename, record)` pairs visible when solving for `subdir`: the
    /// subdir's own packages plus `noarch`.
    pub fn records_for(&self, subdir: &Subdir) -> Vec<(String, PackageRecord)> {
        let noarch = Subdir::noarch();
        let mut subdirs = vec![subdir.clone()];
        if !subdir.is_noarch() {
            subdirs.push(noarch);
        }
        subdirs
            .iter()
            .flat_map(|s| {
                self.packages(s)
                    .map(move |p| (p.filename(), p.to_record(s, self.timestamp)))
            })
            .collect()
    }

    /// The `repodata.json` of one subdir.
    pub fn to_repodata(&self, subdir: &Subdir) -> RepoData {
        RepoData {
            info: RepoDataInfo {
                subdir: Some(subdir.to_string()),
            },
            packages: self
                .packages(subdir)
                .map(|p| (p.filename(), p.to_record(subdir, self.timestamp)))
                .collect(),
            conda_packages: BTreeMap::new(),
            removed: Vec::new(),
            repodata_version: 1,
        }
    }

    /// Write the catalog as a `file://` channel and return its URL.
    pub fn write_repodata(&self, dir: &Path) -> std::io::Result<String> {
        let mut subdirs: BTreeSet<Subdir> = ALL_PLATFORMS
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect();
        subdirs.insert(Subdir::noarch());
        subdirs.extend(self.by_subdir.keys().cloned());

        for subdir in &subdirs {
            let subdir_dir = dir.join(subdir.as_str());
            std::fs::create_dir_all(&subdir_dir)?;
            let json = serde_json::to_vec(&self.to_repodata(subdir))?;
            std::fs::write(subdir_dir.join("repodata.json"), json)?;
        }

        let dir = std::path::absolute(dir)?;
        tracing::debug!("wrote virtual package repodata to {}", dir.display());
        Ok(format!("file://{}", dir.display()))
    }
}

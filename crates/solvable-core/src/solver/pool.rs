//! The package universe a solve runs against.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use solvable_schema::{MatchSpec, PackageRecord, RepoData, Subdir, Version};

use super::SolvedPackage;
use crate::virtual_packages::VIRTUAL_CHANNEL;

/// One installable artifact.
pub struct Candidate {
    /// Position in the preference order of its name.
    pub index: usize,
    pub record: PackageRecord,
    pub version: Version,
    /// Channel base URL, or [`VIRTUAL_CHANNEL`].
    pub channel: String,
    pub subdir: Subdir,
    pub filename: String,
    /// Channel rank; virtual packages are 0, real channels start at 1.
    pub priority: usize,
    depends: OnceLock<Result<Vec<MatchSpec>, String>>,
    constrains: OnceLock<Result<Vec<MatchSpec>, String>>,
}

fn parse_specs(specs: &[String]) -> Result<Vec<MatchSpec>, String> {
    specs
        .iter()
        .map(|s| s.parse::<MatchSpec>().map_err(|e| e.to_string()))
        .collect()
}

impl Candidate {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Parsed `depends`, computed on first use.
    pub fn depends(&self) -> Result<&[MatchSpec], &str> {
        match self.depends.get_or_init(|| parse_specs(&self.record.depends)) {
            Ok(specs) => Ok(specs),
            Err(e) => Err(e),
        }
    }

    /// Parsed `constrains`, computed on first use.
    pub fn constrains(&self) -> Result<&[MatchSpec], &str> {
        match self
            .constrains
            .get_or_init(|| parse_specs(&self.record.constrains))
        {
            Ok(specs) => Ok(specs),
            Err(e) => Err(e),
        }
    }

    pub fn matches(&self, spec: &MatchSpec) -> bool {
        spec.matches(&self.record.name, &self.version, &self.record.build)
    }

    pub fn is_virtual(&self) -> bool {
        self.channel == VIRTUAL_CHANNEL
    }

    /// `{channel}/{subdir}`.
    pub fn subdir_url(&self) -> String {
        format!("{}/{}", self.channel, self.subdir)
    }

    pub fn to_solved(&self) -> SolvedPackage {
        SolvedPackage {
            name: self.record.name.clone(),
            version: self.record.version.clone(),
            build: self.record.build.clone(),
            channel: self.channel.clone(),
            subdir: self.subdir.clone(),
            filename: self.filename.clone(),
            sha256: self.record.sha256.clone(),
        }
    }

    /// Preference order: channel, fewer features, newer version, higher
    /// build number, newer upload.
    fn preference(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.record.feature_count().cmp(&other.record.feature_count()))
            .then_with(|| other.version.cmp(&self.version))
            .then_with(|| other.record.build_number.cmp(&self.record.build_number))
            .then_with(|| {
                other
                    .record
                    .timestamp_millis()
                    .cmp(&self.record.timestamp_millis())
            })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.record.name, self.record.version, self.record.build
        )
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("package", &self.to_string())
            .field("channel", &self.channel)
            .field("subdir", &self.subdir)
            .finish_non_exhaustive()
    }
}

/// Candidates by name, each list in preference order.
#[derive(Debug, Default)]
pub struct PackagePool {
    by_name: HashMap<String, Vec<Arc<Candidate>>>,
}

impl PackagePool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Every candidate named `name`, most preferred first.
    pub fn candidates(&self, name: &str) -> &[Arc<Candidate>] {
        self.by_name.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn matching<'a>(&'a self, spec: &'a MatchSpec) -> impl Iterator<Item = &'a Arc<Candidate>> {
        self.candidates(spec.name())
            .iter()
            .filter(move |c| c.matches(spec))
    }

    pub fn len(&self) -> usize {
        self.by_name.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Collects records from several channels, then applies strict channel
/// priority and sorts.
#[derive(Debug, Default)]
pub struct PoolBuilder {
    candidates: Vec<Candidate>,
}

impl PoolBuilder {
    fn push(&mut self, priority: usize, channel: &str, subdir: &Subdir, filename: &str, record: &PackageRecord) {
        let version = match record.version.parse::<Version>() {
            Ok(version) => version,
            Err(e) => {
                tracing::debug!("skipping {filename} in {channel}/{subdir}: {e}");
                return;
            }
        };
        self.candidates.push(Candidate {
            index: 0,
            record: record.clone(),
            version,
            channel: channel.to_string(),
            subdir: subdir.clone(),
            filename: filename.to_string(),
            priority,
            depends: OnceLock::new(),
            constrains: OnceLock::new(),
        });
    }

    /// Add one subdir of a channel. `priority` is the channel's position
    /// (0 is reserved for virtual packages).
    pub fn add_repodata(&mut self, priority: usize, channel: &str, subdir: &Subdir, repodata: &RepoData) {
        let removed: HashSet<&str> = repodata.removed.iter().map(String::as_str).collect();
        for (filename, record) in repodata.records() {
            if !removed.contains(filename) {
                self.push(priority + 1, channel, subdir, filename, record);
            }
        }
    }

    pub fn add_virtual(&mut self, records: &[(String, PackageRecord)]) {
        for (filename, record) in records {
            let subdir = record
                .subdir
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(Subdir::noarch);
            self.push(0, VIRTUAL_CHANNEL, &subdir, filename, record);
        }
    }

    pub fn build(self) -> PackagePool {
        let mut by_name: HashMap<String, Vec<Candidate>> = HashMap::new();
        for candidate in self.candidates {
            by_name
                .entry(candidate.record.name.clone())
                .or_default()
                .push(candidate);
        }

        let by_name = by_name
            .into_iter()
            .map(|(name, mut candidates)| {
                // Strict channel priority: only the best channel offering
                // the name is visible.
                let best = candidates.iter().map(|c| c.priority).min().unwrap_or(0);
                candidates.retain(|c| c.priority == best);
                candidates.sort_by(Candidate::preference);
                let candidates = candidates
                    .into_iter()
                    .enumerate()
                    .map(|(index, mut c)| {
                        c.index = index;
                        Arc::new(c)
                    })
                    .collect();
                (name, candidates)
            })
            .collect();

        PackagePool { by_name }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A record with `depends`, for hand-built pools.
    pub(crate) fn record(name: &str, version: &str, build: &str, depends: &[&str]) -> PackageRecord {
        let mut record = PackageRecord::new(name, version, build);
        record.depends = depends.iter().map(ToString::to_string).collect();
        record
    }

    pub(crate) fn repodata(records: Vec<PackageRecord>) -> RepoData {
        let mut repodata = RepoData::default();
        for record in records {
            let filename = format!("{}-{}-{}.conda", record.name, record.version, record.build);
            repodata.conda_packages.insert(filename, record);
        }
        repodata
    }

    /// A single-channel pool in `linux-64`.
    pub(crate) fn pool(records: Vec<PackageRecord>) -> PackagePool {
        let mut builder = PackagePool::builder();
        builder.add_repodata(0, "file:///chan", &"linux-64".parse().unwrap(), &repodata(records));
        builder.build()
    }

    #[test]
    fn test_preference_order() {
        let mut featured = record("numpy", "2.0", "mkl_0", &[]);
        featured.track_features = "mkl".to_string();
        let mut newer_build = record("numpy", "1.26", "h_1", &[]);
        newer_build.build_number = 1;
        let pool = pool(vec![
            record("numpy", "1.26", "h_0", &[]),
            featured,
            newer_build,
            record("numpy", "1.25", "h_0", &[]),
        ]);

        let order: Vec<String> = pool.candidates("numpy").iter().map(ToString::to_string).collect();
        assert_eq!(
            order,
            vec!["numpy 1.26 h_1", "numpy 1.26 h_0", "numpy 1.25 h_0", "numpy 2.0 mkl_0"]
        );
        assert!(pool.candidates("numpy").iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn test_strict_channel_priority() {
        let subdir: Subdir = "linux-64".parse().unwrap();
        let mut builder = PackagePool::builder();
        builder.add_repodata(0, "file:///first", &subdir, &repodata(vec![record("zlib", "1.2", "0", &[])]));
        builder.add_repodata(
            1,
            "file:///second",
            &subdir,
            &repodata(vec![record("zlib", "1.3", "0", &[]), record("xz", "5.4", "0", &[])]),
        );
        let pool = builder.build();

        assert_eq!(pool.candidates("zlib").len(), 1);
        assert_eq!(pool.candidates("zlib")[0].channel, "file:///first");
        assert_eq!(pool.candidates("xz")[0].channel, "file:///second");
    }

    #[test]
    fn test_removed_and_bad_versions_are_skipped() {
        let mut data = repodata(vec![record("a", "1.0", "0", &[]), record("a", "not a version!", "0", &[])]);
        data.removed.push("a-1.0-0.conda".to_string());
        let mut builder = PackagePool::builder();
        builder.add_repodata(0, "file:///chan", &Subdir::noarch(), &data);
        assert!(builder.build().is_empty());
    }
}

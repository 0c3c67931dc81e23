//! Run-exports discovery.
//!
//! Run exports are not part of repodata. [`RunExportsResolver`] asks an
//! ordered chain of [`RunExportSource`]s and caches the answer per artifact
//! for the lifetime of the resolver. There is no eviction.

pub mod sources;

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use reqwest::Client;
use serde_json::Value;
use solvable_schema::{RunExports, Subdir, archive_stem, split_artifact_name};

use crate::channel::{canonicalize_url, channel_name, split_subdir_url};
use crate::config::RunExportsConfig;

pub use sources::{
    ArtifactDownloadSource, ArtifactInfoSource, ChannelDataSource, Lookup, RunExportSource,
    RunExportsIndexSource,
};

/// Cache key of one artifact: canonical channel URL, subdir and file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub channel: String,
    pub subdir: Subdir,
    pub filename: String,
}

impl ArtifactKey {
    pub fn new(channel_url: &str, subdir: Subdir, filename: &str) -> Self {
        Self {
            channel: canonicalize_url(channel_url),
            subdir,
            filename: filename.to_string(),
        }
    }

    /// Build from a `{channel}/{subdir}` URL as stored on solved packages.
    pub fn from_subdir_url(full_channel_url: &str, filename: &str) -> Option<Self> {
        let (channel, subdir) = split_subdir_url(full_channel_url)?;
        Some(Self::new(channel, subdir, filename))
    }

    /// The channel's short name (`conda-forge`).
    pub fn channel_name(&self) -> &str {
        channel_name(&self.channel)
    }

    pub fn name(&self) -> Option<&str> {
        split_artifact_name(&self.filename).map(|(name, _, _)| name)
    }

    pub fn version(&self) -> Option<&str> {
        split_artifact_name(&self.filename).map(|(_, version, _)| version)
    }

    pub fn stem(&self) -> &str {
        archive_stem(&self.filename)
    }

    pub fn subdir_url(&self) -> String {
        format!("{}/{}", self.channel, self.subdir)
    }

    pub fn artifact_url(&self) -> String {
        format!("{}/{}/{}", self.channel, self.subdir, self.filename)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.channel_name(), self.subdir, self.filename)
    }
}

/// Canonicalize raw metadata, warning about and dropping unknown buckets.
pub fn canonicalize(value: &Value, key: &ArtifactKey) -> RunExports {
    let out = RunExports::from_value(value);
    for ignored in &out.ignored_keys {
        tracing::warn!(
            "RUN EXPORTS: unrecognized run_export key {ignored} in {key}, ignoring it"
        );
    }
    out.run_exports
}

/// Resolves and caches run exports through an ordered source chain.
pub struct RunExportsResolver {
    sources: Vec<Box<dyn RunExportSource>>,
    cache: Mutex<HashMap<ArtifactKey, RunExports>>,
}

impl fmt::Debug for RunExportsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunExportsResolver")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl RunExportsResolver {
    pub fn new(sources: Vec<Box<dyn RunExportSource>>) -> Self {
        Self {
            sources,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The standard chain: channel index, channeldata gate, artifact
    /// metadata service, artifact download.
    pub fn from_config(client: &Client, config: &RunExportsConfig) -> Self {
        let mut sources: Vec<Box<dyn RunExportSource>> =
            vec![Box::new(RunExportsIndexSource::new(client.clone()))];
        if config.channeldata {
            sources.push(Box::new(ChannelDataSource::new(client.clone())));
        }
        if let Some(template) = &config.artifact_info_url {
            sources.push(Box::new(ArtifactInfoSource::new(
                client.clone(),
                template.clone(),
            )));
        }
        if config.download_artifacts {
            sources.push(Box::new(ArtifactDownloadSource::new(client.clone())));
        }
        Self::new(sources)
    }

    /// Run exports of `filename` in the `{channel}/{subdir}` URL.
    pub async fn get_run_exports(&self, full_channel_url: &str, filename: &str) -> RunExports {
        match ArtifactKey::from_subdir_url(full_channel_url, filename) {
            Some(key) => self.resolve(&key, None).await,
            None => {
                tracing::warn!("RUN EXPORTS: cannot parse channel URL {full_channel_url}");
                RunExports::default()
            }
        }
    }

    /// Run exports of one artifact. `sha256` verifies downloads when known.
    ///
    /// Never fails: when every source fails the result is empty.
    pub async fn resolve(&self, key: &ArtifactKey, sha256: Option<&str>) -> RunExports {
        if let Some(hit) = self.cached(key) {
            return hit;
        }

        let mut found = RunExports::default();
        for source in &self.sources {
            match source.lookup(key, sha256).await {
                Ok(Lookup::Found(run_exports)) => {
                    tracing::debug!("RUN EXPORTS: {key} found via {}", source.name());
                    found = run_exports;
                    break;
                }
                Ok(Lookup::Absent) => {
                    tracing::debug!("RUN EXPORTS: {key} has none per {}", source.name());
                    break;
                }
                Ok(Lookup::Unknown) => {}
                Err(e) => {
                    tracing::debug!("RUN EXPORTS: {} failed for {key}: {e}", source.name());
                }
            }
        }

        tracing::debug!("RUN EXPORTS: {key}: {found:?}");
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.clone(), found.clone());
        }
        found
    }

    fn cached(&self, key: &ArtifactKey) -> Option<RunExports> {
        self.cache.lock().ok()?.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MetadataFetchError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Fixed {
        answer: fn() -> Result<Lookup, MetadataFetchError>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RunExportSource for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn lookup(
            &self,
            _key: &ArtifactKey,
            _sha256: Option<&str>,
        ) -> Result<Lookup, MetadataFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.answer)()
        }
    }

    fn fixed(answer: fn() -> Result<Lookup, MetadataFetchError>) -> (Box<dyn RunExportSource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Fixed {
                answer,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn found() -> Result<Lookup, MetadataFetchError> {
        Ok(Lookup::Found(
            RunExports::from_value(&json!(["libfoo >=1.0"])).run_exports,
        ))
    }

    #[test]
    fn test_artifact_key() {
        let key = ArtifactKey::from_subdir_url(
            "https://conda.anaconda.org/t/tok/conda-forge/linux-64",
            "libfoo-1.2.3-h0_0.conda",
        )
        .unwrap();
        assert_eq!(key.channel, "https://conda-static.anaconda.org/conda-forge");
        assert_eq!(key.channel_name(), "conda-forge");
        assert_eq!(key.name(), Some("libfoo"));
        assert_eq!(key.version(), Some("1.2.3"));
        assert_eq!(key.stem(), "libfoo-1.2.3-h0_0");
        assert_eq!(key.to_string(), "conda-forge/linux-64/libfoo-1.2.3-h0_0.conda");
    }

    #[tokio::test]
    async fn test_first_success_wins_and_is_cached() {
        let (failing, failing_calls) =
            fixed(|| Err(MetadataFetchError::Archive("boom".to_string())));
        let (unknown, _) = fixed(|| Ok(Lookup::Unknown));
        let (hit, hit_calls) = fixed(found);
        let (never, never_calls) = fixed(found);
        let resolver = RunExportsResolver::new(vec![failing, unknown, hit, never]);

        let url = "https://example.org/chan/linux-64";
        let first = resolver.get_run_exports(url, "libfoo-1.0-0.tar.bz2").await;
        let second = resolver.get_run_exports(url, "libfoo-1.0-0.tar.bz2").await;

        assert!(first.weak.contains("libfoo >=1.0"));
        assert_eq!(first, second);
        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(never_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_absent_short_circuits() {
        let (gate, _) = fixed(|| Ok(Lookup::Absent));
        let (download, download_calls) = fixed(found);
        let resolver = RunExportsResolver::new(vec![gate, download]);

        let rx = resolver
            .get_run_exports("file:///chan/noarch", "pkg-1.0-0.conda")
            .await;
        assert!(rx.is_empty());
        assert_eq!(download_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_empty() {
        let (a, _) = fixed(|| Err(MetadataFetchError::Archive("a".to_string())));
        let (b, _) = fixed(|| Ok(Lookup::Unknown));
        let resolver = RunExportsResolver::new(vec![a, b]);
        let rx = resolver
            .get_run_exports("file:///chan/noarch", "pkg-1.0-0.conda")
            .await;
        assert!(rx.is_empty());
    }
}

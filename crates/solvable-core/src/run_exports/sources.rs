//! The run-exports source chain.
//!
//! Sources are tried in order. A source answers [`Lookup::Found`] to stop the
//! chain with a result, [`Lookup::Absent`] when it can prove the artifact has
//! no run exports, and [`Lookup::Unknown`] to defer to the next source.
//! Errors also defer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use solvable_schema::{ArchiveType, RunExports, Subdir};

use super::{ArtifactKey, canonicalize};
use crate::io::download::download_artifact;
use crate::io::extract::read_run_exports;
use crate::io::{MetadataFetchError, fetch_json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(RunExports),
    Absent,
    Unknown,
}

#[async_trait]
pub trait RunExportSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn lookup(
        &self,
        key: &ArtifactKey,
        sha256: Option<&str>,
    ) -> Result<Lookup, MetadataFetchError>;
}

type Shared<K> = Mutex<HashMap<K, Option<Arc<Value>>>>;

fn cached<K: std::hash::Hash + Eq>(cache: &Shared<K>, key: &K) -> Option<Option<Arc<Value>>> {
    cache.lock().ok()?.get(key).cloned()
}

fn store<K: std::hash::Hash + Eq>(cache: &Shared<K>, key: K, value: Option<Arc<Value>>) {
    if let Ok(mut cache) = cache.lock() {
        cache.insert(key, value);
    }
}

/// The channel's consolidated `run_exports.json` index (CEP-12), fetched
/// once per channel and subdir.
pub struct RunExportsIndexSource {
    client: Client,
    cache: Shared<(String, Subdir)>,
}

impl RunExportsIndexSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn index(&self, key: &ArtifactKey) -> Result<Option<Arc<Value>>, MetadataFetchError> {
        let cache_key = (key.channel.clone(), key.subdir.clone());
        if let Some(hit) = cached(&self.cache, &cache_key) {
            return Ok(hit);
        }

        let base = key.subdir_url();
        let mut index = None;
        for file in ["run_exports.json.zst", "run_exports.json"] {
            if let Some(value) = fetch_json::<Value>(&self.client, &format!("{base}/{file}")).await? {
                index = Some(Arc::new(value));
                break;
            }
        }
        store(&self.cache, cache_key, index.clone());
        Ok(index)
    }
}

#[async_trait]
impl RunExportSource for RunExportsIndexSource {
    fn name(&self) -> &'static str {
        "run_exports.json"
    }

    async fn lookup(
        &self,
        key: &ArtifactKey,
        _sha256: Option<&str>,
    ) -> Result<Lookup, MetadataFetchError> {
        let Some(index) = self.index(key).await? else {
            return Ok(Lookup::Unknown);
        };
        let packages_key = match ArchiveType::from_filename(&key.filename) {
            Some(ArchiveType::Conda) => "packages.conda",
            _ => "packages",
        };
        Ok(
            match index
                .get(packages_key)
                .and_then(|p| p.get(&key.filename))
                .and_then(|entry| entry.get("run_exports"))
            {
                Some(raw) => Lookup::Found(canonicalize(raw, key)),
                None => Lookup::Unknown,
            },
        )
    }
}

/// `channeldata.json` records, per package name, which versions ever had
/// run exports. A listed package whose version is missing has none.
pub struct ChannelDataSource {
    client: Client,
    cache: Shared<String>,
}

impl ChannelDataSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RunExportSource for ChannelDataSource {
    fn name(&self) -> &'static str {
        "channeldata.json"
    }

    async fn lookup(
        &self,
        key: &ArtifactKey,
        _sha256: Option<&str>,
    ) -> Result<Lookup, MetadataFetchError> {
        let channeldata = match cached(&self.cache, &key.channel) {
            Some(hit) => hit,
            None => {
                let url = format!("{}/channeldata.json", key.channel);
                let value = fetch_json::<Value>(&self.client, &url).await?.map(Arc::new);
                store(&self.cache, key.channel.clone(), value.clone());
                value
            }
        };

        let (Some(channeldata), Some(name), Some(version)) =
            (channeldata, key.name(), key.version())
        else {
            return Ok(Lookup::Unknown);
        };
        let Some(history) = channeldata
            .get("packages")
            .and_then(|p| p.get(name))
            .and_then(|p| p.get("run_exports"))
            .and_then(Value::as_object)
        else {
            return Ok(Lookup::Unknown);
        };

        Ok(if history.contains_key(version) {
            Lookup::Unknown
        } else {
            Lookup::Absent
        })
    }
}

/// Artifact provenance records from a metadata service.
///
/// The URL template may use `{name}`, `{channel}`, `{subdir}`, `{stem}` and
/// `{filename}`; the record's `rendered_recipe.build.run_exports` is used.
pub struct ArtifactInfoSource {
    client: Client,
    url_template: String,
}

impl ArtifactInfoSource {
    pub fn new(client: Client, url_template: String) -> Self {
        Self {
            client,
            url_template,
        }
    }

    pub fn url_for(&self, key: &ArtifactKey) -> Option<String> {
        Some(
            self.url_template
                .replace("{name}", key.name()?)
                .replace("{channel}", key.channel_name())
                .replace("{subdir}", key.subdir.as_str())
                .replace("{stem}", key.stem())
                .replace("{filename}", &key.filename),
        )
    }
}

#[async_trait]
impl RunExportSource for ArtifactInfoSource {
    fn name(&self) -> &'static str {
        "artifact info"
    }

    async fn lookup(
        &self,
        key: &ArtifactKey,
        _sha256: Option<&str>,
    ) -> Result<Lookup, MetadataFetchError> {
        let Some(url) = self.url_for(key) else {
            return Ok(Lookup::Unknown);
        };
        let Some(info) = fetch_json::<Value>(&self.client, &url).await? else {
            return Ok(Lookup::Unknown);
        };
        let raw = info
            .pointer("/rendered_recipe/build/run_exports")
            .unwrap_or(&Value::Null);
        Ok(Lookup::Found(canonicalize(raw, key)))
    }
}

/// Download the artifact and read `info/run_exports.json`.
///
/// Everything happens in a temporary directory removed on every path.
pub struct ArtifactDownloadSource {
    client: Client,
}

impl ArtifactDownloadSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RunExportSource for ArtifactDownloadSource {
    fn name(&self) -> &'static str {
        "artifact download"
    }

    async fn lookup(
        &self,
        key: &ArtifactKey,
        sha256: Option<&str>,
    ) -> Result<Lookup, MetadataFetchError> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join(&key.filename);
        download_artifact(&self.client, &key.artifact_url(), &archive, sha256).await?;

        let extract_dir = tmp.path().join("extracted");
        let raw = tokio::task::spawn_blocking(move || read_run_exports(&archive, &extract_dir))
            .await
            .map_err(std::io::Error::other)??;

        Ok(Lookup::Found(match raw {
            Some(raw) => canonicalize(&raw, key),
            None => RunExports::default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::extract::tests::{write_conda, write_tar_bz2};

    fn key(channel: &str, subdir: &str, filename: &str) -> ArtifactKey {
        ArtifactKey::new(channel, subdir.parse().unwrap(), filename)
    }

    #[tokio::test]
    async fn test_index_source() {
        let mut server = mockito::Server::new_async().await;
        let zst = server
            .mock("GET", "/chan/linux-64/run_exports.json.zst")
            .with_status(404)
            .create_async()
            .await;
        let plain = server
            .mock("GET", "/chan/linux-64/run_exports.json")
            .with_status(200)
            .with_body(
                r#"{
                    "packages": {"libfoo-1.0-0.tar.bz2": {"run_exports": {"weak": ["libfoo >=1.0"]}}},
                    "packages.conda": {
                        "libfoo-1.0-0.conda": {"run_exports": {}},
                        "libbar-1.0-0.conda": {}
                    }
                }"#,
            )
            .expect(1)
            .create_async()
            .await;

        let source = RunExportsIndexSource::new(Client::new());
        let channel = format!("{}/chan", server.url());

        let tarball = source.lookup(&key(&channel, "linux-64", "libfoo-1.0-0.tar.bz2"), None).await.unwrap();
        let Lookup::Found(rx) = tarball else { panic!("expected a hit") };
        assert!(rx.weak.contains("libfoo >=1.0"));

        let conda = source.lookup(&key(&channel, "linux-64", "libfoo-1.0-0.conda"), None).await.unwrap();
        assert_eq!(conda, Lookup::Found(RunExports::default()));

        let no_field = source.lookup(&key(&channel, "linux-64", "libbar-1.0-0.conda"), None).await.unwrap();
        assert_eq!(no_field, Lookup::Unknown);

        zst.assert_async().await;
        plain.assert_async().await;
    }

    #[tokio::test]
    async fn test_channeldata_gate() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/chan/channeldata.json")
            .with_status(200)
            .with_body(
                r#"{"packages": {
                    "libfoo": {"run_exports": {"1.0": {"weak": ["libfoo"]}}},
                    "python": {}
                }}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let source = ChannelDataSource::new(Client::new());
        let channel = format!("{}/chan", server.url());

        let with = source.lookup(&key(&channel, "noarch", "libfoo-1.0-0.conda"), None).await;
        assert_eq!(with.unwrap(), Lookup::Unknown);
        let without = source.lookup(&key(&channel, "noarch", "libfoo-2.0-0.conda"), None).await;
        assert_eq!(without.unwrap(), Lookup::Absent);
        let unlisted = source.lookup(&key(&channel, "noarch", "python-3.12-0.conda"), None).await;
        assert_eq!(unlisted.unwrap(), Lookup::Unknown);
        let unknown_pkg = source.lookup(&key(&channel, "noarch", "zlib-1.3-0.conda"), None).await;
        assert_eq!(unknown_pkg.unwrap(), Lookup::Unknown);
    }

    #[tokio::test]
    async fn test_artifact_info_source() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/artifacts/libfoo/conda-forge/linux-64/libfoo-1.0-0.json")
            .with_status(200)
            .with_body(r#"{"rendered_recipe": {"build": {"run_exports": ["libfoo 1.*"]}}}"#)
            .create_async()
            .await;

        let source = ArtifactInfoSource::new(
            Client::new(),
            format!("{}/artifacts/{{name}}/{{channel}}/{{subdir}}/{{stem}}.json", server.url()),
        );
        let artifact = key("https://conda.anaconda.org/conda-forge", "linux-64", "libfoo-1.0-0.conda");
        let Lookup::Found(rx) = source.lookup(&artifact, None).await.unwrap() else {
            panic!("expected a hit")
        };
        assert!(rx.weak.contains("libfoo 1.*"));

        let missing = key("https://conda.anaconda.org/conda-forge", "linux-64", "other-1.0-0.conda");
        assert_eq!(source.lookup(&missing, None).await.unwrap(), Lookup::Unknown);
    }

    #[tokio::test]
    async fn test_download_source_formats() {
        let channel = tempfile::tempdir().unwrap();
        let subdir = channel.path().join("linux-64");
        std::fs::create_dir_all(&subdir).unwrap();
        write_tar_bz2(
            &subdir.join("libfoo-1.0-0.tar.bz2"),
            &[("info/run_exports.json", br#"{"strong": ["libfoo >=1.0"], "odd": ["x"]}"#)],
        );
        write_conda(
            &subdir.join("libbar-1.0-0.conda"),
            &[("info/index.json", b"{}")],
        );

        let source = ArtifactDownloadSource::new(Client::new());
        let url = format!("file://{}", channel.path().display());

        let Lookup::Found(rx) = source.lookup(&key(&url, "linux-64", "libfoo-1.0-0.tar.bz2"), None).await.unwrap() else {
            panic!("expected a hit")
        };
        assert!(rx.strong.contains("libfoo >=1.0"));
        assert!(rx.weak.is_empty());

        let bar = source.lookup(&key(&url, "linux-64", "libbar-1.0-0.conda"), None).await.unwrap();
        assert_eq!(bar, Lookup::Found(RunExports::default()));

        let missing = source.lookup(&key(&url, "linux-64", "nope-1.0-0.conda"), None).await;
        assert!(missing.is_err());
    }
}

//! Repodata loading and the per-platform package pools built from it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::Client;
use solvable_schema::{RepoData, Subdir};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::io::{MetadataFetchError, fetch_json};
use crate::solver::PackagePool;
use crate::virtual_packages::VirtualPackageRegistry;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to load repodata from {url}: {source}")]
    Fetch {
        url: String,
        source: MetadataFetchError,
    },
}

/// Loads one subdir of one channel.
#[async_trait]
pub trait RepodataFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, channel_url: &str, subdir: &Subdir) -> Result<RepoData, IndexError>;
}

/// Reads `{channel}/{subdir}/repodata.json` over `https://` or `file://`.
///
/// A subdir the channel does not have is an empty index.
#[derive(Debug, Clone)]
pub struct HttpRepodataFetcher {
    client: Client,
}

impl HttpRepodataFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RepodataFetcher for HttpRepodataFetcher {
    async fn fetch(&self, channel_url: &str, subdir: &Subdir) -> Result<RepoData, IndexError> {
        let url = format!("{}/{subdir}/repodata.json", channel_url.trim_end_matches('/'));
        tracing::debug!("fetching {url}");
        match fetch_json::<RepoData>(&self.client, &url).await {
            Ok(Some(repodata)) => Ok(repodata),
            Ok(None) => {
                tracing::debug!("{url} does not exist, treating it as empty");
                Ok(RepoData::default())
            }
            Err(source) => Err(IndexError::Fetch { url, source }),
        }
    }
}

/// Cache key of one pool: the resolved channel URLs in priority order and
/// the target subdir.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub channels: Vec<String>,
    pub subdir: Subdir,
}

/// Builds and caches package pools per `(channels, subdir)`.
///
/// A pool covers the subdir, `noarch`, and the virtual packages of the
/// subdir. Pools live as long as the cache; there is no eviction.
pub struct IndexCache {
    fetcher: Arc<dyn RepodataFetcher>,
    virtual_packages: Arc<VirtualPackageRegistry>,
    pools: Mutex<HashMap<IndexKey, Arc<PackagePool>>>,
}

impl fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexCache")
            .field("fetcher", &self.fetcher)
            .finish_non_exhaustive()
    }
}

impl IndexCache {
    pub fn new(fetcher: Arc<dyn RepodataFetcher>, virtual_packages: Arc<VirtualPackageRegistry>) -> Self {
        Self {
            fetcher,
            virtual_packages,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn virtual_packages(&self) -> &VirtualPackageRegistry {
        &self.virtual_packages
    }

    /// The pool for `channels` (base URLs, highest priority first) on `subdir`.
    pub async fn pool(&self, channels: &[String], subdir: &Subdir) -> Result<Arc<PackagePool>, IndexError> {
        let key = IndexKey {
            channels: channels.to_vec(),
            subdir: subdir.clone(),
        };
        // Held across the fetch so each key is loaded once.
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let mut subdirs = vec![subdir.clone()];
        if !subdir.is_noarch() {
            subdirs.push(Subdir::noarch());
        }
        let jobs = channels.iter().enumerate().flat_map(|(priority, channel)| {
            subdirs.iter().map(move |sd| async move {
                let repodata = self.fetcher.fetch(channel, sd).await?;
                Ok::<_, IndexError>((priority, channel, sd, repodata))
            })
        });
        let loaded = try_join_all(jobs).await?;

        let mut builder = PackagePool::builder();
        builder.add_virtual(&self.virtual_packages.records_for(subdir));
        for (priority, channel, sd, repodata) in &loaded {
            builder.add_repodata(*priority, channel, sd, repodata);
        }
        let pool = Arc::new(builder.build());
        tracing::info!(
            "loaded {} packages for {subdir} from {} channel(s)",
            pool.len(),
            channels.len()
        );

        pools.insert(key, pool.clone());
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::pool::tests::{record, repodata};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_channel(dir: &std::path::Path, subdir: &str, data: &RepoData) {
        let subdir_dir = dir.join(subdir);
        std::fs::create_dir_all(&subdir_dir).unwrap();
        std::fs::write(
            subdir_dir.join("repodata.json"),
            serde_json::to_vec(data).unwrap(),
        )
        .unwrap();
    }

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RepodataFetcher for Counting {
        async fn fetch(&self, _channel_url: &str, subdir: &Subdir) -> Result<RepoData, IndexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if subdir.is_noarch() {
                repodata(vec![record("tzdata", "2024a", "0", &[])])
            } else {
                repodata(vec![record("python", "3.12.4", "h0", &["__glibc >=2.17"])])
            })
        }
    }

    #[tokio::test]
    async fn test_file_channel_and_missing_subdir() {
        let dir = tempfile::tempdir().unwrap();
        write_channel(
            dir.path(),
            "linux-64",
            &repodata(vec![record("python", "3.12.4", "h0", &[])]),
        );
        let url = format!("file://{}", dir.path().display());
        let fetcher = HttpRepodataFetcher::new(Client::new());

        let linux = fetcher.fetch(&url, &"linux-64".parse().unwrap()).await.unwrap();
        assert_eq!(linux.records().count(), 1);
        let noarch = fetcher.fetch(&url, &Subdir::noarch()).await.unwrap();
        assert_eq!(noarch.records().count(), 0);
    }

    #[tokio::test]
    async fn test_http_fetch() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::to_string(&repodata(vec![record("zlib", "1.3.1", "0", &[])])).unwrap();
        let _ok = server
            .mock("GET", "/chan/linux-64/repodata.json")
            .with_body(body)
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/chan/noarch/repodata.json")
            .with_status(404)
            .create_async()
            .await;
        let _broken = server
            .mock("GET", "/broken/linux-64/repodata.json")
            .with_status(500)
            .create_async()
            .await;

        let fetcher = HttpRepodataFetcher::new(Client::new());
        let chan = format!("{}/chan", server.url());
        assert_eq!(
            fetcher.fetch(&chan, &"linux-64".parse().unwrap()).await.unwrap().records().count(),
            1
        );
        assert!(fetcher.fetch(&chan, &Subdir::noarch()).await.unwrap().packages.is_empty());

        let err = fetcher
            .fetch(&format!("{}/broken", server.url()), &"linux-64".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken/linux-64/repodata.json"));
    }

    #[tokio::test]
    async fn test_pool_is_cached_and_includes_virtual_packages() {
        let fetcher = Arc::new(Counting::default());
        let cache = IndexCache::new(fetcher.clone(), Arc::new(VirtualPackageRegistry::build(&[])));
        let channels = vec!["https://example.org/chan".to_string()];
        let subdir: Subdir = "linux-64".parse().unwrap();

        let first = cache.pool(&channels, &subdir).await.unwrap();
        let second = cache.pool(&channels, &subdir).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        assert_eq!(first.candidates("python").len(), 1);
        assert_eq!(first.candidates("tzdata").len(), 1);
        assert!(!first.candidates("__glibc").is_empty());
        assert!(first.candidates("__osx").is_empty());

        let osx = cache.pool(&channels, &"osx-64".parse().unwrap()).await.unwrap();
        assert!(!osx.candidates("__osx").is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }
}

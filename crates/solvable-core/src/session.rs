//! Shared state for solvability checks.
//!
//! A `Session` groups what every check needs: configuration, the HTTP
//! client, the cached package pools, the run-exports resolver and the
//! renderer. Its caches live as long as the session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use solvable_schema::Subdir;

use crate::USER_AGENT;
use crate::channel::resolve_channels;
use crate::config::{SolvableConfig, SolverKind, Verbosity};
use crate::error::CheckError;
use crate::index::{HttpRepodataFetcher, IndexCache, IndexError, RepodataFetcher};
use crate::render::{MetaYamlRenderer, RecipeRenderer};
use crate::run_exports::RunExportsResolver;
use crate::solver::{Deadline, Solver, backend};
use crate::virtual_packages::VirtualPackageRegistry;

/// Groups the state shared by every check in one process.
#[derive(Clone)]
pub struct Session {
    pub config: Arc<SolvableConfig>,
    pub client: Client,
    pub index: Arc<IndexCache>,
    pub run_exports: Arc<RunExportsResolver>,
    pub renderer: Arc<dyn RecipeRenderer>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("renderer", &self.renderer)
            .finish_non_exhaustive()
    }
}

/// The HTTP client configured by `config.http`.
pub fn http_client(config: &SolvableConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(config.http.timeout_secs))
        .connect_timeout(Duration::from_secs(config.http.connect_timeout_secs))
        .pool_max_idle_per_host(20)
        .build()
}

impl Session {
    /// A session with the HTTP fetcher, the configured run-exports chain and
    /// the `meta.yaml` renderer. Virtual packages are discovered once here.
    pub async fn new(config: SolvableConfig) -> Result<Self, CheckError> {
        let client = http_client(&config)?;
        let virtual_packages = VirtualPackageRegistry::discover(&client, &config.virtual_packages).await;
        let run_exports = RunExportsResolver::from_config(&client, &config.run_exports);
        let fetcher = Arc::new(HttpRepodataFetcher::new(client.clone()));
        Ok(Self::with_parts(
            config,
            client,
            fetcher,
            Arc::new(virtual_packages),
            Arc::new(run_exports),
            Arc::new(MetaYamlRenderer),
        ))
    }

    pub fn with_parts(
        config: SolvableConfig,
        client: Client,
        fetcher: Arc<dyn RepodataFetcher>,
        virtual_packages: Arc<VirtualPackageRegistry>,
        run_exports: Arc<RunExportsResolver>,
        renderer: Arc<dyn RecipeRenderer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            client,
            index: Arc::new(IndexCache::new(fetcher, virtual_packages)),
            run_exports,
            renderer,
        }
    }

    /// Channel names resolved to base URLs for `subdir`, highest priority
    /// first.
    pub fn channel_urls<S: AsRef<str>>(&self, names: &[S], subdir: &Subdir) -> Vec<String> {
        resolve_channels(names, subdir, &self.config)
    }

    /// A solver over `channels` (names or URLs) on `subdir`.
    pub async fn solver<S: AsRef<str>>(
        &self,
        channels: &[S],
        subdir: &Subdir,
        kind: SolverKind,
        deadline: Deadline,
        verbosity: Verbosity,
    ) -> Result<Solver, IndexError> {
        let urls = self.channel_urls(channels, subdir);
        tracing::debug!("using channels {urls:?} on {subdir}");
        let pool = self.index.pool(&urls, subdir).await?;
        Ok(Solver::new(subdir.clone(), pool, backend(kind), self.run_exports.clone())
            .with_deadline(deadline)
            .with_verbosity(verbosity))
    }
}

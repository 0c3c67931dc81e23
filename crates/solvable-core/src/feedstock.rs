//! Feedstock-level checks.
//!
//! A feedstock is solvable when every `.ci_support/*.yaml` variant config is.
//! Configs are checked one after another in sorted order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::Instrument;

use crate::channel::channel_sources;
use crate::config::{SolvableConfig, SolverKind, Verbosity};
use crate::error::CheckError;
use crate::pipeline::Pipeline;
use crate::render::{RECIPE_FILE, RenderRequest};
use crate::session::Session;
use crate::solver::Deadline;
use crate::variant::{VariantConfig, build_subdir};

pub const NO_CI_SUPPORT: &str = "No `.ci_support/*.yaml` files found! This can happen when a rerender \
results in no builds for a recipe (e.g., a recipe is python 2.7 only). \
This attempted migration is being reported as not solvable.";

pub const NO_RECIPE: &str =
    "No `recipe/meta.yaml` file found! This issue is quite weird and someone should investigate!";

/// Knobs of one feedstock check.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Channels ranked above the variant's own channel sources.
    pub additional_channels: Vec<String>,
    /// Wall-clock budget; on expiry the feedstock is reported solvable.
    pub timeout: Option<Duration>,
    /// `{platform}_{arch}` of a target to the `{platform}_{arch}` whose
    /// toolchain builds it, e.g. `osx_arm64` -> `osx_64`.
    pub build_platform: BTreeMap<String, String>,
    pub verbosity: Verbosity,
    pub solver: SolverKind,
}

impl CheckOptions {
    /// Options taking the solver and timeout from `config`.
    pub fn from_config(config: &SolvableConfig) -> Self {
        Self {
            timeout: config.timeout(),
            solver: config.solver,
            ..Self::default()
        }
    }
}

/// The answer for one feedstock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedstockVerdict {
    pub solvable: bool,
    /// Solver explanations, each prefixed with its variant config name.
    pub errors: Vec<String>,
    /// Keyed by config file stem.
    pub solvable_by_variant: BTreeMap<String, bool>,
}

impl FeedstockVerdict {
    /// The fail-open answer of a check that ran out of time.
    pub fn timed_out() -> Self {
        Self {
            solvable: true,
            ..Self::default()
        }
    }

    /// Unsolvable for a reason outside any single variant.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            solvable: false,
            errors: vec![error.into()],
            solvable_by_variant: BTreeMap::new(),
        }
    }
}

/// Result of one variant config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VariantVerdict {
    solvable: bool,
    errors: Vec<String>,
}

/// Variant configs of a feedstock, sorted by path.
pub fn variant_configs(feedstock_dir: &Path) -> Vec<PathBuf> {
    let pattern = feedstock_dir.join(".ci_support").join("*.yaml");
    let mut configs: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            tracing::warn!("invalid config pattern {}: {e}", pattern.display());
            Vec::new()
        }
    };
    configs.sort();
    configs
}

fn config_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn feedstock_name(feedstock_dir: &Path) -> String {
    feedstock_dir
        .file_name()
        .map_or_else(|| feedstock_dir.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Check whether every variant of the feedstock at `feedstock_dir` can be
/// built, installed and tested.
///
/// With a timeout the check runs as its own task. When the budget expires the
/// task is aborted, in-flight solves are cancelled and the feedstock is
/// reported solvable with no errors: a slow check could not disprove
/// solvability. A check that fails outright is reported unsolvable with the
/// failure as its only error.
pub async fn is_recipe_solvable(feedstock_dir: &Path, options: &CheckOptions, session: &Session) -> FeedstockVerdict {
    let deadline = Deadline::from_timeout(options.timeout);
    let Some(timeout) = options.timeout else {
        return check_feedstock(feedstock_dir, options, session, &deadline).await;
    };

    let task = {
        let (dir, options, session, deadline) =
            (feedstock_dir.to_path_buf(), options.clone(), session.clone(), deadline.clone());
        tokio::spawn(async move { check_feedstock(&dir, &options, &session, &deadline).await })
    };
    let abort = task.abort_handle();

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(join_error)) => {
            tracing::error!("check of {} failed: {join_error}", feedstock_dir.display());
            FeedstockVerdict::failed(format!("{}: check failed: {join_error}", feedstock_name(feedstock_dir)))
        }
        Err(_) => {
            deadline.cancel();
            abort.abort();
            tracing::warn!("SOLVER TIMEOUT for {}", feedstock_dir.display());
            FeedstockVerdict::timed_out()
        }
    }
}

async fn check_feedstock(
    feedstock_dir: &Path,
    options: &CheckOptions,
    session: &Session,
    deadline: &Deadline,
) -> FeedstockVerdict {
    let configs = variant_configs(feedstock_dir);
    if configs.is_empty() {
        tracing::warn!("{NO_CI_SUPPORT}");
        return FeedstockVerdict::failed(NO_CI_SUPPORT);
    }

    let recipe_dir = feedstock_dir.join("recipe");
    if !recipe_dir.join(RECIPE_FILE).is_file() {
        tracing::warn!("{NO_RECIPE}");
        return FeedstockVerdict::failed(NO_RECIPE);
    }

    tracing::info!("CHECKING FEEDSTOCK: {}", feedstock_name(feedstock_dir));

    let mut verdict = FeedstockVerdict {
        solvable: true,
        ..FeedstockVerdict::default()
    };
    for config in &configs {
        let name = config_name(config);
        let span = tracing::info_span!("variant", config = %name);
        let result = check_variant(config, &recipe_dir, options, session, deadline)
            .instrument(span)
            .await;

        match result {
            Ok(variant) => {
                verdict.solvable &= variant.solvable;
                verdict
                    .errors
                    .extend(variant.errors.iter().map(|e| format!("{name}: {e}")));
                verdict.solvable_by_variant.insert(name, variant.solvable);
            }
            Err(err) if err.is_cancelled() => {
                tracing::warn!("SOLVER TIMEOUT for {}", feedstock_dir.display());
                return FeedstockVerdict::timed_out();
            }
            Err(err) => {
                tracing::warn!("check of {name} failed: {err}");
                return FeedstockVerdict::failed(format!("{name}: {err}"));
            }
        }
    }
    verdict
}

async fn check_variant(
    config_path: &Path,
    recipe_dir: &Path,
    options: &CheckOptions,
    session: &Session,
    deadline: &Deadline,
) -> Result<VariantVerdict, CheckError> {
    tracing::info!("CHECKING RECIPE SOLVABLE: {}", config_path.display());
    let variant = VariantConfig::load(config_path)?;
    let target = variant.subdir();
    let build = build_subdir(&variant, &options.build_platform);

    let channels = channel_sources(variant.channel_sources().as_deref(), &options.additional_channels);
    tracing::debug!("using channels {channels:?} on {target} (build {build})");

    let channel_urls = session.channel_urls(&channels, &target);
    let outputs = session.renderer.render(&RenderRequest {
        recipe_dir,
        target: &target,
        build: &build,
        variant: &variant,
        channel_urls: &channel_urls,
    })?;

    let host_solver = session
        .solver(&channels, &target, options.solver, deadline.clone(), options.verbosity)
        .await?;
    let build_solver = session
        .solver(&channels, &build, options.solver, deadline.clone(), options.verbosity)
        .await?;

    let pin_run_as_build = variant.pin_run_as_build();
    let values = variant.string_map();
    let pipeline = Pipeline {
        build_solver: &build_solver,
        host_solver: &host_solver,
        pin_run_as_build: &pin_run_as_build,
        variant: &values,
        strict_pins: session.config.strict_pins,
    };

    let verdicts = pipeline.check_outputs(&outputs).await?;
    Ok(VariantVerdict {
        solvable: verdicts.iter().all(|v| v.solvable),
        errors: verdicts.into_iter().flat_map(|v| v.errors).collect(),
    })
}

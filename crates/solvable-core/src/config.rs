//! Configuration for solvability checks.
//!
//! Everything has a working default so a config file is optional. Files are
//! TOML:
//!
//! ```toml
//! solver = "backtrack"
//! timeout_secs = 300
//!
//! [virtual_packages]
//! query_cuda = false
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Which [`SolveBackend`](crate::solver::SolveBackend) to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Conflict-driven PubGrub search; honours timeouts.
    #[default]
    Pubgrub,
    /// Plain depth-first backtracking; ignores timeouts.
    Backtrack,
}

impl SolverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pubgrub => "pubgrub",
            Self::Backtrack => "backtrack",
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SolverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pubgrub" => Ok(Self::Pubgrub),
            "backtrack" | "backtracking" => Ok(Self::Backtrack),
            _ => Err(format!("Unknown solver backend: {s}")),
        }
    }
}

/// How much the check logs.
///
/// Mirrors the historical 0..=3 verbosity scale. The CLI turns it into a
/// tracing filter; the library only consults it for output that is too
/// large to log by default (full solutions).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Warnings.
    #[default]
    Normal,
    /// Progress information.
    Verbose,
    /// Everything, including solutions.
    Debug,
}

impl Verbosity {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Quiet,
            1 => Self::Normal,
            2 => Self::Verbose,
            _ => Self::Debug,
        }
    }

    /// The tracing filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            Self::Quiet => "error",
            Self::Normal => "warn",
            Self::Verbose => "info",
            Self::Debug => "debug",
        }
    }

    pub fn logs_solutions(self) -> bool {
        self >= Self::Debug
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunExportsConfig {
    /// Consult `channeldata.json` before the slow sources.
    pub channeldata: bool,
    /// Artifact provenance URL template. Placeholders: `{name}`, `{channel}`,
    /// `{subdir}`, `{stem}`, `{filename}`. `None` disables the source.
    pub artifact_info_url: Option<String>,
    /// Download artifacts as the last resort.
    pub download_artifacts: bool,
}

impl Default for RunExportsConfig {
    fn default() -> Self {
        Self {
            channeldata: true,
            artifact_info_url: Some(
                "https://raw.githubusercontent.com/regro/libcfgraph/master/artifacts/{name}/{channel}/{subdir}/{stem}.json"
                    .to_string(),
            ),
            download_artifacts: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualPackagesConfig {
    /// Ask the package index which `cuda-version` releases exist.
    pub query_cuda: bool,
    pub cuda_query_url: String,
    pub cuda_query_timeout_secs: u64,
}

impl Default for VirtualPackagesConfig {
    fn default() -> Self {
        Self {
            query_cuda: true,
            cuda_query_url: "https://api.anaconda.org/package/conda-forge/cuda-version"
                .to_string(),
            cuda_query_timeout_secs: 10,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolvableConfig {
    /// Base URL that bare channel names are resolved against.
    pub channel_alias: String,
    /// What the `defaults` channel expands to.
    pub default_channels: Vec<String>,
    /// Added to `defaults` on Windows subdirs, and what `msys2` resolves to.
    pub msys2_channel: String,
    pub solver: SolverKind,
    /// Wall-clock budget for one feedstock; `None` disables it.
    pub timeout_secs: Option<u64>,
    /// Fail on `pin_compatible` targets missing from the lookup instead of
    /// falling back to an unpinned requirement.
    pub strict_pins: bool,
    pub http: HttpConfig,
    pub run_exports: RunExportsConfig,
    pub virtual_packages: VirtualPackagesConfig,
}

impl Default for SolvableConfig {
    fn default() -> Self {
        Self {
            channel_alias: "https://conda.anaconda.org".to_string(),
            default_channels: vec![
                "https://repo.anaconda.com/pkgs/main".to_string(),
                "https://repo.anaconda.com/pkgs/r".to_string(),
            ],
            msys2_channel: "https://repo.anaconda.com/pkgs/msys2".to_string(),
            solver: SolverKind::default(),
            timeout_secs: Some(600),
            strict_pins: false,
            http: HttpConfig::default(),
            run_exports: RunExportsConfig::default(),
            virtual_packages: VirtualPackagesConfig::default(),
        }
    }
}

impl SolvableConfig {
    /// Load a TOML config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: SolvableConfig = toml::from_str(
            r#"
            solver = "backtrack"

            [virtual_packages]
            query_cuda = false
            "#,
        )
        .unwrap();
        assert_eq!(config.solver, SolverKind::Backtrack);
        assert!(!config.virtual_packages.query_cuda);
        assert_eq!(config.channel_alias, "https://conda.anaconda.org");
        assert_eq!(config.timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "solver = 3").unwrap();
        let err = SolvableConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(Verbosity::from_level(0).directive(), "error");
        assert_eq!(Verbosity::from_level(7), Verbosity::Debug);
        assert!(!Verbosity::Verbose.logs_solutions());
    }
}

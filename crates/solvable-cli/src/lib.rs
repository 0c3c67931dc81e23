//! check-solvable - feedstock solvability checks from the command line
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Wires configuration, logging and the `solvable-core` driver together.
//!
//! # Commands
//!
//! - `check <feedstock>`: is every variant of a feedstock buildable?
//! - `solve <specs...>`: one solve against a set of channels.
//! - `virtual-packages --output <dir>`: write the synthetic virtual package
//!   channel to disk.
//! - `completions <shell>`: shell completion scripts.

pub mod cmd;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use solvable_core::SolverKind;
use solvable_schema::Subdir;

#[derive(Debug, Parser)]
#[command(name = "check-solvable")]
#[command(author, version, about = "Check whether a conda feedstock can be built")]
pub struct Cli {
    /// TOML config file; built-in defaults apply when omitted
    #[arg(long, global = true, env = "SOLVABLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log more (repeat for more detail)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Verbosity on the 0..=3 scale: `-q` is 0, the default is 1.
    pub fn verbosity_level(&self) -> u8 {
        if self.quiet {
            0
        } else {
            self.verbose.saturating_add(1)
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check whether every variant of a feedstock is solvable
    Check(CheckArgs),
    /// Solve a set of specs against channels
    Solve(SolveArgs),
    /// Write the virtual package catalog as a local channel
    #[command(name = "virtual-packages")]
    VirtualPackages {
        /// Directory to write the channel into
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Feedstock directory containing `recipe/` and `.ci_support/`
    pub feedstock: PathBuf,

    /// Seconds before the check gives up and reports solvable (0 disables)
    #[arg(long, env = "SOLVABLE_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Solver backend: pubgrub or backtrack
    #[arg(long, env = "SOLVABLE_SOLVER")]
    pub solver: Option<SolverKind>,

    /// Channels ranked above the variant's channel sources
    #[arg(long, env = "SOLVABLE_ADDITIONAL_CHANNELS", value_delimiter = ',')]
    pub additional_channels: Vec<String>,

    /// Build platform override, e.g. `osx_arm64=osx_64`
    #[arg(long, value_parser = parse_key_value)]
    pub build_platform: Vec<(String, String)>,

    /// Print the verdict as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SolveArgs {
    /// Match specs to install
    #[arg(required = true)]
    pub specs: Vec<String>,

    /// Channel names or URLs, highest priority first
    #[arg(long, short, default_value = "conda-forge")]
    pub channel: Vec<String>,

    /// Target subdir
    #[arg(long, short, default_value = "linux-64")]
    pub platform: Subdir,

    /// Specs that constrain but are not installed
    #[arg(long)]
    pub constraint: Vec<String>,

    /// Solver backend: pubgrub or backtrack
    #[arg(long, env = "SOLVABLE_SOLVER")]
    pub solver: Option<SolverKind>,

    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parse a `key=value` pair.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() || value.is_empty() {
        return Err(format!("expected key=value, got '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("osx_arm64=osx_64"),
            Ok(("osx_arm64".to_string(), "osx_64".to_string()))
        );
        assert!(parse_key_value("osx_arm64").is_err());
        assert!(parse_key_value("=osx_64").is_err());
    }

    #[test]
    fn test_check_args() {
        let cli = Cli::parse_from([
            "check-solvable",
            "-vv",
            "check",
            "feedstock",
            "--solver",
            "backtrack",
            "--additional-channels",
            "a,b",
            "--build-platform",
            "osx_arm64=osx_64",
        ]);
        assert_eq!(cli.verbosity_level(), 3);
        let Commands::Check(args) = cli.command else {
            panic!("expected check");
        };
        assert_eq!(args.solver, Some(SolverKind::Backtrack));
        assert_eq!(args.additional_channels, vec!["a", "b"]);
        assert_eq!(args.build_platform, vec![("osx_arm64".to_string(), "osx_64".to_string())]);
    }

    #[test]
    fn test_solve_defaults() {
        let cli = Cli::parse_from(["check-solvable", "-q", "solve", "python >=3.12"]);
        assert_eq!(cli.verbosity_level(), 0);
        let Commands::Solve(args) = cli.command else {
            panic!("expected solve");
        };
        assert_eq!(args.channel, vec!["conda-forge"]);
        assert_eq!(args.platform.as_str(), "linux-64");
    }
}

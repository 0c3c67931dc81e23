//! check-solvable - conda feedstock solvability checker

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use solvable_core::{SolvableConfig, Verbosity};
use tracing_subscriber::EnvFilter;

use solvable_cli::cmd;
use solvable_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let verbosity = Verbosity::from_level(cli.verbosity_level());

    // RUST_LOG wins over -v/-q
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => SolvableConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SolvableConfig::default(),
    };

    let success = match cli.command {
        Commands::Check(args) => cmd::check::check(config, &args, verbosity).await?,
        Commands::Solve(args) => cmd::solve::solve(config, &args, verbosity).await?,
        Commands::VirtualPackages { output } => {
            cmd::virtual_packages::virtual_packages(&config, &output).await?;
            true
        }
        Commands::Completions { shell } => {
            cmd::completions::completions(shell);
            true
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

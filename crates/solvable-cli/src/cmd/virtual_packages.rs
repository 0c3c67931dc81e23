//! Virtual packages command

use std::path::Path;

use anyhow::{Context, Result};
use solvable_core::SolvableConfig;
use solvable_core::session::http_client;
use solvable_core::virtual_packages::VirtualPackageRegistry;

/// Write the virtual package catalog under `output` and print its channel URL
pub async fn virtual_packages(config: &SolvableConfig, output: &Path) -> Result<()> {
    let client = http_client(config).context("Failed to build HTTP client")?;
    let registry = VirtualPackageRegistry::discover(&client, &config.virtual_packages).await;
    let url = registry
        .write_repodata(output)
        .with_context(|| format!("Failed to write repodata under {}", output.display()))?;
    println!("{url}");
    Ok(())
}

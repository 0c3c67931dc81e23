//! Recipe rendering.
//!
//! The pipeline only needs each output's name, flags and requirement lists
//! for one variant. [`RecipeRenderer`] is that seam; [`MetaYamlRenderer`]
//! implements it for `meta.yaml` recipes with the subset of conda-build's
//! Jinja and selector handling that requirement sections use.

pub mod jinja;
pub mod meta_yaml;
pub mod selectors;

use std::fmt;
use std::path::{Path, PathBuf};

use solvable_schema::Subdir;
use thiserror::Error;

use crate::requirements::RequirementSet;
use crate::variant::VariantConfig;

pub use meta_yaml::MetaYamlRenderer;

/// Name of the primary recipe manifest.
pub const RECIPE_FILE: &str = "meta.yaml";

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("recipe {0} not found")]
    MissingRecipe(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML in rendered {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("template error: {0}")]
    Template(String),

    #[error("invalid recipe: {0}")]
    Invalid(String),
}

/// What to render: one recipe for one variant on one target.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub recipe_dir: &'a Path,
    /// Where the outputs will run.
    pub target: &'a Subdir,
    /// Where the build toolchain runs.
    pub build: &'a Subdir,
    pub variant: &'a VariantConfig,
    pub channel_urls: &'a [String],
}

/// One rendered output of a recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeOutput {
    pub name: String,
    pub version: String,
    /// Build and host environments are separate.
    pub is_cross: bool,
    pub noarch: bool,
    pub noarch_python: bool,
    /// Build and host environments are merged.
    pub build_is_host: bool,
    pub build: RequirementSet,
    pub host: RequirementSet,
    pub run: RequirementSet,
    pub run_constrained: RequirementSet,
    pub test: RequirementSet,
    pub ignore_run_exports: Vec<String>,
    pub ignore_run_exports_from: Vec<String>,
}

impl RecipeOutput {
    /// Either kind of noarch.
    pub fn is_noarch(&self) -> bool {
        self.noarch || self.noarch_python
    }
}

/// Turns a recipe directory into rendered outputs.
pub trait RecipeRenderer: Send + Sync + fmt::Debug {
    fn render(&self, request: &RenderRequest<'_>) -> Result<Vec<RecipeOutput>, RenderError>;
}

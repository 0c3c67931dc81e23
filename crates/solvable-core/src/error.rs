use thiserror::Error;

use crate::config::ConfigError;
use crate::index::IndexError;
use crate::pins::PinError;
use crate::render::RenderError;
use crate::solver::SolveError;
use crate::variant::VariantError;

/// Everything that can stop one feedstock check.
///
/// Unsatisfiable requirements are not errors; they are reported in the
/// verdict.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error(transparent)]
    Solve(#[from] SolveError),

    #[error(transparent)]
    Pin(#[from] PinError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Variant(#[from] VariantError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CheckError {
    /// A deadline expired inside a solve.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Solve(SolveError::Cancelled))
    }
}

pub type Result<T> = std::result::Result<T, CheckError>;

//! Feedstock solvability checks.
//!
//! Renders every variant of a conda recipe, then proves or disproves that its
//! build, host, run and test requirements resolve against the configured
//! channels, propagating run exports between the stages the way a real
//! build would.
//!
//! The entry point is [`feedstock::is_recipe_solvable`].

pub mod channel;
pub mod config;
pub mod error;
pub mod feedstock;
pub mod index;
pub mod io;
pub mod normalize;
pub mod pins;
pub mod pipeline;
pub mod render;
pub mod requirements;
pub mod run_exports;
pub mod session;
pub mod solver;
pub mod variant;
pub mod virtual_packages;

pub use config::{SolvableConfig, SolverKind, Verbosity};
pub use error::CheckError;
pub use feedstock::{CheckOptions, FeedstockVerdict, is_recipe_solvable};
pub use session::Session;
pub use solver::{SolveOutcome, SolveRequest, Solver};

/// User Agent string for HTTP requests
pub const USER_AGENT: &str = concat!("solvable-core/", env!("CARGO_PKG_VERSION"));

//! Subcommand implementations

pub mod check;
pub mod completions;
pub mod solve;
pub mod virtual_packages;

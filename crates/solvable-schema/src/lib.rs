//! Shared conda data model for feedstock solvability checks.
//!
//! This crate has no I/O. It provides conda version ordering, version
//! constraints, match specs, subdirs, the repodata wire format and the
//! run-exports record used across the workspace.

pub mod match_spec;
pub mod record;
pub mod run_exports;
pub mod subdir;
pub mod version;
pub mod version_spec;

// Re-exports
pub use match_spec::{BuildMatcher, MatchSpec, MatchSpecError, RawParts, spec_name};
pub use record::{
    ArchiveType, NoArchKind, PackageRecord, RepoData, RepoDataInfo, archive_stem,
    split_artifact_name,
};
pub use run_exports::{Canonicalized, RunExportKind, RunExports};
pub use subdir::{ALL_PLATFORMS, NON_DEFAULT_ARCHES, Subdir};
pub use version::{Component, Version, VersionError};
pub use version_spec::{Constraint, Operator, VersionSpec, VersionSpecError};

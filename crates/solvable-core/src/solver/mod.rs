//! The solve engine.
//!
//! A [`Solver`] owns one package universe (channels × subdir, plus virtual
//! packages) and answers [`SolveRequest`]s against it. The search itself is
//! delegated to a [`SolveBackend`]; run exports of the solved packages are
//! gathered afterwards through the shared [`RunExportsResolver`].

pub mod backtrack;
pub mod pool;
pub mod pubgrub_adapter;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use solvable_schema::{MatchSpec, MatchSpecError, RunExports, Subdir};
use thiserror::Error;

use crate::config::{SolverKind, Verbosity};
use crate::normalize::{MalformedSpecError, normalize_all};
use crate::run_exports::{ArtifactKey, RunExportsResolver};

pub use backtrack::BacktrackBackend;
pub use pool::{Candidate, PackagePool, PoolBuilder};
pub use pubgrub_adapter::PubGrubBackend;

/// One package of a solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SolvedPackage {
    pub name: String,
    pub version: String,
    pub build: String,
    pub channel: String,
    pub subdir: Subdir,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl fmt::Display for SolvedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.version, self.build)
    }
}

/// Wall-clock budget shared by every solve of one check.
///
/// Clones share the cancellation flag, so cancelling any copy stops them all.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

impl Deadline {
    pub fn none() -> Self {
        Self {
            at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map_or_else(Self::none, Self::after)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether a wall-clock limit was set.
    pub fn is_bounded(&self) -> bool {
        self.at.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed) || self.at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Why a backend produced no solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveFailure {
    /// The specs cannot be satisfied; the explanation names the conflict.
    Unsatisfiable(String),
    /// The deadline expired mid-search.
    Cancelled,
}

/// A dependency resolution algorithm.
///
/// Backends see only parsed specs and a prepared pool. Whether the deadline
/// is honoured is reported by [`SolveBackend::supports_timeout`].
pub trait SolveBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn supports_timeout(&self) -> bool;

    /// Pick one candidate per required name so that every spec, every
    /// candidate dependency and every constraint holds. Names that only
    /// appear in `constraints` are never installed because of them.
    fn solve(
        &self,
        pool: &PackagePool,
        specs: &[MatchSpec],
        constraints: &[MatchSpec],
        deadline: &Deadline,
    ) -> Result<Vec<Arc<Candidate>>, SolveFailure>;
}

pub fn backend(kind: SolverKind) -> Arc<dyn SolveBackend> {
    match kind {
        SolverKind::Pubgrub => Arc::new(PubGrubBackend),
        SolverKind::Backtrack => Arc::new(BacktrackBackend::default()),
    }
}

/// Report requested names whose specs (and constraints) exclude each other.
///
/// Checked before searching so the message quotes the specs verbatim.
pub(crate) fn root_conflicts(
    pool: &PackagePool,
    specs: &[MatchSpec],
    constraints: &[MatchSpec],
) -> Option<String> {
    let mut required: BTreeMap<&str, Vec<&MatchSpec>> = BTreeMap::new();
    for spec in specs {
        required.entry(spec.name()).or_default().push(spec);
    }

    for (name, mut restricting) in required {
        restricting.extend(constraints.iter().filter(|c| c.name() == name));
        if restricting.len() < 2 {
            continue;
        }
        // A spec that matches nothing is reported by the backend.
        if !restricting.iter().all(|s| pool.matching(s).next().is_some()) {
            continue;
        }
        let satisfiable = pool
            .candidates(name)
            .iter()
            .any(|c| restricting.iter().all(|s| c.matches(s)));
        if !satisfiable {
            let quoted: Vec<&str> = restricting.iter().map(|s| s.as_str()).collect();
            return Some(format!(
                "Encountered problems while solving:\n  - conflicting requirements for {name}: {}",
                quoted.join(", ")
            ));
        }
    }
    None
}

/// Inputs of one solve.
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
    pub specs: Vec<String>,
    /// Pinned but not installed.
    pub constraints: Vec<String>,
    pub get_run_exports: bool,
    /// Packages whose run exports are skipped entirely.
    pub ignore_run_exports_from: Vec<String>,
    /// Run-export entries dropped by target name.
    pub ignore_run_exports: Vec<String>,
}

impl SolveRequest {
    pub fn new<S: AsRef<str>>(specs: &[S]) -> Self {
        Self {
            specs: specs.iter().map(|s| s.as_ref().to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn constraints<S: AsRef<str>>(mut self, constraints: &[S]) -> Self {
        self.constraints = constraints.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_run_exports(mut self) -> Self {
        self.get_run_exports = true;
        self
    }

    pub fn ignore_run_exports_from<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.ignore_run_exports_from = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn ignore_run_exports<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.ignore_run_exports = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }
}

/// Result of one solve. Infeasibility is an outcome, not an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SolveOutcome {
    pub solvable: bool,
    pub error: Option<String>,
    pub solution: Option<Vec<SolvedPackage>>,
    /// Set when run exports were requested and the solve succeeded.
    pub run_exports: Option<RunExports>,
}

impl SolveOutcome {
    /// The solution as `name version build` strings, sorted by name.
    pub fn solution_strings(&self) -> Vec<String> {
        self.solution
            .iter()
            .flatten()
            .map(ToString::to_string)
            .collect()
    }

    pub fn run_exports_or_default(&self) -> RunExports {
        self.run_exports.clone().unwrap_or_default()
    }
}

#[derive(Error, Debug)]
pub enum SolveError {
    #[error(transparent)]
    MalformedSpec(#[from] MalformedSpecError),

    #[error("invalid spec '{spec}': {source}")]
    InvalidSpec {
        spec: String,
        source: MatchSpecError,
    },

    #[error("solve cancelled: deadline expired")]
    Cancelled,

    #[error("solver worker failed: {0}")]
    Worker(String),
}

fn parse_all(specs: &[String]) -> Result<Vec<MatchSpec>, SolveError> {
    specs
        .iter()
        .map(|spec| {
            spec.parse().map_err(|source| SolveError::InvalidSpec {
                spec: spec.clone(),
                source,
            })
        })
        .collect()
}

/// Solves requests against one prepared package universe.
#[derive(Debug, Clone)]
pub struct Solver {
    subdir: Subdir,
    pool: Arc<PackagePool>,
    backend: Arc<dyn SolveBackend>,
    resolver: Arc<RunExportsResolver>,
    deadline: Deadline,
    verbosity: Verbosity,
}

impl Solver {
    pub fn new(
        subdir: Subdir,
        pool: Arc<PackagePool>,
        backend: Arc<dyn SolveBackend>,
        resolver: Arc<RunExportsResolver>,
    ) -> Self {
        Self {
            subdir,
            pool,
            backend,
            resolver,
            deadline: Deadline::none(),
            verbosity: Verbosity::default(),
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn subdir(&self) -> &Subdir {
        &self.subdir
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Solve `request`.
    ///
    /// Specs and constraints are normalized first; a malformed spec is an
    /// error. An unsatisfiable request is a successful call with
    /// `solvable == false`.
    pub async fn solve(&self, request: &SolveRequest) -> Result<SolveOutcome, SolveError> {
        let specs = normalize_all(&request.specs)?;
        let constraints = normalize_all(&request.constraints)?;
        let parsed_specs = parse_all(&specs)?;
        let parsed_constraints = parse_all(&constraints)?;

        tracing::debug!(
            "{} solve on {} for specs {specs:?} with constraints {constraints:?}",
            self.backend.name(),
            self.subdir
        );

        let pool = self.pool.clone();
        let backend = self.backend.clone();
        let deadline = self.deadline.clone();
        let result = tokio::task::spawn_blocking(move || {
            backend.solve(&pool, &parsed_specs, &parsed_constraints, &deadline)
        })
        .await
        .map_err(|e| SolveError::Worker(e.to_string()))?;

        let mut solved = match result {
            Ok(solved) => solved,
            Err(SolveFailure::Cancelled) => return Err(SolveError::Cancelled),
            Err(SolveFailure::Unsatisfiable(error)) => {
                tracing::debug!("unsatisfiable on {}: {error}", self.subdir);
                return Ok(SolveOutcome {
                    solvable: false,
                    error: Some(error),
                    solution: None,
                    run_exports: None,
                });
            }
        };
        solved.sort_by(|a, b| a.name().cmp(b.name()));

        if self.verbosity.logs_solutions() {
            let lines: Vec<String> = solved.iter().map(ToString::to_string).collect();
            tracing::debug!("SOLUTION on {}:\n    {}", self.subdir, lines.join("\n    "));
        }

        let run_exports = if request.get_run_exports {
            let requested: HashSet<&str> = specs.iter().map(|s| solvable_schema::spec_name(s)).collect();
            Some(self.collect_run_exports(&solved, &requested, request).await)
        } else {
            None
        };

        Ok(SolveOutcome {
            solvable: true,
            error: None,
            solution: Some(solved.iter().map(|c| c.to_solved()).collect()),
            run_exports,
        })
    }

    /// Union the run exports of the directly requested packages.
    async fn collect_run_exports(
        &self,
        solved: &[Arc<Candidate>],
        requested: &HashSet<&str>,
        request: &SolveRequest,
    ) -> RunExports {
        let mut aggregate = RunExports::default();
        for candidate in solved {
            if candidate.is_virtual()
                || !requested.contains(candidate.name())
                || request
                    .ignore_run_exports_from
                    .iter()
                    .any(|n| n == candidate.name())
            {
                continue;
            }
            let key = ArtifactKey::new(
                &candidate.channel,
                candidate.subdir.clone(),
                &candidate.filename,
            );
            let rx = self
                .resolver
                .resolve(&key, candidate.record.sha256.as_deref())
                .await;
            aggregate.merge(&rx.without_names(&request.ignore_run_exports));
        }
        aggregate
    }
}

//! PubGrub adapter for conda package resolution.
//!
//! PubGrub needs totally ordered versions with contiguous ranges. Conda
//! specs select arbitrary subsets of builds, so each package's candidates
//! are mapped onto [`Slot`]s in preference order and every spec becomes a
//! union of runs of matching slots. Two extra slot kinds model the rest:
//! [`Slot::Absent`] means "not installed" and lets constraints restrict a
//! package without requiring it; [`Slot::Missing`] stands for a spec that
//! matches nothing so the failure report can name it.

use std::borrow::Borrow;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use pubgrub::error::PubGrubError;
use pubgrub::range::Range;
use pubgrub::report::{DefaultStringReporter, Reporter};
use pubgrub::solver::{Dependencies, DependencyConstraints, DependencyProvider};
use solvable_schema::MatchSpec;

use super::pool::{Candidate, PackagePool};
use super::{Deadline, SolveBackend, SolveFailure, root_conflicts};

/// A package as PubGrub sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PkgId {
    /// The virtual root that depends on the requested specs.
    Root,
    Name(Arc<str>),
}

impl fmt::Display for PkgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("environment"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Display labels of one package's candidates, shared by its slots.
pub type SlotLabels = Arc<[Arc<str>]>;

/// A position in one package's version order.
///
/// Ordering is `Root < Absent < Missing < Candidate`, then by index. Labels
/// are for display only and do not take part in comparisons.
#[derive(Debug, Clone)]
pub enum Slot {
    Root,
    Absent(u32),
    Missing(Arc<str>, u32),
    Candidate(SlotLabels, u32),
}

impl Slot {
    fn rank(&self) -> (u8, u32) {
        match self {
            Self::Root => (0, 0),
            Self::Absent(i) => (1, *i),
            Self::Missing(_, i) => (2, *i),
            Self::Candidate(_, i) => (3, *i),
        }
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Slot {}

impl Hash for Slot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("specs"),
            Self::Absent(_) => f.write_str("none"),
            Self::Missing(spec, _) => f.write_str(spec),
            Self::Candidate(labels, i) => match labels.get(*i as usize) {
                Some(label) => f.write_str(label),
                None => f.write_str("(newest)"),
            },
        }
    }
}

impl pubgrub::version::Version for Slot {
    fn lowest() -> Self {
        Self::Root
    }

    fn bump(&self) -> Self {
        match self {
            Self::Root => Self::Absent(0),
            Self::Absent(i) => Self::Absent(i + 1),
            Self::Missing(spec, i) => Self::Missing(spec.clone(), i + 1),
            Self::Candidate(labels, i) => Self::Candidate(labels.clone(), i + 1),
        }
    }
}

#[derive(Debug)]
struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("solve cancelled")
    }
}

impl Error for Cancelled {}

/// Serves a [`PackagePool`] to PubGrub.
pub struct CondaDependencyProvider<'a> {
    pool: &'a PackagePool,
    specs: &'a [MatchSpec],
    constraints: &'a [MatchSpec],
    deadline: &'a Deadline,
    labels: RefCell<HashMap<String, SlotLabels>>,
    missing: RefCell<HashMap<(String, String), u32>>,
}

impl<'a> CondaDependencyProvider<'a> {
    pub fn new(
        pool: &'a PackagePool,
        specs: &'a [MatchSpec],
        constraints: &'a [MatchSpec],
        deadline: &'a Deadline,
    ) -> Self {
        Self {
            pool,
            specs,
            constraints,
            deadline,
            labels: RefCell::new(HashMap::new()),
            missing: RefCell::new(HashMap::new()),
        }
    }

    fn labels(&self, name: &str) -> SlotLabels {
        self.labels
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| {
                self.pool
                    .candidates(name)
                    .iter()
                    .map(|c| Arc::from(format!("{} {}", c.record.version, c.record.build)))
                    .collect()
            })
            .clone()
    }

    fn missing_slot(&self, spec: &MatchSpec) -> Slot {
        let mut missing = self.missing.borrow_mut();
        let next = u32::try_from(missing.len()).unwrap_or(u32::MAX);
        let index = *missing
            .entry((spec.name().to_string(), spec.as_str().to_string()))
            .or_insert(next);
        Slot::Missing(Arc::from(spec.as_str()), index)
    }

    /// Union of runs of matching candidates.
    fn matching_range(&self, spec: &MatchSpec) -> Range<Slot> {
        let labels = self.labels(spec.name());
        let slot = |i: usize| Slot::Candidate(labels.clone(), u32::try_from(i).unwrap_or(u32::MAX));
        let candidates = self.pool.candidates(spec.name());

        let mut range = Range::none();
        let mut run_start: Option<usize> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            match (candidate.matches(spec), run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    range = range.union(&Range::between(slot(start), slot(i)));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            range = range.union(&Range::higher_than(slot(start)));
        }
        range
    }

    /// Range of a hard requirement; a spec matching nothing gets its own slot.
    fn requirement_range(&self, spec: &MatchSpec) -> Range<Slot> {
        let range = self.matching_range(spec);
        if range == Range::none() {
            Range::exact(self.missing_slot(spec))
        } else {
            range
        }
    }

    /// Range of a constraint: matching candidates or not installed.
    fn constraint_range(&self, spec: &MatchSpec) -> Range<Slot> {
        self.matching_range(spec).union(&Range::exact(Slot::Absent(0)))
    }

    fn add(deps: &mut DependencyConstraints<PkgId, Slot>, name: &str, range: &Range<Slot>) {
        let id = PkgId::Name(Arc::from(name));
        let merged = match deps.get(&id) {
            Some(existing) => existing.intersection(range),
            None => range.clone(),
        };
        deps.insert(id, merged);
    }

    fn root_dependencies(&self) -> DependencyConstraints<PkgId, Slot> {
        let mut deps = DependencyConstraints::default();
        for spec in self.specs {
            Self::add(&mut deps, spec.name(), &self.requirement_range(spec));
        }
        for spec in self.constraints {
            Self::add(&mut deps, spec.name(), &self.constraint_range(spec));
        }
        deps
    }

    fn candidate_dependencies(&self, candidate: &Candidate) -> Dependencies<PkgId, Slot> {
        let (Ok(depends), Ok(constrains)) = (candidate.depends(), candidate.constrains()) else {
            tracing::debug!("unusable dependency metadata for {candidate}");
            return Dependencies::Unknown;
        };

        let mut deps = DependencyConstraints::default();
        for spec in depends.iter().filter(|s| s.name() != candidate.name()) {
            Self::add(&mut deps, spec.name(), &self.requirement_range(spec));
        }
        for spec in constrains.iter().filter(|s| s.name() != candidate.name()) {
            Self::add(&mut deps, spec.name(), &self.constraint_range(spec));
        }
        Dependencies::Known(deps)
    }

    fn available(&self, package: &PkgId) -> Vec<Slot> {
        match package {
            PkgId::Root => vec![Slot::Root],
            PkgId::Name(name) => {
                let labels = self.labels(name);
                std::iter::once(Slot::Absent(0))
                    .chain((0..labels.len()).map(|i| {
                        Slot::Candidate(labels.clone(), u32::try_from(i).unwrap_or(u32::MAX))
                    }))
                    .collect()
            }
        }
    }
}

impl DependencyProvider<PkgId, Slot> for CondaDependencyProvider<'_> {
    fn choose_package_version<T: Borrow<PkgId>, U: Borrow<Range<Slot>>>(
        &self,
        potential_packages: impl Iterator<Item = (T, U)>,
    ) -> Result<(T, Option<Slot>), Box<dyn Error>> {
        // Fewest choices first; within a package, not installing beats
        // installing, then preference order.
        Ok(pubgrub::solver::choose_package_with_fewest_versions(
            |package: &PkgId| self.available(package).into_iter(),
            potential_packages,
        ))
    }

    fn get_dependencies(
        &self,
        package: &PkgId,
        version: &Slot,
    ) -> Result<Dependencies<PkgId, Slot>, Box<dyn Error>> {
        Ok(match (package, version) {
            (PkgId::Root, _) => Dependencies::Known(self.root_dependencies()),
            (PkgId::Name(name), Slot::Candidate(_, i)) => {
                match self.pool.candidates(name).get(*i as usize) {
                    Some(candidate) => self.candidate_dependencies(candidate),
                    None => Dependencies::Unknown,
                }
            }
            (PkgId::Name(_), _) => Dependencies::Known(DependencyConstraints::default()),
        })
    }

    fn should_cancel(&self) -> Result<(), Box<dyn Error>> {
        if self.deadline.is_expired() {
            return Err(Box::new(Cancelled));
        }
        Ok(())
    }
}

/// Conflict-driven backend built on `pubgrub`.
#[derive(Debug, Default)]
pub struct PubGrubBackend;

impl SolveBackend for PubGrubBackend {
    fn name(&self) -> &'static str {
        "pubgrub"
    }

    fn supports_timeout(&self) -> bool {
        true
    }

    fn solve(
        &self,
        pool: &PackagePool,
        specs: &[MatchSpec],
        constraints: &[MatchSpec],
        deadline: &Deadline,
    ) -> Result<Vec<Arc<Candidate>>, SolveFailure> {
        if let Some(message) = root_conflicts(pool, specs, constraints) {
            return Err(SolveFailure::Unsatisfiable(message));
        }

        let provider = CondaDependencyProvider::new(pool, specs, constraints, deadline);
        match pubgrub::solver::resolve(&provider, PkgId::Root, Slot::Root) {
            Ok(selected) => {
                let mut solution: Vec<Arc<Candidate>> = selected
                    .into_iter()
                    .filter_map(|(package, slot)| match (package, slot) {
                        (PkgId::Name(name), Slot::Candidate(_, i)) => {
                            pool.candidates(&name).get(i as usize).cloned()
                        }
                        _ => None,
                    })
                    .collect();
                solution.sort_by(|a, b| a.name().cmp(b.name()));
                Ok(solution)
            }
            Err(PubGrubError::NoSolution(mut tree)) => {
                tree.collapse_no_versions();
                Err(SolveFailure::Unsatisfiable(format!(
                    "Could not solve for environment specs\n{}",
                    DefaultStringReporter::report(&tree)
                )))
            }
            Err(PubGrubError::ErrorInShouldCancel(_)) => Err(SolveFailure::Cancelled),
            Err(e) => Err(SolveFailure::Unsatisfiable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::pool::tests::{pool, record};

    fn specs(specs: &[&str]) -> Vec<MatchSpec> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn solve(pool: &PackagePool, req: &[&str], cons: &[&str]) -> Result<Vec<String>, SolveFailure> {
        PubGrubBackend
            .solve(pool, &specs(req), &specs(cons), &Deadline::none())
            .map(|s| s.iter().map(ToString::to_string).collect())
    }

    fn universe() -> PackagePool {
        pool(vec![
            record("python", "3.12.4", "h0_cpython", &["libzlib >=1.3"]),
            record("python", "3.11.9", "h0_cpython", &["libzlib >=1.2"]),
            record("libzlib", "1.3.1", "h0", &[]),
            record("libzlib", "1.2.13", "h0", &[]),
            record("numpy", "2.0.0", "py312h0", &["python >=3.12,<3.13.0a0"]),
            record("numpy", "1.26.4", "py311h0", &["python >=3.11,<3.12.0a0"]),
            record("numpy", "1.26.4", "py312h0", &["python >=3.12,<3.13.0a0"]),
        ])
    }

    #[test]
    fn test_prefers_newest() {
        let solution = solve(&universe(), &["numpy"], &[]).unwrap();
        assert_eq!(
            solution,
            vec!["libzlib 1.3.1 h0", "numpy 2.0.0 py312h0", "python 3.12.4 h0_cpython"]
        );
    }

    #[test]
    fn test_backtracks_on_python_pin() {
        let solution = solve(&universe(), &["numpy <2", "python 3.11.*"], &[]).unwrap();
        assert!(solution.contains(&"numpy 1.26.4 py311h0".to_string()));
        assert!(solution.contains(&"python 3.11.9 h0_cpython".to_string()));
    }

    #[test]
    fn test_constraints_restrict_without_installing() {
        let solution = solve(&universe(), &["libzlib"], &["libzlib <1.3", "python 3.11.*"]).unwrap();
        assert_eq!(solution, vec!["libzlib 1.2.13 h0"]);

        let err = solve(&universe(), &["numpy 2.*"], &["python 3.11.*"]).unwrap_err();
        assert!(matches!(err, SolveFailure::Unsatisfiable(_)));
    }

    #[test]
    fn test_missing_package_is_named() {
        let SolveFailure::Unsatisfiable(message) =
            solve(&universe(), &["python >=4.0"], &[]).unwrap_err()
        else {
            panic!("expected unsatisfiable")
        };
        assert!(message.contains("python"), "{message}");
    }

    #[test]
    fn test_exclusive_exact_versions_conflict() {
        let SolveFailure::Unsatisfiable(message) =
            solve(&universe(), &["libzlib 1.3.1", "libzlib 1.2.13"], &[]).unwrap_err()
        else {
            panic!("expected unsatisfiable")
        };
        assert!(message.contains("libzlib 1.3.1"), "{message}");
        assert!(message.contains("libzlib 1.2.13"), "{message}");
    }

    #[test]
    fn test_candidate_constrains() {
        let mut basix = record("fenics-basix", "0.8.0", "h0", &[]);
        basix.constrains = vec!["nanobind 1.9.2".to_string()];
        let pool = pool(vec![
            basix,
            record("nanobind", "2.0.0", "h0", &[]),
            record("nanobind", "1.9.2", "h0", &[]),
        ]);

        let solution = solve(&pool, &["fenics-basix", "nanobind"], &[]).unwrap();
        assert!(solution.contains(&"nanobind 1.9.2 h0".to_string()));

        let SolveFailure::Unsatisfiable(message) =
            solve(&pool, &["fenics-basix", "nanobind 2.0.0"], &[]).unwrap_err()
        else {
            panic!("expected unsatisfiable")
        };
        assert!(message.contains("fenics-basix"), "{message}");
        assert!(message.contains("nanobind"), "{message}");
    }

    #[test]
    fn test_expired_deadline_cancels() {
        let deadline = Deadline::none();
        deadline.cancel();
        let result = PubGrubBackend.solve(&universe(), &specs(&["numpy"]), &[], &deadline);
        assert!(matches!(result, Err(SolveFailure::Cancelled)));
    }
}

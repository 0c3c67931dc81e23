//! Depth-first backtracking backend.
//!
//! Picks candidates in preference order and backs out on conflict. Simple
//! and exhaustive, but it has no wall-clock budget: the deadline is ignored
//! and a step limit bounds pathological searches instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use solvable_schema::MatchSpec;

use super::pool::{Candidate, PackagePool};
use super::{Deadline, SolveBackend, SolveFailure, root_conflicts};

const DEFAULT_STEP_LIMIT: usize = 200_000;

#[derive(Debug)]
pub struct BacktrackBackend {
    step_limit: usize,
    warned: AtomicBool,
}

impl Default for BacktrackBackend {
    fn default() -> Self {
        Self::with_step_limit(DEFAULT_STEP_LIMIT)
    }
}

#[derive(Clone, Default)]
struct State {
    pending: Vec<MatchSpec>,
    assigned: BTreeMap<String, Arc<Candidate>>,
    /// `constrains` of assigned candidates and the caller's constraints.
    restrictions: Vec<MatchSpec>,
}

#[derive(Default)]
struct Conflict {
    package: String,
    specs: Vec<String>,
}

struct Search<'a> {
    pool: &'a PackagePool,
    steps: usize,
    limit: usize,
    conflict: Option<Conflict>,
}

impl Search<'_> {
    fn record_conflict(&mut self, package: &str, specs: Vec<String>) {
        let deeper = self
            .conflict
            .as_ref()
            .is_none_or(|c| specs.len() >= c.specs.len());
        if deeper {
            self.conflict = Some(Conflict {
                package: package.to_string(),
                specs,
            });
        }
    }

    fn admissible(state: &State, candidate: &Candidate) -> bool {
        let restricted = state
            .restrictions
            .iter()
            .filter(|r| r.name() == candidate.name())
            .all(|r| candidate.matches(r));
        let Ok(constrains) = candidate.constrains() else {
            return false;
        };
        let compatible = constrains.iter().all(|c| {
            state
                .assigned
                .get(c.name())
                .is_none_or(|assigned| assigned.matches(c))
        });
        restricted && compatible
    }

    fn run(&mut self, mut state: State) -> Result<Option<State>, SolveFailure> {
        self.steps += 1;
        if self.steps > self.limit {
            return Err(SolveFailure::Unsatisfiable(format!(
                "backtracking solver gave up after {} steps",
                self.limit
            )));
        }

        let Some(spec) = state.pending.pop() else {
            return Ok(Some(state));
        };

        if let Some(assigned) = state.assigned.get(spec.name()) {
            if assigned.matches(&spec) {
                return self.run(state);
            }
            let specs = vec![spec.to_string(), format!("{assigned} (selected)")];
            self.record_conflict(spec.name(), specs);
            return Ok(None);
        }

        let pool = self.pool;
        let mut matched_any = false;
        for candidate in pool.matching(&spec) {
            matched_any = true;
            if !Self::admissible(&state, candidate) {
                continue;
            }
            let Ok(depends) = candidate.depends() else {
                continue;
            };

            let mut next = state.clone();
            next.assigned
                .insert(candidate.name().to_string(), candidate.clone());
            if let Ok(constrains) = candidate.constrains() {
                next.restrictions.extend(constrains.iter().cloned());
            }
            next.pending
                .extend(depends.iter().rev().filter(|d| d.name() != candidate.name()).cloned());

            if let Some(solved) = self.run(next)? {
                return Ok(Some(solved));
            }
        }

        let mut specs = vec![spec.to_string()];
        if matched_any {
            specs.extend(
                state
                    .restrictions
                    .iter()
                    .filter(|r| r.name() == spec.name())
                    .map(ToString::to_string),
            );
            specs.extend(
                state
                    .assigned
                    .values()
                    .filter(|a| {
                        a.constrains()
                            .is_ok_and(|c| c.iter().any(|c| c.name() == spec.name()))
                    })
                    .map(|a| format!("{a} (selected)")),
            );
        } else {
            specs.push("nothing provides it".to_string());
        }
        self.record_conflict(spec.name(), specs);
        Ok(None)
    }
}

impl BacktrackBackend {
    pub fn with_step_limit(step_limit: usize) -> Self {
        Self {
            step_limit,
            warned: AtomicBool::new(false),
        }
    }
}

impl SolveBackend for BacktrackBackend {
    fn name(&self) -> &'static str {
        "backtrack"
    }

    fn supports_timeout(&self) -> bool {
        false
    }

    fn solve(
        &self,
        pool: &PackagePool,
        specs: &[MatchSpec],
        constraints: &[MatchSpec],
        deadline: &Deadline,
    ) -> Result<Vec<Arc<Candidate>>, SolveFailure> {
        if deadline.is_bounded() && !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!("The backtrack solver does not support timeouts; ignoring the deadline.");
        }
        if let Some(message) = root_conflicts(pool, specs, constraints) {
            return Err(SolveFailure::Unsatisfiable(message));
        }

        let state = State {
            pending: specs.iter().rev().cloned().collect(),
            assigned: BTreeMap::new(),
            restrictions: constraints.to_vec(),
        };
        let mut search = Search {
            pool,
            steps: 0,
            limit: self.step_limit,
            conflict: None,
        };

        match search.run(state)? {
            Some(state) => Ok(state.assigned.into_values().collect()),
            None => {
                let conflict = search.conflict.unwrap_or_default();
                Err(SolveFailure::Unsatisfiable(format!(
                    "Encountered problems while solving:\n  - package {} cannot satisfy: {}",
                    conflict.package,
                    conflict.specs.join(", ")
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::pool::tests::{pool, record};
    use std::time::Duration;

    fn specs(specs: &[&str]) -> Vec<MatchSpec> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn universe() -> PackagePool {
        let mut basix = record("fenics-basix", "0.8.0", "h0", &["python"]);
        basix.constrains = vec!["nanobind 1.9.2".to_string()];
        pool(vec![
            basix,
            record("python", "3.12.4", "h0", &[]),
            record("python", "3.11.9", "h0", &[]),
            record("nanobind", "2.0.0", "h0", &["python >=3.12"]),
            record("nanobind", "1.9.2", "h0", &["python"]),
        ])
    }

    #[test]
    fn test_solution() {
        let solution = BacktrackBackend::default()
            .solve(&universe(), &specs(&["fenics-basix", "nanobind"]), &[], &Deadline::none())
            .unwrap();
        let names: Vec<String> = solution.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["fenics-basix 0.8.0 h0", "nanobind 1.9.2 h0", "python 3.12.4 h0"]
        );
    }

    #[test]
    fn test_constraints() {
        let solution = BacktrackBackend::default()
            .solve(&universe(), &specs(&["nanobind"]), &specs(&["python 3.11.*"]), &Deadline::none())
            .unwrap();
        assert!(solution.iter().any(|c| c.to_string() == "nanobind 1.9.2 h0"));
    }

    #[test]
    fn test_conflict_names_packages() {
        let err = BacktrackBackend::default()
            .solve(
                &universe(),
                &specs(&["fenics-basix", "nanobind 2.0.0"]),
                &[],
                &Deadline::none(),
            )
            .unwrap_err();
        let SolveFailure::Unsatisfiable(message) = err else {
            panic!("expected unsatisfiable")
        };
        assert!(message.contains("nanobind"), "{message}");
        assert!(message.contains("fenics-basix"), "{message}");
    }

    #[test]
    fn test_ignores_deadline() {
        let deadline = Deadline::after(Duration::ZERO);
        let result = BacktrackBackend::default().solve(&universe(), &specs(&["python"]), &[], &deadline);
        assert!(result.is_ok());
    }

    #[test]
    fn test_step_limit() {
        let err = BacktrackBackend::with_step_limit(1)
            .solve(&universe(), &specs(&["fenics-basix"]), &[], &Deadline::none())
            .unwrap_err();
        assert!(matches!(err, SolveFailure::Unsatisfiable(m) if m.contains("gave up")));
    }
}

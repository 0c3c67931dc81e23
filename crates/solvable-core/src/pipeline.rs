//! The per-output requirement pipeline.
//!
//! Every rendered output goes through four stages in order:
//!
//! 1. **build**: solve the build requirements on the build platform and
//!    propagate their run exports into host, run and `run_constrained`.
//! 2. **host**: solve the (extended) host requirements on the target
//!    platform; cross builds also propagate host run exports.
//! 3. **run**: evaluate pins against the solved host or build set and solve
//!    the run requirements under `run_constrained`.
//! 4. **test**: solve the test requirements together with the run set.
//!
//! A failed stage marks the output unsolvable and records its explanation,
//! then the remaining stages still run with whatever sets resulted.

use std::collections::BTreeMap;

use serde::Serialize;
use solvable_schema::RunExports;
use tracing::Instrument;

use crate::error::CheckError;
use crate::pins::{PinContext, PinRunAsBuild, apply_pins};
use crate::render::RecipeOutput;
use crate::requirements::RequirementSet;
use crate::solver::{SolveOutcome, SolveRequest, Solver};

/// Result of checking one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputVerdict {
    pub name: String,
    pub solvable: bool,
    pub errors: Vec<String>,
}

impl OutputVerdict {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            solvable: true,
            errors: Vec::new(),
        }
    }

    fn record(&mut self, outcome: &SolveOutcome) {
        self.solvable &= outcome.solvable;
        if let Some(error) = &outcome.error {
            self.errors.push(error.clone());
        }
    }
}

/// Requirement sets as they evolve through the stages.
#[derive(Debug, Clone, Default)]
struct Stages {
    build: Vec<String>,
    host: RequirementSet,
    run: RequirementSet,
    run_constrained: RequirementSet,
}

/// Everything one variant shares across its outputs.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline<'a> {
    /// Solves on the platform the build toolchain runs on.
    pub build_solver: &'a Solver,
    /// Solves on the target platform: host, run and test.
    pub host_solver: &'a Solver,
    pub pin_run_as_build: &'a BTreeMap<String, PinRunAsBuild>,
    pub variant: &'a BTreeMap<String, String>,
    pub strict_pins: bool,
}

impl Pipeline<'_> {
    /// Run every output of a recipe. The result is solvable only if every
    /// output is.
    pub async fn check_outputs(&self, outputs: &[RecipeOutput]) -> Result<Vec<OutputVerdict>, CheckError> {
        let names: Vec<String> = outputs.iter().map(|o| o.name.clone()).collect();
        let mut verdicts = Vec::with_capacity(outputs.len());
        for output in outputs {
            verdicts.push(self.check_output(output, &names).await?);
        }
        Ok(verdicts)
    }

    /// Run the four stages for one output. `output_names` are all outputs of
    /// the recipe; they are stripped from every requirement set.
    pub async fn check_output(
        &self,
        output: &RecipeOutput,
        output_names: &[String],
    ) -> Result<OutputVerdict, CheckError> {
        let span = tracing::info_span!("output", name = %output.name);
        self.run_stages(output, output_names).instrument(span).await
    }

    async fn run_stages(&self, output: &RecipeOutput, names: &[String]) -> Result<OutputVerdict, CheckError> {
        tracing::debug!("checking recipe {}", output.name);
        let mut verdict = OutputVerdict::new(&output.name);
        let mut stages = Stages {
            build: Vec::new(),
            host: output.host.clone(),
            run: output.run.clone(),
            run_constrained: output.run_constrained.clone(),
        };

        if !output.build.is_empty() {
            let build_req = output.build.without_names(names);
            let outcome = self
                .build_solver
                .solve(&self.with_ignores(&build_req.to_vec(), output))
                .await?;
            verdict.record(&outcome);
            stages.build = outcome.solution_strings();
            propagate_build_exports(&mut stages, output, &outcome.run_exports_or_default());
        }

        let mut host_solution = Vec::new();
        if !stages.host.is_empty() {
            let host_req = stages.host.without_names(names);
            let outcome = self
                .host_solver
                .solve(&self.with_ignores(&host_req.to_vec(), output))
                .await?;
            verdict.record(&outcome);
            host_solution = outcome.solution_strings();
            if output.is_cross {
                propagate_host_exports(&mut stages, output, &outcome.run_exports_or_default());
            }
        }

        let ctx = PinContext {
            is_cross: output.is_cross,
            noarch: output.is_noarch(),
            strict: self.strict_pins,
            pin_run_as_build: self.pin_run_as_build,
            variant: self.variant,
        };
        let constraints = apply_pins(&stages.run_constrained, &host_solution, &stages.build, names, &ctx)?
            .without_names(names)
            .to_vec();

        let mut run_req = stages.run.to_vec();
        if !stages.run.is_empty() {
            run_req = apply_pins(&stages.run, &host_solution, &stages.build, names, &ctx)?
                .without_names(names)
                .to_vec();
            let request = SolveRequest::new(&run_req).constraints(&constraints);
            let outcome = self.host_solver.solve(&request).await?;
            verdict.record(&outcome);
        }

        let mut test_req = output.test.clone();
        test_req.extend(&run_req);
        if !test_req.is_empty() {
            let test_req = test_req.without_names(names).to_vec();
            let request = SolveRequest::new(&test_req).constraints(&constraints);
            let outcome = self.host_solver.solve(&request).await?;
            verdict.record(&outcome);
        }

        if !verdict.solvable {
            tracing::info!("{} is not solvable: {} problem(s)", output.name, verdict.errors.len());
        }
        Ok(verdict)
    }

    fn with_ignores(&self, specs: &[String], output: &RecipeOutput) -> SolveRequest {
        SolveRequest::new(specs)
            .with_run_exports()
            .ignore_run_exports_from(&output.ignore_run_exports_from)
            .ignore_run_exports(&output.ignore_run_exports)
    }
}

/// Where build run exports go.
///
/// `strong_constrains` always constrain the run environment. Cross builds
/// send `strong` to host (and to run unless noarch). Native builds send
/// `strong` to run; merged build/host environments also take `weak` and
/// `weak_constrains`, separate ones send `strong` to host as well. Native
/// noarch outputs only take the `noarch` bucket, and only when build is host.
fn propagate_build_exports(stages: &mut Stages, output: &RecipeOutput, rx: &RunExports) {
    stages.run_constrained.extend(&rx.strong_constrains);

    if output.is_cross {
        stages.host.extend(&rx.strong);
        if !output.is_noarch() {
            stages.run.extend(&rx.strong);
        }
    } else if output.is_noarch() {
        if output.build_is_host {
            stages.run.extend(&rx.noarch);
        }
    } else {
        stages.run.extend(&rx.strong);
        if output.build_is_host {
            stages.run.extend(&rx.weak);
            stages.run_constrained.extend(&rx.weak_constrains);
        } else {
            stages.host.extend(&rx.strong);
        }
    }
}

/// Host run exports of a cross build: `noarch` for noarch outputs, otherwise
/// `weak` and `strong`. Both constrain buckets always apply.
fn propagate_host_exports(stages: &mut Stages, output: &RecipeOutput, rx: &RunExports) {
    if output.is_noarch() {
        stages.run.extend(&rx.noarch);
    } else {
        stages.run.extend(&rx.weak);
        stages.run.extend(&rx.strong);
    }
    stages.run_constrained.extend(&rx.weak_constrains);
    stages.run_constrained.extend(&rx.strong_constrains);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::io::MetadataFetchError;
    use crate::run_exports::{ArtifactKey, Lookup, RunExportSource, RunExportsResolver};
    use crate::solver::pool::tests::{pool, record};
    use crate::solver::{PackagePool, PubGrubBackend};

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn reqs(items: &[&str]) -> RequirementSet {
        items.iter().collect()
    }

    #[test]
    fn test_native_build_exports() {
        let rx = RunExports {
            weak: set(&["libgcc >=13"]),
            strong: set(&["libstdcxx >=13"]),
            strong_constrains: set(&["sysroot_linux-64 >=2.17"]),
            ..RunExports::default()
        };
        let output = RecipeOutput {
            is_cross: false,
            build_is_host: true,
            ..RecipeOutput::default()
        };
        let mut stages = Stages::default();
        propagate_build_exports(&mut stages, &output, &rx);
        assert_eq!(stages.run.to_vec(), vec!["libstdcxx >=13", "libgcc >=13"]);
        assert_eq!(stages.run_constrained.to_vec(), vec!["sysroot_linux-64 >=2.17"]);
        assert!(stages.host.is_empty());

        let separate = RecipeOutput::default();
        let mut stages = Stages::default();
        propagate_build_exports(&mut stages, &separate, &rx);
        assert_eq!(stages.host.to_vec(), vec!["libstdcxx >=13"]);
        assert_eq!(stages.run.to_vec(), vec!["libstdcxx >=13"]);
    }

    #[test]
    fn test_noarch_and_cross_build_exports() {
        let rx = RunExports {
            strong: set(&["libstdcxx"]),
            noarch: set(&["python"]),
            ..RunExports::default()
        };
        let noarch = RecipeOutput {
            noarch: true,
            build_is_host: true,
            ..RecipeOutput::default()
        };
        let mut stages = Stages::default();
        propagate_build_exports(&mut stages, &noarch, &rx);
        assert_eq!(stages.run.to_vec(), vec!["python"]);

        let cross_noarch = RecipeOutput {
            is_cross: true,
            noarch_python: true,
            ..RecipeOutput::default()
        };
        let mut stages = Stages::default();
        propagate_build_exports(&mut stages, &cross_noarch, &rx);
        assert_eq!(stages.host.to_vec(), vec!["libstdcxx"]);
        assert!(stages.run.is_empty());
    }

    #[test]
    fn test_host_exports() {
        let rx = RunExports {
            weak: set(&["libzlib >=1.3.1,<2.0a0"]),
            noarch: set(&["zlib"]),
            weak_constrains: set(&["zlib-ng <2"]),
            ..RunExports::default()
        };
        let mut stages = Stages::default();
        propagate_host_exports(&mut stages, &RecipeOutput::default(), &rx);
        assert_eq!(stages.run.to_vec(), vec!["libzlib >=1.3.1,<2.0a0"]);
        assert_eq!(stages.run_constrained.to_vec(), vec!["zlib-ng <2"]);

        let noarch = RecipeOutput {
            noarch: true,
            ..RecipeOutput::default()
        };
        let mut stages = Stages::default();
        propagate_host_exports(&mut stages, &noarch, &rx);
        assert_eq!(stages.run.to_vec(), vec!["zlib"]);
    }

    #[derive(Debug)]
    struct IndexedRunExports;

    #[async_trait]
    impl RunExportSource for IndexedRunExports {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn lookup(
            &self,
            key: &ArtifactKey,
            _sha256: Option<&str>,
        ) -> Result<Lookup, MetadataFetchError> {
            let value = match key.name() {
                Some("zlib") => json!({"weak": ["libzlib >=1.3.1,<2.0a0"]}),
                Some("fenics-basix") => json!({"strong_constrains": ["nanobind 1.9.2"]}),
                _ => return Ok(Lookup::Absent),
            };
            Ok(Lookup::Found(RunExports::from_value(&value).run_exports))
        }
    }

    fn universe() -> PackagePool {
        pool(vec![
            record("python", "3.12.4", "h_0_cpython", &[]),
            record("zlib", "1.3.1", "h_0", &["libzlib 1.3.1 h_0"]),
            record("libzlib", "1.3.1", "h_0", &[]),
            record("fenics-basix", "0.8.0", "py312_0", &["python >=3.12,<3.13"]),
            record("nanobind", "2.0.0", "py312_0", &["python >=3.12"]),
            record("nanobind", "1.9.2", "py312_0", &["python >=3.12"]),
        ])
    }

    fn solver() -> Solver {
        Solver::new(
            "linux-64".parse().unwrap(),
            Arc::new(universe()),
            Arc::new(PubGrubBackend),
            Arc::new(RunExportsResolver::new(vec![Box::new(IndexedRunExports)])),
        )
    }

    async fn check(output: RecipeOutput) -> OutputVerdict {
        let names = vec![output.name.clone()];
        check_with_names(output, &names).await
    }

    async fn check_with_names(output: RecipeOutput, names: &[String]) -> OutputVerdict {
        let solver = solver();
        let (pins, variant) = (BTreeMap::new(), BTreeMap::new());
        let pipeline = Pipeline {
            build_solver: &solver,
            host_solver: &solver,
            pin_run_as_build: &pins,
            variant: &variant,
            strict_pins: false,
        };
        pipeline.check_output(&output, names).await.unwrap()
    }

    #[tokio::test]
    async fn test_solvable_output() {
        let verdict = check(RecipeOutput {
            name: "mypkg".to_string(),
            is_cross: true,
            host: reqs(&["python", "zlib"]),
            run: reqs(&["python", "mypkg"]),
            test: reqs(&["nanobind"]),
            ..RecipeOutput::default()
        })
        .await;
        assert!(verdict.solvable, "{:?}", verdict.errors);
        assert!(verdict.errors.is_empty());
    }

    #[tokio::test]
    async fn test_strong_constrains_conflict() {
        let verdict = check(RecipeOutput {
            name: "mypkg".to_string(),
            is_cross: true,
            host: reqs(&["python", "fenics-basix"]),
            run: reqs(&["python", "nanobind 2.0.0"]),
            ..RecipeOutput::default()
        })
        .await;
        assert!(!verdict.solvable);
        // Run and test both fail.
        assert_eq!(verdict.errors.len(), 2);
        assert!(verdict.errors[0].contains("nanobind"), "{}", verdict.errors[0]);
    }

    #[tokio::test]
    async fn test_failed_stage_does_not_stop_later_stages() {
        let verdict = check(RecipeOutput {
            name: "mypkg".to_string(),
            is_cross: true,
            host: reqs(&["python >=4.0"]),
            run: reqs(&["zlib 9"]),
            test: reqs(&["pytest"]),
            ..RecipeOutput::default()
        })
        .await;
        assert!(!verdict.solvable);
        assert_eq!(verdict.errors.len(), 3);
    }

    #[tokio::test]
    async fn test_sibling_outputs_never_reach_a_solve() {
        // No libzlib 2.0 exists; every stage only passes if the sibling is stripped.
        let names = vec!["zlib-split".to_string(), "libzlib".to_string()];
        let verdict = check_with_names(
            RecipeOutput {
                name: "zlib-split".to_string(),
                build: reqs(&["python", "libzlib 2.0"]),
                host: reqs(&["python", "libzlib 2.0"]),
                run: reqs(&["zlib", "zlib-split"]),
                run_constrained: reqs(&["libzlib 2.0"]),
                test: reqs(&["libzlib 2.0", "zlib-split"]),
                ..RecipeOutput::default()
            },
            &names,
        )
        .await;
        assert!(verdict.solvable, "{:?}", verdict.errors);
        assert!(verdict.errors.is_empty());
    }
}

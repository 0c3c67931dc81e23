//! Solve command

use anyhow::{Context, Result};
use solvable_core::solver::Deadline;
use solvable_core::{Session, SolvableConfig, SolveOutcome, SolveRequest, Verbosity};
use solvable_schema::RunExportKind;

use crate::SolveArgs;

/// Run one solve and print the outcome. Returns whether it succeeded.
pub async fn solve(config: SolvableConfig, args: &SolveArgs, verbosity: Verbosity) -> Result<bool> {
    let kind = args.solver.unwrap_or(config.solver);
    let session = Session::new(config)
        .await
        .context("Failed to set up solver session")?;

    let solver = session
        .solver(&args.channel, &args.platform, kind, Deadline::none(), verbosity)
        .await
        .with_context(|| format!("Failed to load repodata for {}", args.platform))?;
    tracing::info!("solving on {} with {}", args.platform, solver.backend_name());

    let request = SolveRequest::new(&args.specs)
        .constraints(&args.constraint)
        .with_run_exports();
    let outcome = solver.solve(&request).await.context("Solve failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print!("{}", render_outcome(&outcome));
    }
    Ok(outcome.solvable)
}

fn render_outcome(outcome: &SolveOutcome) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    if !outcome.solvable {
        let _ = writeln!(out, "{}", outcome.error.as_deref().unwrap_or("not solvable"));
        return out;
    }

    for package in outcome.solution.iter().flatten() {
        let _ = writeln!(
            out,
            "  {:<30} {:<15} {:<25} {}",
            package.name, package.version, package.build, package.channel
        );
    }

    if let Some(run_exports) = outcome.run_exports.as_ref().filter(|r| !r.is_empty()) {
        let _ = writeln!(out, "\nrun exports:");
        for kind in RunExportKind::ALL {
            let specs = run_exports.bucket(kind);
            if !specs.is_empty() {
                let specs: Vec<&str> = specs.iter().map(String::as_str).collect();
                let _ = writeln!(out, "  {kind}: {}", specs.join(", "));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use solvable_schema::RunExports;

    #[test]
    fn test_render_failure() {
        let outcome = SolveOutcome {
            solvable: false,
            error: Some("nothing provides python >=4".to_string()),
            ..SolveOutcome::default()
        };
        assert_eq!(render_outcome(&outcome), "nothing provides python >=4\n");
    }

    #[test]
    fn test_render_run_exports() {
        let mut run_exports = RunExports::default();
        run_exports.weak.insert("libzlib >=1.3".to_string());
        let outcome = SolveOutcome {
            solvable: true,
            solution: Some(Vec::new()),
            run_exports: Some(run_exports),
            error: None,
        };
        assert_eq!(render_outcome(&outcome), "\nrun exports:\n  weak: libzlib >=1.3\n");
    }
}

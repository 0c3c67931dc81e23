//! Check command

use anyhow::{Context, Result, bail};
use solvable_core::{
    CheckOptions, FeedstockVerdict, Session, SolvableConfig, Verbosity, is_recipe_solvable,
};

use crate::CheckArgs;

/// Check a feedstock and print the verdict. Returns whether it is solvable.
pub async fn check(mut config: SolvableConfig, args: &CheckArgs, verbosity: Verbosity) -> Result<bool> {
    if !args.feedstock.is_dir() {
        bail!("Feedstock directory not found: {}", args.feedstock.display());
    }

    if let Some(secs) = args.timeout {
        config.timeout_secs = (secs > 0).then_some(secs);
    }
    if let Some(solver) = args.solver {
        config.solver = solver;
    }

    let options = CheckOptions {
        additional_channels: args.additional_channels.clone(),
        build_platform: args.build_platform.iter().cloned().collect(),
        verbosity,
        ..CheckOptions::from_config(&config)
    };
    let session = Session::new(config)
        .await
        .context("Failed to set up solver session")?;

    let verdict = is_recipe_solvable(&args.feedstock, &options, &session).await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print!("{}", render_verdict(&args.feedstock.display().to_string(), &verdict));
    }
    Ok(verdict.solvable)
}

fn render_verdict(feedstock: &str, verdict: &FeedstockVerdict) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let status = if verdict.solvable { "solvable" } else { "NOT solvable" };
    let _ = writeln!(out, "{feedstock}: {status}");

    let width = verdict
        .solvable_by_variant
        .keys()
        .map(String::len)
        .max()
        .unwrap_or(0);
    for (variant, solvable) in &verdict.solvable_by_variant {
        let mark = if *solvable { "ok" } else { "FAIL" };
        let _ = writeln!(out, "  {variant:<width$}  {mark}");
    }

    if !verdict.errors.is_empty() {
        let _ = writeln!(out, "\nerrors:");
        for error in &verdict.errors {
            let mut lines = error.lines();
            if let Some(first) = lines.next() {
                let _ = writeln!(out, "  - {first}");
            }
            for line in lines {
                let _ = writeln!(out, "    {line}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_render_verdict() {
        let verdict = FeedstockVerdict {
            solvable: false,
            errors: vec!["osx_64_: host: nothing provides python\n  needed by foo".to_string()],
            solvable_by_variant: BTreeMap::from([
                ("linux_64_".to_string(), true),
                ("osx_64_".to_string(), false),
            ]),
        };
        assert_eq!(
            render_verdict("foo-feedstock", &verdict),
            "foo-feedstock: NOT solvable\n  linux_64_  ok\n  osx_64_    FAIL\n\nerrors:\n  - osx_64_: host: nothing provides python\n      needed by foo\n"
        );
    }

    #[test]
    fn test_render_timed_out() {
        assert_eq!(
            render_verdict("foo-feedstock", &FeedstockVerdict::timed_out()),
            "foo-feedstock: solvable\n"
        );
    }
}

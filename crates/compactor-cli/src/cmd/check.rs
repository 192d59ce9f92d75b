use anyhow::{Result, bail};
use clap::Args;
use compactor_core::compactor::CheckReport;
use compactor_core::error::ErrorCode;

use super::{Globals, open, print_json};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Forget inconsistent activities so the next sweep rebuilds them.
    #[arg(long)]
    pub recover: bool,

    /// Emit the report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Exits non-zero when inconsistencies remain after the command.
pub fn run_check(args: &CheckArgs, globals: &Globals) -> Result<()> {
    let engine = open(globals)?;
    let report = engine.compactor.check(args.recover)?;

    if args.json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    let remaining = report
        .inconsistent()
        .into_iter()
        .filter(|id| !report.recovered.iter().any(|r| r == id))
        .count();
    if remaining > 0 {
        bail!(
            "{}: {remaining} inconsistent activities (rerun with --recover to rebuild them)",
            ErrorCode::ArtifactMissing
        );
    }
    if !report.errors.is_empty() {
        bail!(
            "{}: {} activities could not be checked",
            ErrorCode::StoreUnavailable,
            report.errors.len()
        );
    }
    Ok(())
}

fn print_report(report: &CheckReport) {
    for check in &report.checks {
        let sha = check.current_sha1.as_deref().unwrap_or("-");
        let status = if check.is_consistent() { "ok" } else { "INCONSISTENT" };
        println!("{:<28} {status:<13} {sha}", check.activity_id);
        if !check.artifacts_ok {
            println!("    missing state artifacts");
        }
        for path in &check.missing_outputs {
            println!("    missing output {path}");
        }
    }
    for id in &report.errors {
        println!("{id:<28} ERROR");
    }
    for id in &report.recovered {
        println!("recovered {id}");
    }
}

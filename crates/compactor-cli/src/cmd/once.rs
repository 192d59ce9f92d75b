use anyhow::{Context, Result};
use clap::Args;
use compactor_core::compactor::CompactError;
use compactor_core::{SweepOutcome, SweepReport};

use super::{Globals, open, print_json, print_kv};

#[derive(Args, Debug)]
pub struct OnceArgs {
    /// Emit the sweep report as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run_once(args: &OnceArgs, globals: &Globals) -> Result<()> {
    let engine = open(globals)?;
    let report = match engine.compactor.compact() {
        SweepOutcome::Completed(report) => report,
        SweepOutcome::AlreadyRunning => return Err(CompactError::InProgress.into()),
        SweepOutcome::Failed(err) => {
            let code = err.code();
            return Err(err).with_context(|| format!("{code}: compaction sweep failed"));
        }
    };

    if args.json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

fn print_report(report: &SweepReport) {
    print_kv("activities", report.activities);
    print_kv("created", report.created);
    print_kv("compacted", report.compacted);
    print_kv("postponed", report.postponed);
    print_kv("unchanged", report.unchanged);
    print_kv("redistributed", report.redistributed);
    print_kv("failed", report.failed);
    print_kv("removed", report.removed);
    print_kv("recovered", report.recovered);
    if report.interrupted {
        println!("sweep interrupted before all activities were processed");
    }
}

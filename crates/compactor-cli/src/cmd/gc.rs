use anyhow::Result;
use clap::Args;

use super::{Globals, open, print_json, print_kv};

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Collect even if the GC interval has not passed.
    #[arg(long)]
    pub force: bool,

    /// Emit the GC report as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run_gc(args: &GcArgs, globals: &Globals) -> Result<()> {
    let engine = open(globals)?;
    let report = engine.compactor.gc(args.force)?;

    if args.json {
        return print_json(&report);
    }
    if !report.ran {
        println!("garbage collection not due (use --force to run it now)");
        return Ok(());
    }
    print_kv("collected", report.collected);
    print_kv("unsynced", report.unsynced);
    print_kv("failed", report.failed);
    Ok(())
}

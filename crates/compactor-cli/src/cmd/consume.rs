use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use compactor_core::feed::JsonLinesFeed;

use super::{Globals, open, print_json, print_kv};

#[derive(Args, Debug)]
pub struct ConsumeArgs {
    /// JSON-lines file of notification records. Reads stdin when omitted.
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Emit the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run_consume(args: &ConsumeArgs, globals: &Globals) -> Result<()> {
    let engine = open(globals)?;
    let report = match &args.input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            engine
                .compactor
                .consume(JsonLinesFeed::new(BufReader::new(file)))?
        }
        None => engine.compactor.consume(JsonLinesFeed::new(io::stdin().lock()))?,
    };

    if args.json {
        return print_json(&report);
    }
    print_kv("records", report.records);
    print_kv("merged", report.merged);
    print_kv("duplicates", report.duplicates);
    print_kv("malformed", report.malformed);
    print_kv("failed", report.failed);
    Ok(())
}

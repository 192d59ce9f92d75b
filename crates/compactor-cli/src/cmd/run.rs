use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use compactor_core::clock::{format_duration, millis};
use compactor_core::{ShutdownHandle, StatusHandle, SweepOutcome};
use tracing::{info, warn};

use super::{Globals, open};

/// How often the stop file is looked for, and the longest uninterrupted
/// sleep between sweeps.
const STOP_POLL: Duration = Duration::from_millis(200);

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Stop after this many sweeps instead of running until killed.
    #[arg(long, value_name = "N")]
    pub sweeps: Option<u64>,

    /// Stop gracefully once this file exists. A running sweep finishes the
    /// activity in hand, saves its snapshot, and the process exits.
    #[arg(long, value_name = "PATH")]
    pub stop_file: Option<PathBuf>,
}

/// Sweep, sleep for the refresh interval, repeat.
pub fn run_loop(args: &RunArgs, globals: &Globals) -> Result<()> {
    let engine = open(globals)?;
    let interval_ms = engine.compactor.config().refresh_interval_ms;
    let shutdown = engine.compactor.shutdown_handle();
    info!(
        interval = %format_duration(millis(interval_ms)),
        "compactor started"
    );

    if let Some(path) = args.stop_file.as_deref().filter(|p| p.exists()) {
        info!(path = %path.display(), "stop file already present, not sweeping");
        shutdown.request();
    }
    let watcher = args.stop_file.clone().map(|path| {
        watch_stop_file(path, shutdown.clone(), engine.compactor.status())
    });

    let mut done = 0_u64;
    while !shutdown.is_requested() {
        match engine.compactor.compact() {
            SweepOutcome::Completed(report) => {
                info!(
                    compacted = report.compacted,
                    redistributed = report.redistributed,
                    failed = report.failed,
                    interrupted = report.interrupted,
                    "sweep complete"
                );
            }
            SweepOutcome::AlreadyRunning => {}
            SweepOutcome::Failed(err) => {
                warn!(error = %err, code = err.code().code(), "sweep failed, retrying next interval");
            }
        }

        done += 1;
        if args.sweeps.is_some_and(|limit| done >= limit) {
            info!(sweeps = done, "sweep limit reached, stopping");
            break;
        }
        pause(Duration::from_millis(interval_ms), &shutdown);
    }

    shutdown.request();
    if let Some(watcher) = watcher
        && watcher.join().is_err()
    {
        warn!("stop file watcher panicked");
    }
    info!(sweeps = done, "compactor stopped");
    Ok(())
}

/// Sleep for `total`, waking early when shutdown is requested.
fn pause(total: Duration, shutdown: &ShutdownHandle) {
    let mut left = total;
    while !left.is_zero() && !shutdown.is_requested() {
        let step = left.min(STOP_POLL);
        thread::sleep(step);
        left -= step;
    }
}

fn watch_stop_file(
    path: PathBuf,
    shutdown: ShutdownHandle,
    status: StatusHandle,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.is_requested() {
            if path.exists() {
                info!(
                    path = %path.display(),
                    processing = status.is_processing(),
                    current = ?status.current(),
                    total = ?status.total(),
                    "stop file found, shutting down"
                );
                shutdown.request();
                return;
            }
            thread::sleep(STOP_POLL);
        }
    })
}

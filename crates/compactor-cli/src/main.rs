#![forbid(unsafe_code)]

mod cmd;
mod directory;

use clap::{CommandFactory, Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "trace-compactor: incremental compaction of trace fragments",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (TOML). Defaults to the user config dir.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read activities from a JSON file instead of the activity service.
    #[arg(long, global = true, value_name = "FILE")]
    activities: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn globals(&self) -> cmd::Globals {
        cmd::Globals {
            config: self.config.clone(),
            activities: self.activities.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Compaction",
        about = "Run periodic compaction sweeps",
        long_about = "Sweep every refresh interval until stopped. A sweep that fails is logged and retried on the next tick.",
        after_help = "EXAMPLES:\n    # Run forever with the default config\n    trace-compactor run\n\n    # Run three sweeps against an offline activity list\n    trace-compactor --activities activities.json run --sweeps 3\n\n    # Stop gracefully when /run/compactor.stop is created\n    trace-compactor run --stop-file /run/compactor.stop"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        next_help_heading = "Compaction",
        about = "Run a single compaction sweep",
        after_help = "EXAMPLES:\n    # One sweep, human-readable report\n    trace-compactor once\n\n    # Emit machine-readable output\n    trace-compactor once --json"
    )]
    Once(cmd::once::OnceArgs),

    #[command(
        next_help_heading = "Compaction",
        about = "Merge fragments announced by bucket notifications",
        long_about = "Read JSON-lines bucket notification records and merge each announced fragment as it arrives.",
        after_help = "EXAMPLES:\n    # Consume records from stdin\n    kcat -C -t traces-events | trace-compactor consume\n\n    # Replay a captured feed\n    trace-compactor consume --input events.jsonl --json"
    )]
    Consume(cmd::consume::ConsumeArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Check artifacts and outputs of known activities",
        after_help = "EXAMPLES:\n    # Report inconsistent activities\n    trace-compactor check\n\n    # Forget them so the next sweep rebuilds them\n    trace-compactor check --recover"
    )]
    Check(cmd::check::CheckArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Reclaim superseded artifacts",
        after_help = "EXAMPLES:\n    # Collect if the GC interval has passed\n    trace-compactor gc\n\n    # Collect now\n    trace-compactor gc --force"
    )]
    Gc(cmd::gc::GcArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Print the effective configuration"
    )]
    Config,

    #[command(
        next_help_heading = "Maintenance",
        about = "Generate shell completion scripts",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    trace-compactor completions bash\n\n    # Install zsh completions\n    trace-compactor completions zsh -o ~/.zfunc/_trace-compactor"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("COMPACTOR_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "trace_compactor=debug,compactor_core=debug,info"
        } else {
            "trace_compactor=info,compactor_core=info,warn"
        })
    });

    let format = env::var("COMPACTOR_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!(command = ?cli.command, "starting");

    let globals = cli.globals();
    match cli.command {
        Commands::Run(args) => cmd::run::run_loop(&args, &globals),
        Commands::Once(args) => cmd::once::run_once(&args, &globals),
        Commands::Consume(args) => cmd::consume::run_consume(&args, &globals),
        Commands::Check(args) => cmd::check::run_check(&args, &globals),
        Commands::Gc(args) => cmd::gc::run_gc(&args, &globals),
        Commands::Config => cmd::config::run_config(&globals),
        Commands::Completions(args) => {
            let mut command = Cli::command();
            cmd::completions::run_completions(&args, &mut command)
        }
    }
}

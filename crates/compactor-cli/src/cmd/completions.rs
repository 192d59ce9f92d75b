use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Command};
use clap_complete::{Shell, generate};

const BIN_NAME: &str = "trace-compactor";

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate for.
    #[arg(value_enum)]
    pub shell: Shell,

    /// Write the script to this file instead of stdout.
    #[arg(long, short, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

pub fn run_completions(args: &CompletionsArgs, command: &mut Command) -> Result<()> {
    match &args.output {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("creating completion script {}", path.display()))?;
            write_script(args.shell, command, &mut file)?;
            tracing::info!(shell = %args.shell, path = %path.display(), "completion script written");
            Ok(())
        }
        None => write_script(args.shell, command, &mut io::stdout().lock()),
    }
}

fn write_script(shell: Shell, command: &mut Command, out: &mut impl Write) -> Result<()> {
    generate(shell, command, BIN_NAME, out);
    out.flush().context("flushing completion script")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Arg;

    fn command() -> Command {
        Command::new(BIN_NAME)
            .subcommand(Command::new("once").arg(Arg::new("json").long("json")))
            .subcommand(Command::new("gc"))
    }

    #[test]
    fn script_names_binary_and_subcommands() {
        let mut buf = Vec::new();
        write_script(Shell::Bash, &mut command(), &mut buf).expect("generate");
        let script = String::from_utf8(buf).expect("utf8");
        assert!(script.contains(BIN_NAME));
        assert!(script.contains("once"));
        assert!(script.contains("--json"));
    }

    #[test]
    fn output_flag_writes_a_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("trace-compactor.fish");
        let args = CompletionsArgs {
            shell: Shell::Fish,
            output: Some(path.clone()),
        };
        run_completions(&args, &mut command()).expect("write");
        let script = std::fs::read_to_string(path).expect("read");
        assert!(script.contains("gc"));
    }
}

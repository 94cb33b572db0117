//! The `buzz` command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use buzz::{check_source, run_source, RunConfig};

/// The Buzz language interpreter.
#[derive(Parser)]
#[command(name = "buzz", disable_version_flag = true)]
struct Cli {
    /// Run every `test "..."` block instead of `main`.
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Check the script (lex, parse, type-check, compile) without running it.
    #[arg(short = 'c', long = "check")]
    check: bool,

    /// Add a library search directory (repeatable).
    #[arg(short = 'L', value_name = "PATH")]
    library: Vec<PathBuf>,

    /// Print the version.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// The script to run.
    script: Option<PathBuf>,

    /// Arguments passed to the script (read with `args()`).
    args: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.version {
        println!("buzz {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let script = cli.script.context("no script given (see --help)")?;
    let source = std::fs::read_to_string(&script)
        .with_context(|| format!("cannot read {}", script.display()))?;
    let path = script.display().to_string();

    let config = RunConfig {
        test: cli.test,
        search_paths: cli.library,
        args: cli.args,
        cycle_limit: None,
    };

    if cli.check {
        check_source(&source, &path, &config)?;
    } else {
        run_source(&source, &path, &config)?;
    }
    Ok(())
}

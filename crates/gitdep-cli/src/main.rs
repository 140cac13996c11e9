use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use gitdep_upgrade::UpgradeError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod command_flows;
mod completion;
mod dispatch;
mod render;

use dispatch::run_cli;

const LOG_ENV: &str = "GITDEP_LOG";

#[derive(Parser, Debug)]
#[command(name = "gitdep")]
#[command(about = "Git-native dependency manager with transactional upgrades", long_about = None)]
struct Cli {
    /// Project root holding gitdep.toml and dependency.lock.
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade a dependency, running its declared migration and verify commands.
    Upgrade {
        dependency: String,
        #[arg(long = "to")]
        to_ref: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        skip_migration: bool,
        #[arg(long)]
        skip_verify: bool,
        /// Show the plan without changing anything.
        #[arg(long)]
        dry_run: bool,
        /// Per-command timeout, in seconds or with an s/m/h suffix.
        #[arg(long, value_parser = parse_timeout_arg)]
        timeout: Option<Duration>,
    },
    /// Record a ref in the lock file without running any command.
    Apply {
        dependency: String,
        #[arg(long = "to")]
        to_ref: String,
        #[arg(long)]
        source: Option<String>,
    },
    /// List running commands started by gitdep.
    Ps {
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Run a declared command of a locked dependency, as `<dependency>:<command>`.
    Run {
        command: String,
        #[arg(long, value_parser = parse_timeout_arg)]
        timeout: Option<Duration>,
    },
    /// Show locked dependencies and pending upgrade claims.
    Status,
    /// Terminate a registered process and its children.
    Kill { pid: u32 },
    /// Clear the claim of an interrupted or failed upgrade.
    Repair { dependency: String },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
    Elvish,
}

impl From<CliCompletionShell> for Shell {
    fn from(value: CliCompletionShell) -> Self {
        match value {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
            CliCompletionShell::Elvish => Shell::Elvish,
        }
    }
}

fn parse_timeout_arg(raw: &str) -> Result<Duration, String> {
    gitdep_exec::parse_timeout(raw).map_err(|err| format!("{err:#}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run_cli(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for_error(&err))
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("gitdep=debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("gitdep=warn"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .with(filter)
        .init();
}

fn exit_code_for_error(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<UpgradeError>()
        .map(UpgradeError::exit_code)
        .map_or(1, exit_code_byte)
}

/// Clamps a process exit status into the range `ExitCode` accepts.
fn exit_code_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

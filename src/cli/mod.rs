//! CLI module; subcommands live here.

use clap::{CommandFactory, Parser, Subcommand};

use crate::logging::LogFormat;
use crate::Result;

pub mod mount;
pub mod unmount;

#[derive(Debug, Clone)]
pub enum Command {
    Mount(mount::MountArgs),
    Unmount(unmount::UnmountArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
    pub log_format: LogFormat,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
            log_format: LogFormat::Human,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Mount(m) => mount::execute(m),
        Command::Unmount(u) => unmount::execute(u),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "lagfs", version, about = "passthrough FUSE mount with artificial latency")]
struct Cli {
    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Human, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Mount a passthrough view of a root directory, optionally injecting a
    /// uniform per-call latency. Stays in the foreground until interrupted.
    Mount(mount::MountArgs),
    /// Unmount a previously mounted lagfs target.
    Unmount(unmount::UnmountArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::Mount(args)) => Command::Mount(args),
        Some(Subcommands::Unmount(args)) => Command::Unmount(args),
        None => Command::None,
    };

    Ok(CliArgs {
        command,
        log_format: cli.log_format,
    })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}

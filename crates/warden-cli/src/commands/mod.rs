//! CLI command definitions and dispatch.

pub mod find_child;
pub mod run;
pub mod whoami;

use clap::{Parser, Subcommand};
use warden_common::constants::BIN_NAME;

/// Warden — launches a command in a user namespace as the invoking user.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Log every launch step at debug level.
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in a new user namespace, dropped to the invoking user.
    Run(run::RunArgs),
    /// Print the direct child of a process.
    FindChild(find_child::FindChildArgs),
    /// Print the identity a launch would drop to.
    Whoami(whoami::WhoamiArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => run::execute(args),
        Command::FindChild(args) => find_child::execute(args),
        Command::Whoami(args) => whoami::execute(args),
    }
}

//! # warden — sandbox launcher
//!
//! Starts a command inside a new user namespace, maps the invoking user
//! into it, and drops to that user before the command runs.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;
mod deadline;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Every fatal condition, in the launcher or in a forked child, ends here.
    if let Err(e) = commands::execute(cli) {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(1);
    }
}

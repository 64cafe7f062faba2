//! `warden whoami` — Print the identity a launch would drop to.

use clap::Args;
use warden_core::identity::invoking_identity;

/// Arguments for the `whoami` command.
#[derive(Args, Debug)]
pub struct WhoamiArgs {
    /// Print compact JSON on one line.
    #[arg(long)]
    pub compact: bool,
}

/// Executes the `whoami` command.
///
/// # Errors
///
/// Returns an error if the invoking user cannot be resolved.
pub fn execute(args: WhoamiArgs) -> anyhow::Result<()> {
    let identity = invoking_identity()?;
    let rendered = if args.compact {
        serde_json::to_string(&identity)?
    } else {
        serde_json::to_string_pretty(&identity)?
    };
    #[allow(clippy::print_stdout)]
    {
        println!("{rendered}");
    }
    Ok(())
}

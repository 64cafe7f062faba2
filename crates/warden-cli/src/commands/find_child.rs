//! `warden find-child` — Print the direct child of a process.

use std::path::PathBuf;

use clap::Args;
use nix::unistd::Pid;
use warden_common::constants::DEFAULT_PROC_ROOT;
use warden_core::proctable::ProcTable;

/// Arguments for the `find-child` command.
#[derive(Args, Debug)]
pub struct FindChildArgs {
    /// PID of the parent process.
    pub pid: i32,

    /// Mount point of the process table.
    #[arg(long, default_value = DEFAULT_PROC_ROOT)]
    pub proc_root: PathBuf,
}

/// Executes the `find-child` command.
///
/// # Errors
///
/// Returns an error if the table is unavailable or the process has no child.
pub fn execute(args: FindChildArgs) -> anyhow::Result<()> {
    let child = ProcTable::new(&args.proc_root).find_direct_child(Pid::from_raw(args.pid))?;
    #[allow(clippy::print_stdout)]
    {
        println!("{child}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn execute_finds_child_in_synthetic_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proc_dir = dir.path().join("51");
        fs::create_dir_all(&proc_dir).expect("mkdir");
        fs::write(proc_dir.join("status"), "Name:\tsh\nPPid:\t50\n").expect("write");

        let args = FindChildArgs {
            pid: 50,
            proc_root: dir.path().to_path_buf(),
        };
        execute(args).expect("child found");
    }

    #[test]
    fn execute_fails_without_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = FindChildArgs {
            pid: 50,
            proc_root: dir.path().to_path_buf(),
        };
        let err = execute(args).expect_err("no child");
        assert!(err.to_string().contains("no child process found for parent 50"));
    }
}

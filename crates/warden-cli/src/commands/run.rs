//! `warden run` — Run a command in a new user namespace as the invoking user.
//!
//! The launcher forks a child that unshares a user namespace and announces
//! itself over a handshake channel. The launcher then writes the child's
//! `uid_map` and `gid_map`, releases it over a second channel, and waits.
//! The released child drops to the invoking user and execs the command.
//!
//! `warden` is installed setuid root, so settings that steer privileged
//! file writes (`--config`, `--proc-root`, ID maps naming other host IDs)
//! are only honoured when the real uid is 0.

use std::ffi::CString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use nix::sched::{CloneFlags, unshare};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execvp, fork, geteuid};
use warden_common::config::LaunchConfig;
use warden_common::error::WardenError;
use warden_common::types::{IdMapEntry, Identity, parse_id_map};
use warden_core::handshake::{self, AwaitReady, ReadyReceiver, ReadySender};
use warden_core::identity::invoking_identity;
use warden_core::idmap::{
    MapKind, NamespaceMapping, deny_setgroups, ensure_identity_preserved, validate_entries,
    write_mapping,
};
use warden_core::privdrop::{PrivilegeDropper, SystemCredentials};
use warden_core::proctable::ProcTable;

use crate::deadline::Deadline;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON launch configuration. Flags override its values. Root only.
    #[arg(short, long, env = "WARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// UID map records, e.g. "0 0 1,1 100000 65536". Must map the invoking
    /// uid onto itself; other host IDs are root only.
    #[arg(long, value_name = "MAP")]
    pub uid_map: Option<String>,

    /// GID map records, e.g. "0 0 1". Must map the invoking gid onto itself.
    #[arg(long, value_name = "MAP")]
    pub gid_map: Option<String>,

    /// Drop supplementary groups instead of keeping the user's own.
    #[arg(long)]
    pub no_groups: bool,

    /// Give up if the child does not signal readiness within SECS seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Write "deny" to the child's setgroups file before its gid map.
    #[arg(long)]
    pub deny_setgroups: bool,

    /// Run the command under an intermediary process and map its child.
    #[arg(long)]
    pub intermediary: bool,

    /// Mount point of the process table. Root only.
    #[arg(long)]
    pub proc_root: Option<PathBuf>,

    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `run` command.
///
/// Exits the process with the command's exit status (128 + signal number
/// if it was killed) once it terminates.
///
/// # Errors
///
/// Returns an error if the launcher is not privileged, the configuration
/// is invalid, or any launch step fails. Errors raised after the fork in
/// the child are returned from the child and end it.
pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    if !geteuid().is_root() {
        return Err(WardenError::Unprivileged {
            operation: "launching",
        }
        .into());
    }

    let identity = invoking_identity().context("cannot resolve invoking user")?;
    let config = resolve_config(&args, &identity)?;
    let argv = command_argv(&args.command)?;

    let (ready_tx, ready_rx) = handshake::channel()?;
    let (release_tx, release_rx) = handshake::channel()?;

    // SAFETY: the launcher is single-threaded here; the child execs or exits.
    match unsafe { fork() }.context("cannot fork sandbox child")? {
        ForkResult::Child => {
            drop(ready_rx);
            drop(release_tx);
            if args.intermediary {
                run_intermediary(&config, &identity, ready_tx, release_rx, &argv)
            } else {
                run_child(&config, &identity, ready_tx, release_rx, &argv)
            }
        }
        ForkResult::Parent { child } => {
            drop(ready_tx);
            drop(release_rx);
            tracing::debug!(child = child.as_raw(), intermediary = args.intermediary, "forked sandbox child");
            supervise(&config, &identity, child, args.intermediary, ready_rx, release_tx)
                .inspect_err(|_| abandon(child))?;
            let code = wait_for_exit(child)?;
            tracing::debug!(child = child.as_raw(), code, "sandbox child exited");
            std::process::exit(code);
        }
    }
}

/// Merges the configuration file (if any) with command-line overrides.
///
/// Settings that redirect privileged writes are refused unless `invoker`
/// is root, and the resulting maps must keep the invoker's IDs unchanged.
fn resolve_config(args: &RunArgs, invoker: &Identity) -> anyhow::Result<LaunchConfig> {
    let privileged = invoker.uid == 0;
    if !privileged && args.config.is_some() {
        return Err(WardenError::Restricted { setting: "--config" }.into());
    }
    if !privileged && args.proc_root.is_some() {
        return Err(WardenError::Restricted {
            setting: "--proc-root",
        }
        .into());
    }

    let mut config = match &args.config {
        Some(path) => LaunchConfig::load(path).context("cannot load launch configuration")?,
        None => LaunchConfig::default(),
    };

    if let Some(map) = &args.uid_map {
        config.uid_map = parse_id_map(map).context("invalid --uid-map")?;
    }
    if let Some(map) = &args.gid_map {
        config.gid_map = parse_id_map(map).context("invalid --gid-map")?;
    }
    if args.no_groups {
        config.allow_supplementary_groups = false;
    }
    if args.timeout.is_some() {
        config.handshake_timeout_secs = args.timeout;
    }
    if args.deny_setgroups {
        config.deny_setgroups = true;
    }
    if let Some(root) = &args.proc_root {
        config.proc_root.clone_from(root);
    }

    if !config.uid_map.is_empty() {
        validate_entries(&config.uid_map).context("invalid uid map")?;
    }
    if !config.gid_map.is_empty() {
        validate_entries(&config.gid_map).context("invalid gid map")?;
    }
    let uid_map = config.uid_map_or_identity(invoker.uid);
    let gid_map = config.gid_map_or_identity(invoker.gid);
    ensure_identity_preserved(&uid_map, MapKind::Uid, invoker.uid)?;
    ensure_identity_preserved(&gid_map, MapKind::Gid, invoker.gid)?;
    if !privileged && !only_maps_itself(&uid_map, invoker.uid) {
        return Err(WardenError::Restricted { setting: "--uid-map" }.into());
    }
    if !privileged && !only_maps_itself(&gid_map, invoker.gid) {
        return Err(WardenError::Restricted { setting: "--gid-map" }.into());
    }
    Ok(config)
}

/// Whether the map reaches no host ID other than `id`.
fn only_maps_itself(entries: &[IdMapEntry], id: u32) -> bool {
    entries
        .iter()
        .all(|entry| entry.outside == id && entry.count == 1)
}

fn command_argv(command: &[String]) -> anyhow::Result<Vec<CString>> {
    command
        .iter()
        .map(|arg| CString::new(arg.as_str()).with_context(|| format!("argument {arg:?} contains a NUL byte")))
        .collect()
}

/// Launcher side: map the announced process and release it.
fn supervise(
    config: &LaunchConfig,
    identity: &Identity,
    child: Pid,
    intermediary: bool,
    ready: ReadyReceiver,
    release: ReadySender,
) -> anyhow::Result<()> {
    let announced = match config.handshake_timeout_secs {
        Some(secs) => Deadline::new(ready, Duration::from_secs(secs)).await_ready(),
        None => ready.await_ready(),
    }
    .context("sandbox child did not signal readiness")?;

    let target = if intermediary {
        ProcTable::new(&config.proc_root)
            .find_direct_child(child)
            .context("cannot locate sandboxed process")?
    } else {
        child
    };
    ensure_announced(announced, target)?;

    if config.deny_setgroups {
        deny_setgroups(&config.proc_root, target).context("cannot deny setgroups")?;
    }
    let uid_map = NamespaceMapping::for_process(
        &config.proc_root,
        target,
        MapKind::Uid,
        config.uid_map_or_identity(identity.uid),
    )
    .context("cannot open uid map")?;
    write_mapping(uid_map).context("cannot write uid map")?;
    let gid_map = NamespaceMapping::for_process(
        &config.proc_root,
        target,
        MapKind::Gid,
        config.gid_map_or_identity(identity.gid),
    )
    .context("cannot open gid map")?;
    write_mapping(gid_map).context("cannot write gid map")?;

    release.signal_ready().context("cannot release sandbox child")?;
    Ok(())
}

fn ensure_announced(announced: Pid, target: Pid) -> anyhow::Result<()> {
    if announced != target {
        anyhow::bail!("readiness token names process {announced}, expected {target}");
    }
    Ok(())
}

/// Sandboxed side: settle groups, enter the namespace, wait for maps,
/// drop, exec.
fn run_child(
    config: &LaunchConfig,
    identity: &Identity,
    ready: ReadySender,
    release: ReadyReceiver,
    argv: &[CString],
) -> anyhow::Result<()> {
    // Groups are settled while still root outside the namespace, where a
    // denied setgroups file cannot reach.
    let settled = PrivilegeDropper::new(SystemCredentials)
        .settle_groups(identity, config.allow_supplementary_groups)
        .context("cannot set supplementary groups")?;
    unshare(CloneFlags::CLONE_NEWUSER).context("cannot create user namespace")?;
    ready.signal_ready().context("cannot signal readiness")?;
    let launcher = release.await_ready().context("launcher did not release the sandbox")?;
    tracing::debug!(launcher = launcher.as_raw(), "released by launcher");

    settled.switch_identity(identity).context("cannot drop privileges")?;

    let program = argv.first().context("empty command")?;
    match execvp(program, argv) {
        Ok(never) => match never {},
        Err(e) => Err(e).with_context(|| format!("cannot execute {}", program.to_string_lossy())),
    }
}

/// Intermediary side: fork the sandboxed process and relay its exit status.
fn run_intermediary(
    config: &LaunchConfig,
    identity: &Identity,
    ready: ReadySender,
    release: ReadyReceiver,
    argv: &[CString],
) -> anyhow::Result<()> {
    // SAFETY: single-threaded; the grandchild execs or exits.
    match unsafe { fork() }.context("cannot fork sandboxed process")? {
        ForkResult::Child => run_child(config, identity, ready, release, argv),
        ForkResult::Parent { child } => {
            drop(ready);
            drop(release);
            let code = wait_for_exit(child)?;
            std::process::exit(code);
        }
    }
}

/// Kills a child the launcher can no longer set up.
fn abandon(child: Pid) {
    if let Err(e) = kill(child, Signal::SIGKILL) {
        tracing::debug!(child = child.as_raw(), error = %e, "cannot kill abandoned child");
        return;
    }
    if let Err(e) = waitpid(child, None) {
        tracing::debug!(child = child.as_raw(), error = %e, "cannot reap abandoned child");
    }
}

fn wait_for_exit(child: Pid) -> anyhow::Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    return Ok(code);
                }
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(e).context("cannot wait for sandbox child"),
        }
    }
}

/// Shell-style exit code of a terminated process.
fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    fn parse(argv: &[&str]) -> RunArgs {
        match Cli::try_parse_from(argv).expect("valid arguments").command {
            Command::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn root() -> Identity {
        Identity::new(0, 0, "root")
    }

    fn nobody() -> Identity {
        Identity::new(65_534, 65_534, "nobody")
    }

    fn restricted_setting(err: &anyhow::Error) -> Option<&'static str> {
        match err.downcast_ref::<WardenError>() {
            Some(WardenError::Restricted { setting }) => Some(*setting),
            _ => None,
        }
    }

    #[test]
    fn run_collects_trailing_command() {
        let args = parse(&["warden", "run", "--no-groups", "--timeout", "5", "id", "-u"]);
        assert!(args.no_groups);
        assert_eq!(args.timeout, Some(5));
        assert_eq!(args.command, vec!["id", "-u"]);
    }

    #[test]
    fn run_requires_command() {
        assert!(Cli::try_parse_from(["warden", "run"]).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let args = parse(&[
            "warden",
            "run",
            "--uid-map",
            "0 0 1,1 100000 65536",
            "--deny-setgroups",
            "--proc-root",
            "/tmp/proc",
            "true",
        ]);
        let config = resolve_config(&args, &root()).expect("config");
        assert_eq!(
            config.uid_map,
            vec![IdMapEntry::new(0, 0, 1), IdMapEntry::new(1, 100_000, 65_536)]
        );
        assert!(config.gid_map.is_empty());
        assert!(config.deny_setgroups);
        assert!(config.allow_supplementary_groups);
        assert_eq!(config.proc_root, PathBuf::from("/tmp/proc"));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("launch.json");
        std::fs::write(
            &path,
            r#"{ "gid_map": [{ "inside": 0, "outside": 0, "count": 1 }, { "inside": 1, "outside": 100, "count": 10 }], "handshake_timeout_secs": 30 }"#,
        )
        .expect("write config");

        let path_arg = path.to_string_lossy().into_owned();
        let args = parse(&["warden", "run", "-c", path_arg.as_str(), "--timeout", "2", "--no-groups", "true"]);
        let config = resolve_config(&args, &root()).expect("config");
        assert_eq!(
            config.gid_map,
            vec![IdMapEntry::new(0, 0, 1), IdMapEntry::new(1, 100, 10)]
        );
        assert_eq!(config.handshake_timeout_secs, Some(2));
        assert!(!config.allow_supplementary_groups);
    }

    #[test]
    fn overlapping_map_is_rejected_before_launch() {
        let args = parse(&["warden", "run", "--uid-map", "0 1000 10,5 2000 1", "true"]);
        let err = resolve_config(&args, &root()).expect_err("overlap");
        assert!(err.to_string().contains("invalid uid map"));
    }

    #[test]
    fn malformed_map_is_rejected() {
        let args = parse(&["warden", "run", "--gid-map", "0 1000", "true"]);
        assert!(resolve_config(&args, &root()).is_err());
    }

    #[test]
    fn map_moving_the_invoking_uid_is_rejected() {
        let args = parse(&["warden", "run", "--uid-map", "0 1000 1", "true"]);
        let err = resolve_config(&args, &root()).expect_err("shifted uid");
        assert!(format!("{err:#}").contains("uid_map must map 0 onto itself"));
    }

    #[test]
    fn map_leaving_the_invoking_gid_unmapped_is_rejected() {
        let args = parse(&["warden", "run", "--gid-map", "1 100 10", "true"]);
        let err = resolve_config(&args, &root()).expect_err("unmapped gid");
        assert!(format!("{err:#}").contains("gid_map must map 0 onto itself"));
    }

    #[test]
    fn unprivileged_invoker_cannot_choose_proc_root() {
        let args = parse(&["warden", "run", "--proc-root", "/tmp/evil", "true"]);
        let err = resolve_config(&args, &nobody()).expect_err("restricted");
        assert_eq!(restricted_setting(&err), Some("--proc-root"));
    }

    #[test]
    fn unprivileged_invoker_cannot_load_config() {
        let args = parse(&["warden", "run", "--config", "/etc/shadow", "true"]);
        let err = resolve_config(&args, &nobody()).expect_err("restricted");
        assert_eq!(restricted_setting(&err), Some("--config"));
    }

    #[test]
    fn unprivileged_invoker_cannot_map_other_host_ids() {
        let args = parse(&["warden", "run", "--uid-map", "65534 65534 1,0 0 1", "true"]);
        let err = resolve_config(&args, &nobody()).expect_err("restricted");
        assert_eq!(restricted_setting(&err), Some("--uid-map"));
    }

    #[test]
    fn unprivileged_invoker_keeps_identity_maps() {
        let args = parse(&["warden", "run", "--uid-map", "65534 65534 1", "--deny-setgroups", "true"]);
        let config = resolve_config(&args, &nobody()).expect("config");
        assert_eq!(config.uid_map, vec![IdMapEntry::identity(65_534)]);
        assert!(config.deny_setgroups);
    }

    #[test]
    fn announced_pid_must_match_target() {
        assert!(ensure_announced(Pid::from_raw(40), Pid::from_raw(40)).is_ok());
        let err = ensure_announced(Pid::from_raw(40), Pid::from_raw(41)).expect_err("mismatch");
        assert_eq!(err.to_string(), "readiness token names process 40, expected 41");
    }

    #[test]
    fn nul_in_command_is_rejected() {
        assert!(command_argv(&["a\0b".to_owned()]).is_err());
        assert_eq!(command_argv(&["ls".to_owned()]).expect("argv").len(), 1);
    }

    #[test]
    fn exit_code_follows_shell_convention() {
        let pid = Pid::from_raw(10);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)), Some(137));
        assert_eq!(exit_code(WaitStatus::StillAlive), None);
    }
}

//! Process table lookups.
//!
//! Reads `/proc/<pid>/status` records to answer "which process is the
//! direct child of this one". Nothing is cached: the table is rebuilt on
//! every call because processes come and go concurrently.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::Pid;
use thiserror::Error;
use warden_common::constants::{DEFAULT_PROC_ROOT, PROC_TABLE_RETRY_DELAY};

/// Errors raised while scanning the process table.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The table could not be opened, even after one retry.
    #[error("cannot open process table {path}")]
    TableUnavailable {
        /// Root of the process table.
        path: PathBuf,
        /// Error from the second attempt.
        source: io::Error,
    },

    /// No live process has the requested parent.
    #[error("no child process found for parent {0}")]
    NotFound(Pid),
}

/// The parent relationship of one live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessRecord {
    /// Process ID.
    pub pid: Pid,
    /// Parent process ID from the `PPid:` status field.
    pub parent_pid: Pid,
}

/// A view of the process table rooted at a `proc` mount.
#[derive(Debug, Clone)]
pub struct ProcTable {
    root: PathBuf,
    retry_delay: Duration,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ProcTable {
    /// Creates a view of the table mounted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retry_delay: PROC_TABLE_RETRY_DELAY,
        }
    }

    /// Overrides the pause before the single retry of an unavailable table.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Root of the table.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the first process whose parent is `parent`.
    ///
    /// The parent's own entry is skipped. With several children the
    /// first one listed wins.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::TableUnavailable`] if the table cannot be
    /// opened after one retry, and [`LookupError::NotFound`] if no process
    /// currently has `parent` as its parent.
    pub fn find_direct_child(&self, parent: Pid) -> Result<Pid, LookupError> {
        let child = self
            .scan()?
            .filter(|record| record.pid != parent)
            .find(|record| record.parent_pid == parent)
            .map(|record| record.pid)
            .ok_or(LookupError::NotFound(parent))?;
        tracing::debug!(parent = parent.as_raw(), child = child.as_raw(), "found direct child");
        Ok(child)
    }

    /// Snapshots every readable process record.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::TableUnavailable`] if the table cannot be
    /// opened after one retry.
    pub fn records(&self) -> Result<Vec<ProcessRecord>, LookupError> {
        Ok(self.scan()?.collect())
    }

    fn scan(&self) -> Result<impl Iterator<Item = ProcessRecord> + '_, LookupError> {
        let entries = self.open_table()?;
        Ok(entries
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| parse_pid(&entry.file_name().to_string_lossy()))
            .filter_map(|pid| self.read_record(pid)))
    }

    fn open_table(&self) -> Result<fs::ReadDir, LookupError> {
        match fs::read_dir(&self.root) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(
                    path = %self.root.display(),
                    error = %e,
                    retry_in = ?self.retry_delay,
                    "process table unavailable, retrying once"
                );
                std::thread::sleep(self.retry_delay);
                fs::read_dir(&self.root).map_err(|source| LookupError::TableUnavailable {
                    path: self.root.clone(),
                    source,
                })
            }
        }
    }

    fn read_record(&self, pid: Pid) -> Option<ProcessRecord> {
        let path = self.root.join(pid.as_raw().to_string()).join("status");
        // Status files carry the raw `comm` bytes, which need not be UTF-8.
        let status = match fs::read(&path) {
            Ok(status) => status,
            Err(e) => {
                // The process may have exited between readdir and open.
                tracing::debug!(pid = pid.as_raw(), error = %e, "cannot read status file");
                return None;
            }
        };
        let Some(parent_pid) = parse_parent_pid(&status) else {
            tracing::error!(pid = pid.as_raw(), "cannot parse PPid from status file");
            return None;
        };
        Some(ProcessRecord { pid, parent_pid })
    }
}

/// Returns the direct child of `parent` from the system process table.
///
/// # Errors
///
/// See [`ProcTable::find_direct_child`].
pub fn find_direct_child(parent: Pid) -> Result<Pid, LookupError> {
    ProcTable::default().find_direct_child(parent)
}

fn parse_pid(name: &str) -> Option<Pid> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok().map(Pid::from_raw)
}

/// Extracts the `PPid:` value from the contents of a status file.
fn parse_parent_pid(status: &[u8]) -> Option<Pid> {
    status
        .split(|byte| *byte == b'\n')
        .find_map(|line| line.strip_prefix(b"PPid:"))
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.trim().parse().ok())
        .map(Pid::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_process(root: &Path, pid: i32, ppid: i32) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).expect("mkdir");
        let status = format!("Name:\tproc{pid}\nState:\tS (sleeping)\nTgid:\t{pid}\nPid:\t{pid}\nPPid:\t{ppid}\n");
        fs::write(dir.join("status"), status).expect("write status");
    }

    fn table(root: &Path) -> ProcTable {
        ProcTable::new(root).with_retry_delay(Duration::ZERO)
    }

    #[test]
    fn find_direct_child_returns_matching_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        add_process(dir.path(), 10, 1);
        add_process(dir.path(), 11, 5);
        add_process(dir.path(), 12, 7);

        let child = table(dir.path()).find_direct_child(Pid::from_raw(7)).expect("child");
        assert_eq!(child, Pid::from_raw(12));
    }

    #[test]
    fn find_direct_child_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        add_process(dir.path(), 10, 1);
        add_process(dir.path(), 11, 5);

        let result = table(dir.path()).find_direct_child(Pid::from_raw(7));
        assert!(matches!(result, Err(LookupError::NotFound(p)) if p == Pid::from_raw(7)));
    }

    #[test]
    fn find_direct_child_ignores_parent_listing_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        add_process(dir.path(), 7, 7);

        let result = table(dir.path()).find_direct_child(Pid::from_raw(7));
        assert!(matches!(result, Err(LookupError::NotFound(_))));
    }

    #[test]
    fn find_direct_child_skips_non_process_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("self")).expect("mkdir");
        fs::create_dir_all(dir.path().join("12abc")).expect("mkdir");
        fs::write(dir.path().join("uptime"), "1.0 1.0\n").expect("write");
        add_process(dir.path(), 40, 3);

        let child = table(dir.path()).find_direct_child(Pid::from_raw(3)).expect("child");
        assert_eq!(child, Pid::from_raw(40));
    }

    #[test]
    fn find_direct_child_skips_vanished_and_garbled_processes() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("20")).expect("mkdir");
        fs::create_dir_all(dir.path().join("21")).expect("mkdir");
        fs::write(dir.path().join("21").join("status"), "Name:\tx\nPPid:\t\n").expect("write");
        add_process(dir.path(), 22, 9);

        let child = table(dir.path()).find_direct_child(Pid::from_raw(9)).expect("child");
        assert_eq!(child, Pid::from_raw(22));
    }

    #[test]
    fn missing_table_is_unavailable_after_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = table(&dir.path().join("proc")).find_direct_child(Pid::from_raw(1));
        assert!(matches!(result, Err(LookupError::TableUnavailable { .. })));
    }

    #[test]
    fn records_lists_every_readable_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        add_process(dir.path(), 10, 1);
        add_process(dir.path(), 11, 10);

        let mut records = table(dir.path()).records().expect("records");
        records.sort_by_key(|record| record.pid.as_raw());
        assert_eq!(
            records,
            vec![
                ProcessRecord { pid: Pid::from_raw(10), parent_pid: Pid::from_raw(1) },
                ProcessRecord { pid: Pid::from_raw(11), parent_pid: Pid::from_raw(10) },
            ]
        );
    }

    #[test]
    fn parse_parent_pid_tolerates_spaces() {
        assert_eq!(parse_parent_pid(b"Name: a\nPPid:    42\n"), Some(Pid::from_raw(42)));
        assert_eq!(parse_parent_pid(b"Name: a\n"), None);
    }

    #[test]
    fn find_direct_child_reads_status_with_non_utf8_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proc_dir = dir.path().join("12");
        fs::create_dir_all(&proc_dir).expect("mkdir");
        fs::write(proc_dir.join("status"), b"Name:\tab\xff\xfe\nState:\tS (sleeping)\nPPid:\t7\n")
            .expect("write status");

        let child = table(dir.path()).find_direct_child(Pid::from_raw(7)).expect("child");
        assert_eq!(child, Pid::from_raw(12));
    }
}

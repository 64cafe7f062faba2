//! User namespace ID mapping.
//!
//! Writes `uid_map`/`gid_map` records for a child's user namespace. The
//! kernel accepts exactly one write per map file, so the whole map is
//! validated first and then emitted with a single `write(2)`.
//!
//! Files under a process directory are opened without following a final
//! symlink and must live on a proc filesystem, so a caller-chosen
//! `proc_root` cannot redirect a privileged write elsewhere.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::statfs::{PROC_SUPER_MAGIC, fstatfs};
use nix::unistd::Pid;
use thiserror::Error;
use warden_common::constants::{MAX_ID_MAP_BYTES, MAX_ID_MAP_ENTRIES};
use warden_common::types::IdMapEntry;

/// Errors raised while writing an ID map. All of them are fatal to a launch.
#[derive(Debug, Error)]
pub enum MapError {
    /// The map file could not be opened.
    #[error("cannot open {target}")]
    OpenFailed {
        /// Map file that failed to open.
        target: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The kernel refused access to the map file.
    #[error("permission denied on {target}")]
    PermissionDenied {
        /// Map file that refused access.
        target: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Fewer bytes than the full map were accepted.
    #[error("short write to {target}: {written} of {expected} bytes")]
    WriteIncomplete {
        /// Map file that took the short write.
        target: String,
        /// Bytes accepted by the kernel.
        written: usize,
        /// Length of the rendered map.
        expected: usize,
    },

    /// The write failed for a reason other than permissions.
    #[error("cannot write to {target}")]
    WriteFailed {
        /// Map file that failed.
        target: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A process file resolved to something other than procfs.
    #[error("{target} is not on a proc filesystem")]
    NotProcfs {
        /// File that was opened.
        target: String,
    },

    /// The entries violate the map file's constraints.
    #[error("invalid ID map: {0}")]
    InvalidMapping(String),

    /// The map does not send `id` to the same ID outside the namespace.
    #[error("{kind} must map {id} onto itself")]
    IdentityNotPreserved {
        /// Map that was checked.
        kind: MapKind,
        /// ID the workload will run as.
        id: u32,
    },
}

/// Which of a process's two ID maps to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    /// `/proc/<pid>/uid_map`.
    Uid,
    /// `/proc/<pid>/gid_map`.
    Gid,
}

impl MapKind {
    /// File name of the map under `/proc/<pid>`.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Uid => "uid_map",
            Self::Gid => "gid_map",
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// An open map file together with the records destined for it.
///
/// Consumed by [`write_mapping`]; the descriptor is closed once the write
/// has been attempted.
#[derive(Debug)]
pub struct NamespaceMapping {
    target: File,
    label: String,
    entries: Vec<IdMapEntry>,
}

impl NamespaceMapping {
    /// Wraps an already-open map file descriptor.
    #[must_use]
    pub fn new(target: File, entries: Vec<IdMapEntry>) -> Self {
        Self {
            target,
            label: "ID map descriptor".into(),
            entries,
        }
    }

    /// Opens the map file at `path` for reading and writing.
    ///
    /// The file is neither created nor truncated, and a symlink in the
    /// last path component is refused.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::PermissionDenied`] if access is refused and
    /// [`MapError::OpenFailed`] for any other open failure.
    pub fn open(path: impl AsRef<Path>, entries: Vec<IdMapEntry>) -> Result<Self, MapError> {
        let path = path.as_ref();
        let target = open_no_follow(path, true)?;
        Ok(Self {
            target,
            label: path.display().to_string(),
            entries,
        })
    }

    /// Opens the `kind` map of process `pid` under `proc_root`.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NotProcfs`] if the opened file is not on a proc
    /// filesystem, otherwise see [`NamespaceMapping::open`].
    pub fn for_process(
        proc_root: &Path,
        pid: Pid,
        kind: MapKind,
        entries: Vec<IdMapEntry>,
    ) -> Result<Self, MapError> {
        let path = process_file(proc_root, pid, kind.file_name());
        let mapping = Self::open(&path, entries)?;
        ensure_procfs(&mapping.target, &mapping.label)?;
        Ok(mapping)
    }

    /// Records that will be written.
    #[must_use]
    pub fn entries(&self) -> &[IdMapEntry] {
        &self.entries
    }
}

fn process_file(proc_root: &Path, pid: Pid, name: &str) -> PathBuf {
    proc_root.join(pid.as_raw().to_string()).join(name)
}

fn open_no_follow(path: &Path, read: bool) -> Result<File, MapError> {
    OpenOptions::new()
        .read(read)
        .write(true)
        .custom_flags(OFlag::O_NOFOLLOW.bits())
        .open(path)
        .map_err(|source| {
            let target = path.display().to_string();
            if source.kind() == io::ErrorKind::PermissionDenied {
                MapError::PermissionDenied { target, source }
            } else {
                MapError::OpenFailed { target, source }
            }
        })
}

fn ensure_procfs(file: &File, label: &str) -> Result<(), MapError> {
    let on_procfs = fstatfs(file)
        .map(|stat| stat.filesystem_type() == PROC_SUPER_MAGIC)
        .map_err(|e| MapError::OpenFailed {
            target: label.to_owned(),
            source: e.into(),
        })?;
    if on_procfs {
        Ok(())
    } else {
        Err(MapError::NotProcfs {
            target: label.to_owned(),
        })
    }
}

/// Checks the records against the constraints the kernel enforces.
///
/// # Errors
///
/// Returns [`MapError::InvalidMapping`] if the list is empty, has too
/// many records or renders to a page or more, a range is empty or
/// overflows, or two inside (or two outside) ranges overlap.
pub fn validate_entries(entries: &[IdMapEntry]) -> Result<(), MapError> {
    if entries.is_empty() {
        return Err(MapError::InvalidMapping("no entries".into()));
    }
    if entries.len() > MAX_ID_MAP_ENTRIES {
        return Err(MapError::InvalidMapping(format!(
            "{} entries exceed the limit of {MAX_ID_MAP_ENTRIES}",
            entries.len()
        )));
    }

    let mut inside = Vec::with_capacity(entries.len());
    let mut outside = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.count == 0 {
            return Err(MapError::InvalidMapping(format!("empty range in \"{entry}\"")));
        }
        let (Some(inside_end), Some(outside_end)) = (entry.inside_end(), entry.outside_end())
        else {
            return Err(MapError::InvalidMapping(format!("range overflows in \"{entry}\"")));
        };
        inside.push((entry.inside, inside_end));
        outside.push((entry.outside, outside_end));
    }

    let rendered = render_entries(entries).len();
    if rendered >= MAX_ID_MAP_BYTES {
        return Err(MapError::InvalidMapping(format!(
            "{rendered} bytes of records, the kernel takes fewer than {MAX_ID_MAP_BYTES}"
        )));
    }

    check_disjoint(&mut inside, "inside")?;
    check_disjoint(&mut outside, "outside")
}

/// Translates `inside` through the records, if any record covers it.
#[must_use]
pub fn outside_id(entries: &[IdMapEntry], inside: u32) -> Option<u32> {
    entries.iter().find_map(|entry| {
        let offset = inside.checked_sub(entry.inside)?;
        (offset < entry.count)
            .then(|| entry.outside.checked_add(offset))
            .flatten()
    })
}

/// Checks that the records map `id` onto the same ID outside.
///
/// The workload drops to its invoking IDs inside the namespace; any other
/// translation would run it as a different host user.
///
/// # Errors
///
/// Returns [`MapError::IdentityNotPreserved`] otherwise.
pub fn ensure_identity_preserved(entries: &[IdMapEntry], kind: MapKind, id: u32) -> Result<(), MapError> {
    if outside_id(entries, id) == Some(id) {
        Ok(())
    } else {
        Err(MapError::IdentityNotPreserved { kind, id })
    }
}

fn check_disjoint(ranges: &mut [(u32, u32)], side: &str) -> Result<(), MapError> {
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (start, end) = pair[0];
        let (next_start, next_end) = pair[1];
        if next_start < end {
            return Err(MapError::InvalidMapping(format!(
                "{side} ranges [{start}, {end}) and [{next_start}, {next_end}) overlap"
            )));
        }
    }
    Ok(())
}

/// Renders records in the kernel's `"<inside> <outside> <count>\n"` format.
#[must_use]
pub fn render_entries(entries: &[IdMapEntry]) -> String {
    entries.iter().map(|entry| format!("{entry}\n")).collect()
}

/// Validates and writes the mapping with a single write.
///
/// A short write is reported, never retried: the kernel parses the map
/// as one unit and a partial count means the protocol was violated.
///
/// # Errors
///
/// Returns [`MapError::InvalidMapping`] before touching the descriptor if
/// validation fails, otherwise the write error.
pub fn write_mapping(mapping: NamespaceMapping) -> Result<(), MapError> {
    let NamespaceMapping {
        mut target,
        label,
        entries,
    } = mapping;
    validate_entries(&entries)?;

    let text = render_entries(&entries);
    let written = target.write(text.as_bytes()).map_err(|source| {
        if source.kind() == io::ErrorKind::PermissionDenied {
            MapError::PermissionDenied {
                target: label.clone(),
                source,
            }
        } else {
            MapError::WriteFailed {
                target: label.clone(),
                source,
            }
        }
    })?;
    if written != text.len() {
        return Err(MapError::WriteIncomplete {
            target: label,
            written,
            expected: text.len(),
        });
    }

    tracing::debug!(map = %label, entries = entries.len(), "wrote ID map");
    Ok(())
}

/// Disables `setgroups(2)` in the user namespace of `pid`.
///
/// An unprivileged writer must do this before writing `gid_map`. Kernels
/// without the `setgroups` file are left alone. Once denied, no process
/// in the namespace can change its supplementary groups, so they have to
/// be settled before the namespace is entered.
///
/// # Errors
///
/// Returns [`MapError::NotProcfs`] if the file is not on a proc filesystem,
/// or another [`MapError`] if it exists but cannot be written.
pub fn deny_setgroups(proc_root: &Path, pid: Pid) -> Result<(), MapError> {
    let path = process_file(proc_root, pid, "setgroups");
    let label = path.display().to_string();
    let mut file = match open_no_follow(&path, false) {
        Ok(file) => file,
        Err(MapError::OpenFailed { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %label, "no setgroups file, skipping");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    ensure_procfs(&file, &label)?;
    file.write_all(b"deny").map_err(|source| {
        if source.kind() == io::ErrorKind::PermissionDenied {
            MapError::PermissionDenied { target: label, source }
        } else {
            MapError::WriteFailed { target: label, source }
        }
    })?;
    tracing::debug!(pid = pid.as_raw(), "setgroups denied");
    Ok(())
}

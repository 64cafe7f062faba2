//! Launch configuration model for the Warden launcher.
//!
//! The configuration arrives already parsed; the launcher core only reads
//! the values it is handed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::types::IdMapEntry;

/// Settings for one launch of a sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// Records written to the child's `uid_map`. Empty means "map the
    /// invoking uid onto itself".
    pub uid_map: Vec<IdMapEntry>,
    /// Records written to the child's `gid_map`. Empty means "map the
    /// invoking gid onto itself".
    pub gid_map: Vec<IdMapEntry>,
    /// Whether the dropped identity keeps its supplementary groups.
    pub allow_supplementary_groups: bool,
    /// Upper bound on the wait for the child's readiness token, in seconds.
    pub handshake_timeout_secs: Option<u64>,
    /// Write `deny` to the child's `setgroups` file before its `gid_map`.
    pub deny_setgroups: bool,
    /// Mount point of the process table.
    pub proc_root: PathBuf,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            uid_map: Vec::new(),
            gid_map: Vec::new(),
            allow_supplementary_groups: true,
            handshake_timeout_secs: None,
            deny_setgroups: false,
            proc_root: PathBuf::from(crate::constants::DEFAULT_PROC_ROOT),
        }
    }
}

impl LaunchConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// Fields missing from the file keep their default values.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::ConfigMissing`] if the file does not exist,
    /// [`WardenError::ConfigRead`] if it cannot be read, and
    /// [`WardenError::ConfigParse`] if it is not a valid configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                WardenError::ConfigMissing {
                    path: path.to_path_buf(),
                }
            } else {
                WardenError::ConfigRead {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&raw).map_err(|source| WardenError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns the uid map, defaulting to an identity mapping of `uid`.
    #[must_use]
    pub fn uid_map_or_identity(&self, uid: u32) -> Vec<IdMapEntry> {
        if self.uid_map.is_empty() {
            vec![IdMapEntry::identity(uid)]
        } else {
            self.uid_map.clone()
        }
    }

    /// Returns the gid map, defaulting to an identity mapping of `gid`.
    #[must_use]
    pub fn gid_map_or_identity(&self, gid: u32) -> Vec<IdMapEntry> {
        if self.gid_map.is_empty() {
            vec![IdMapEntry::identity(gid)]
        } else {
            self.gid_map.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_allows_groups_and_uses_proc() {
        let config = LaunchConfig::default();
        assert!(config.allow_supplementary_groups);
        assert!(!config.deny_setgroups);
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("launch.json");
        std::fs::write(
            &path,
            r#"{"uid_map":[{"inside":0,"outside":1000,"count":1}],"handshake_timeout_secs":5}"#,
        )
        .expect("write");

        let config = LaunchConfig::load(&path).expect("load");
        assert_eq!(config.uid_map, vec![IdMapEntry::new(0, 1000, 1)]);
        assert_eq!(config.handshake_timeout_secs, Some(5));
        assert!(config.allow_supplementary_groups);
        assert!(config.gid_map.is_empty());
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("launch.json");
        std::fs::write(&path, r#"{"seccomp":"strict"}"#).expect("write");
        assert!(matches!(
            LaunchConfig::load(&path),
            Err(WardenError::ConfigParse { .. })
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = LaunchConfig::load(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(WardenError::ConfigMissing { .. })));
    }

    #[test]
    fn empty_maps_default_to_identity_mapping() {
        let config = LaunchConfig::default();
        assert_eq!(config.uid_map_or_identity(1000), vec![IdMapEntry::new(1000, 1000, 1)]);
        assert_eq!(config.gid_map_or_identity(100), vec![IdMapEntry::new(100, 100, 1)]);
    }
}

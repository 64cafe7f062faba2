//! Domain primitive types used across the Warden workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Credentials of the user who invoked the launcher.
///
/// Resolved once per launch and never mutated afterwards. The privilege
/// dropper receives it by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Real user ID.
    pub uid: u32,
    /// Real (primary) group ID.
    pub gid: u32,
    /// Login name, used to resolve supplementary groups.
    pub username: String,
    /// Supplementary group IDs as resolved by the identity source.
    #[serde(default)]
    pub supplementary_groups: Vec<u32>,
}

impl Identity {
    /// Creates an identity with no supplementary groups.
    #[must_use]
    pub fn new(uid: u32, gid: u32, username: impl Into<String>) -> Self {
        Self {
            uid,
            gid,
            username: username.into(),
            supplementary_groups: Vec::new(),
        }
    }

    /// Returns the identity with the given supplementary groups.
    #[must_use]
    pub fn with_groups(mut self, groups: Vec<u32>) -> Self {
        self.supplementary_groups = groups;
        self
    }

    /// Returns `true` if the primary group is the privileged root group.
    #[must_use]
    pub const fn is_root_group(&self) -> bool {
        self.gid == 0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(uid={}, gid={})", self.username, self.uid, self.gid)
    }
}

/// One record of a user namespace ID map.
///
/// Maps the IDs `[inside, inside + count)` in the namespace onto
/// `[outside, outside + count)` in the parent namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdMapEntry {
    /// First ID inside the namespace.
    pub inside: u32,
    /// First ID in the parent namespace.
    pub outside: u32,
    /// Length of the range.
    pub count: u32,
}

impl IdMapEntry {
    /// Creates a new mapping record.
    #[must_use]
    pub const fn new(inside: u32, outside: u32, count: u32) -> Self {
        Self {
            inside,
            outside,
            count,
        }
    }

    /// Maps a single ID onto itself.
    #[must_use]
    pub const fn identity(id: u32) -> Self {
        Self::new(id, id, 1)
    }

    /// Exclusive end of the inside range, or `None` on overflow.
    #[must_use]
    pub const fn inside_end(&self) -> Option<u32> {
        self.inside.checked_add(self.count)
    }

    /// Exclusive end of the outside range, or `None` on overflow.
    #[must_use]
    pub const fn outside_end(&self) -> Option<u32> {
        self.outside.checked_add(self.count)
    }
}

impl fmt::Display for IdMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.inside, self.outside, self.count)
    }
}

impl FromStr for IdMapEntry {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WardenError::InvalidIdMap {
            input: s.to_owned(),
            reason: "expected \"<inside> <outside> <count>\"",
        };
        let fields: Vec<u32> = s
            .split_whitespace()
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| invalid())?;
        match fields.as_slice() {
            &[inside, outside, count] => Ok(Self::new(inside, outside, count)),
            _ => Err(invalid()),
        }
    }
}

/// Parses a comma-separated list of ID map records.
///
/// `"0 1000 1,1 100000 65536"` yields two records. Empty segments are
/// ignored so a trailing comma is accepted.
///
/// # Errors
///
/// Returns [`WardenError::InvalidIdMap`] if any record is malformed or the list
/// is empty.
pub fn parse_id_map(list: &str) -> Result<Vec<IdMapEntry>> {
    let entries: Vec<IdMapEntry> = list
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::parse)
        .collect::<Result<_>>()?;
    if entries.is_empty() {
        return Err(WardenError::InvalidIdMap {
            input: list.to_owned(),
            reason: "no records",
        });
    }
    Ok(entries)
}

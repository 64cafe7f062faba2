//! Irreversible privilege drop to the invoking user.
//!
//! Order matters: supplementary groups first, then the group ID, then the
//! user ID. Changing the user ID first would remove the permission needed
//! to change the others.
//!
//! The two phases can run apart. A launcher settles the groups while it
//! still holds root in the initial namespace, because a user namespace
//! whose `setgroups` file says `deny` refuses every later `setgroups(2)`,
//! and switches IDs once the namespace's maps are written.

use std::ffi::CString;
use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, pthread_sigmask};
use nix::unistd::{Gid, Uid};
use thiserror::Error;
use warden_common::types::Identity;

/// Errors raised while dropping privileges. Every variant is fatal: the
/// process must exit rather than run with an ambiguous identity.
#[derive(Debug, Error)]
pub enum PrivError {
    /// The supplementary group list could not be emptied.
    #[error("cannot clear supplementary groups")]
    ClearGroups(#[source] Errno),

    /// Changing the group ID failed.
    #[error("cannot set group ID to {gid}")]
    SetGid {
        /// Target group ID.
        gid: u32,
        /// Underlying system error.
        source: Errno,
    },

    /// Changing the user ID failed.
    #[error("cannot set user ID to {uid}")]
    SetUid {
        /// Target user ID.
        uid: u32,
        /// Underlying system error.
        source: Errno,
    },

    /// Signals could not be blocked around the ID change.
    #[error("cannot block signals during privilege drop")]
    SignalMask(#[source] Errno),

    /// Credentials could not be read back after the drop.
    #[error("cannot read credentials after privilege drop")]
    Snapshot(#[source] Errno),

    /// The process does not hold the expected identity after the drop.
    #[error("expected uid={uid} gid={gid} after privilege drop, found {actual}")]
    Verification {
        /// Expected user ID.
        uid: u32,
        /// Expected group ID.
        gid: u32,
        /// Credentials actually held.
        actual: Credentials,
    },

    /// Root could be re-acquired after the drop.
    #[error("user ID 0 could be regained after dropping to uid {0}")]
    Regained(u32),
}

/// Snapshot of a process's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Real user ID.
    pub real_uid: u32,
    /// Effective user ID.
    pub effective_uid: u32,
    /// Real group ID.
    pub real_gid: u32,
    /// Effective group ID.
    pub effective_gid: u32,
    /// Supplementary group IDs.
    pub groups: Vec<u32>,
}

impl Credentials {
    fn holds(&self, uid: u32, gid: u32) -> bool {
        self.real_uid == uid
            && self.effective_uid == uid
            && self.real_gid == gid
            && self.effective_gid == gid
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ruid={} euid={} rgid={} egid={} groups={:?}",
            self.real_uid, self.effective_uid, self.real_gid, self.effective_gid, self.groups
        )
    }
}

/// The credential system calls the dropper relies on.
pub trait CredentialOps {
    /// Resolves the full group list of `username` with primary group `gid`.
    ///
    /// # Errors
    ///
    /// Returns the system error if the group database lookup fails.
    fn group_list(&self, username: &str, gid: u32) -> Result<Vec<u32>, Errno>;

    /// Replaces the supplementary group list.
    ///
    /// # Errors
    ///
    /// Returns the system error from `setgroups(2)`.
    fn set_groups(&mut self, groups: &[u32]) -> Result<(), Errno>;

    /// Sets the real, effective and saved group IDs.
    ///
    /// # Errors
    ///
    /// Returns the system error from `setresgid(2)`.
    fn set_gid(&mut self, gid: u32) -> Result<(), Errno>;

    /// Sets the real, effective and saved user IDs.
    ///
    /// # Errors
    ///
    /// Returns the system error from `setresuid(2)`.
    fn set_uid(&mut self, uid: u32) -> Result<(), Errno>;

    /// Reads the current credentials.
    ///
    /// # Errors
    ///
    /// Returns the system error if any credential query fails.
    fn snapshot(&self) -> Result<Credentials, Errno>;
}

impl<T: CredentialOps + ?Sized> CredentialOps for &mut T {
    fn group_list(&self, username: &str, gid: u32) -> Result<Vec<u32>, Errno> {
        (**self).group_list(username, gid)
    }

    fn set_groups(&mut self, groups: &[u32]) -> Result<(), Errno> {
        (**self).set_groups(groups)
    }

    fn set_gid(&mut self, gid: u32) -> Result<(), Errno> {
        (**self).set_gid(gid)
    }

    fn set_uid(&mut self, uid: u32) -> Result<(), Errno> {
        (**self).set_uid(uid)
    }

    fn snapshot(&self) -> Result<Credentials, Errno> {
        (**self).snapshot()
    }
}

/// [`CredentialOps`] backed by the calling process's real credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCredentials;

impl CredentialOps for SystemCredentials {
    fn group_list(&self, username: &str, gid: u32) -> Result<Vec<u32>, Errno> {
        let name = CString::new(username).map_err(|_| Errno::EINVAL)?;
        let groups = nix::unistd::getgrouplist(&name, Gid::from_raw(gid))?;
        Ok(groups.into_iter().map(Gid::as_raw).collect())
    }

    fn set_groups(&mut self, groups: &[u32]) -> Result<(), Errno> {
        let groups: Vec<Gid> = groups.iter().copied().map(Gid::from_raw).collect();
        nix::unistd::setgroups(&groups)
    }

    fn set_gid(&mut self, gid: u32) -> Result<(), Errno> {
        let gid = Gid::from_raw(gid);
        nix::unistd::setresgid(gid, gid, gid)
    }

    fn set_uid(&mut self, uid: u32) -> Result<(), Errno> {
        let uid = Uid::from_raw(uid);
        nix::unistd::setresuid(uid, uid, uid)
    }

    fn snapshot(&self) -> Result<Credentials, Errno> {
        let uids = nix::unistd::getresuid()?;
        let gids = nix::unistd::getresgid()?;
        let groups = nix::unistd::getgroups()?;
        Ok(Credentials {
            real_uid: uids.real.as_raw(),
            effective_uid: uids.effective.as_raw(),
            real_gid: gids.real.as_raw(),
            effective_gid: gids.effective.as_raw(),
            groups: groups.into_iter().map(Gid::as_raw).collect(),
        })
    }
}

/// Blocks every maskable signal until dropped.
struct SignalBlock {
    previous: SigSet,
}

impl SignalBlock {
    fn block_all() -> Result<Self, PrivError> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut previous))
            .map_err(PrivError::SignalMask)?;
        Ok(Self { previous })
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            tracing::error!(error = %e, "cannot restore signal mask");
        }
    }
}

/// Drops the calling process to an unprivileged identity.
///
/// Consumed by [`PrivilegeDropper::drop_privileges`]: a process drops its
/// privileges once.
#[derive(Debug)]
pub struct PrivilegeDropper<O: CredentialOps> {
    ops: O,
}

impl<O: CredentialOps> PrivilegeDropper<O> {
    /// Creates a dropper over the given credential operations.
    pub const fn new(ops: O) -> Self {
        Self { ops }
    }

    /// Switches to `identity`, permanently.
    ///
    /// Supplementary groups are cleared when the target group is root or
    /// `allow_supplementary_groups` is false. Otherwise the user's groups
    /// are resolved and applied; if either step fails the list is cleared
    /// instead and the drop continues. The group ID is then set before
    /// the user ID, with all signals blocked across both calls, and the
    /// result is verified.
    ///
    /// # Errors
    ///
    /// Returns a [`PrivError`] if the groups cannot be cleared, either ID
    /// cannot be set, or the resulting credentials are wrong. The caller
    /// must terminate the process on any error.
    pub fn drop_privileges(
        self,
        identity: &Identity,
        allow_supplementary_groups: bool,
    ) -> Result<(), PrivError> {
        self.settle_groups(identity, allow_supplementary_groups)?
            .switch_identity(identity)
    }

    /// Runs the group phase of [`PrivilegeDropper::drop_privileges`] only.
    ///
    /// # Errors
    ///
    /// Returns [`PrivError::ClearGroups`] if the list cannot be emptied.
    pub fn settle_groups(
        mut self,
        identity: &Identity,
        allow_supplementary_groups: bool,
    ) -> Result<GroupsSettled<O>, PrivError> {
        self.configure_groups(identity, allow_supplementary_groups)?;
        Ok(GroupsSettled { ops: self.ops })
    }

    fn configure_groups(
        &mut self,
        identity: &Identity,
        allow_supplementary_groups: bool,
    ) -> Result<(), PrivError> {
        if identity.is_root_group() || !allow_supplementary_groups {
            self.clear_groups()?;
            tracing::debug!(user = %identity.username, "no supplementary groups");
            return Ok(());
        }

        let groups = match self.ops.group_list(&identity.username, identity.gid) {
            Ok(groups) => groups,
            Err(e) => {
                tracing::warn!(
                    user = %identity.username,
                    error = %e,
                    "cannot extract supplementary group list, dropping them"
                );
                return self.clear_groups();
            }
        };
        tracing::debug!(user = %identity.username, groups = ?groups, "supplementary groups resolved");

        if let Err(e) = self.ops.set_groups(&groups) {
            tracing::warn!(
                user = %identity.username,
                error = %e,
                "cannot set supplementary group list, dropping them"
            );
            return self.clear_groups();
        }
        Ok(())
    }

    fn clear_groups(&mut self) -> Result<(), PrivError> {
        self.ops.set_groups(&[]).map_err(PrivError::ClearGroups)
    }
}

/// A dropper whose supplementary groups are already in place.
///
/// Produced by [`PrivilegeDropper::settle_groups`].
#[derive(Debug)]
pub struct GroupsSettled<O: CredentialOps> {
    ops: O,
}

impl<O: CredentialOps> GroupsSettled<O> {
    /// Sets the group ID, then the user ID, and verifies the result.
    ///
    /// # Errors
    ///
    /// Returns a [`PrivError`] if either ID cannot be set or the resulting
    /// credentials are wrong.
    pub fn switch_identity(mut self, identity: &Identity) -> Result<(), PrivError> {
        {
            let _mask = SignalBlock::block_all()?;
            self.ops
                .set_gid(identity.gid)
                .map_err(|source| PrivError::SetGid {
                    gid: identity.gid,
                    source,
                })?;
            self.ops
                .set_uid(identity.uid)
                .map_err(|source| PrivError::SetUid {
                    uid: identity.uid,
                    source,
                })?;
        }

        self.verify(identity)?;
        tracing::debug!(identity = %identity, "privileges dropped");
        Ok(())
    }

    fn verify(&mut self, identity: &Identity) -> Result<(), PrivError> {
        let actual = self.ops.snapshot().map_err(PrivError::Snapshot)?;
        if !actual.holds(identity.uid, identity.gid) {
            return Err(PrivError::Verification {
                uid: identity.uid,
                gid: identity.gid,
                actual,
            });
        }
        if identity.uid != 0 && self.ops.set_uid(0).is_ok() {
            return Err(PrivError::Regained(identity.uid));
        }
        Ok(())
    }
}

/// Drops the calling process to `identity` using the real system calls.
///
/// # Errors
///
/// See [`PrivilegeDropper::drop_privileges`].
pub fn drop_privileges(identity: &Identity, allow_supplementary_groups: bool) -> Result<(), PrivError> {
    PrivilegeDropper::new(SystemCredentials).drop_privileges(identity, allow_supplementary_groups)
}

//! Resolution of the invoking user's identity.
//!
//! Reads the real (not effective) IDs, so a setuid-root launcher resolves
//! the user who started it.

use std::ffi::CString;

use nix::unistd::{Gid, Uid, User, getgid, getgrouplist, getuid};
use thiserror::Error;
use warden_common::types::Identity;

/// Errors raised while resolving the invoking identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The real uid has no password database entry.
    #[error("no user entry for uid {0}")]
    UnknownUser(u32),

    /// The password database lookup failed.
    #[error("user lookup for uid {uid} failed")]
    Lookup {
        /// The uid being resolved.
        uid: u32,
        /// Underlying system error.
        source: nix::Error,
    },
}

/// Resolves the identity of the user who invoked this process.
///
/// # Errors
///
/// Returns [`IdentityError`] if the real uid cannot be mapped to a user.
pub fn invoking_identity() -> Result<Identity, IdentityError> {
    resolve(getuid(), getgid())
}

/// Resolves the identity for the given real uid and gid.
///
/// A failing group lookup yields an identity without supplementary groups.
///
/// # Errors
///
/// Returns [`IdentityError`] if `uid` cannot be mapped to a user.
pub fn resolve(uid: Uid, gid: Gid) -> Result<Identity, IdentityError> {
    let user = User::from_uid(uid)
        .map_err(|source| IdentityError::Lookup {
            uid: uid.as_raw(),
            source,
        })?
        .ok_or(IdentityError::UnknownUser(uid.as_raw()))?;

    let groups = CString::new(user.name.as_str())
        .ok()
        .and_then(|name| match getgrouplist(&name, gid) {
            Ok(groups) => Some(groups),
            Err(e) => {
                tracing::warn!(user = %user.name, error = %e, "cannot resolve supplementary groups");
                None
            }
        })
        .unwrap_or_default();

    let identity = Identity::new(uid.as_raw(), gid.as_raw(), user.name)
        .with_groups(groups.into_iter().map(Gid::as_raw).collect());
    tracing::debug!(identity = %identity, groups = ?identity.supplementary_groups, "resolved invoking identity");
    Ok(identity)
}

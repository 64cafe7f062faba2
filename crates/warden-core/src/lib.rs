//! # warden-core
//!
//! The primitives a sandbox launcher needs between creating a
//! namespace-isolated child and letting that child exec untrusted code.
//!
//! This crate provides:
//! - **Handshake**: a one-shot readiness token passed over an inherited pipe.
//! - **ID maps**: validated single-write `uid_map`/`gid_map` population.
//! - **Process table**: locating the direct child of a process via `/proc`.
//! - **Privilege drop**: an irreversible switch to the invoking user.
//!
//! Every operation returns a typed error; deciding to terminate the
//! process is left to the caller.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(target_os = "linux")]
pub mod handshake;
#[cfg(target_os = "linux")]
pub mod identity;
pub mod idmap;
#[cfg(target_os = "linux")]
pub mod privdrop;
pub mod proctable;

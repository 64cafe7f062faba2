//! # warden-common
//!
//! The values a launch is described by: the invoking [`types::Identity`],
//! ID map records, the JSON [`config::LaunchConfig`] and the limits the
//! kernel puts on them. Nothing here touches a process or a namespace;
//! `warden-core` does that.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

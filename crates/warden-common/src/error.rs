//! Errors raised before the launch sequence starts.
//!
//! Loading the launch configuration, parsing ID maps typed on the command
//! line and checking who may ask for what all fail with [`WardenError`].
//! Failures inside the launch itself use the per-component enums of
//! `warden-core`.

use std::path::PathBuf;

use thiserror::Error;

/// Launch preparation failure.
#[derive(Debug, Error)]
pub enum WardenError {
    /// The configuration file does not exist.
    #[error("launch configuration {path} does not exist")]
    ConfigMissing {
        /// Path that was given.
        path: PathBuf,
    },

    /// The configuration file exists but cannot be read.
    #[error("cannot read launch configuration {path}")]
    ConfigRead {
        /// Path of the configuration file.
        path: PathBuf,
        /// Read failure.
        source: std::io::Error,
    },

    /// The configuration file is not a valid launch configuration.
    #[error("launch configuration {path} is malformed")]
    ConfigParse {
        /// Path of the configuration file.
        path: PathBuf,
        /// Decoder failure, with line and column.
        source: serde_json::Error,
    },

    /// An ID map given as text cannot be parsed.
    #[error("invalid ID map {input:?}: {reason}")]
    InvalidIdMap {
        /// The offending record or list.
        input: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The process lacks the effective uid the operation needs.
    #[error("{operation} requires an effective uid of 0")]
    Unprivileged {
        /// Operation that was refused.
        operation: &'static str,
    },

    /// A setting only root may choose was supplied by another user.
    #[error("{setting} may only be set when warden is invoked by root")]
    Restricted {
        /// Flag or configuration key that was refused.
        setting: &'static str,
    },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, WardenError>;

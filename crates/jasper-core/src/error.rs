//! Error types for targets and replica configuration.

use std::time::Duration;
use thiserror::Error;

/// Errors a target reports for a single read, write or timestamp call.
///
/// These never abort a reconciliation; the manager records them by marking
/// the replica as desynced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("Target is offline")]
    Offline,

    #[error("Target error: {0}")]
    Error(String),

    #[error("Invalid authentication")]
    InvalidAuth,

    #[error("Invalid file reference")]
    InvalidFileReference,

    #[error("Target call timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl TargetError {
    /// Generic backend failure.
    pub fn other(message: impl Into<String>) -> Self {
        TargetError::Error(message.into())
    }
}

impl From<std::io::Error> for TargetError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TargetError::InvalidFileReference,
            _ => TargetError::Error(err.to_string()),
        }
    }
}

/// Errors raised while (de)serialising a replica set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Malformed replica configuration: {0}")]
    Malformed(String),

    #[error("Invalid target configuration for {kind}: {reason}")]
    InvalidTarget { kind: String, reason: String },
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Malformed(err.to_string())
    }
}

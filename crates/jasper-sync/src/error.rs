//! Error types for the replication manager.

use jasper_core::ConfigError;
use thiserror::Error;

/// Errors returned by manager construction and manager operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Manager id already in use: {0}")]
    DuplicateId(String),

    #[error("Cached manager {id} was built for target types {cached:?}, requested {requested:?}")]
    InconsistentTargetKinds {
        id: String,
        cached: Vec<String>,
        requested: Vec<String>,
    },

    #[error("Manager has stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

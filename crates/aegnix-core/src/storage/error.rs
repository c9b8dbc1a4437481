//! Storage error types.
//!
//! Defines errors that can occur during storage operations:
//! - `NotFound`: Requested key record doesn't exist
//! - `Conflict`: Write would undo a permanent state change (revocation)
//! - `Serialization`: Failed to encode/decode a stored record
//! - `Io`: Underlying storage system errors
//! - `Timeout`: The call did not finish within the caller's deadline

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Key record not found
    #[error("key not found: agent {agent_id}, key {key_id}")]
    NotFound {
        /// Agent identifier that was looked up
        agent_id: String,
        /// Key identifier that was looked up
        key_id: String,
    },

    /// Write conflicts with existing state
    ///
    /// Returned when re-registering a key that has already been revoked.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, poisoned lock, etc.)
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Storage operation that timed out
        operation: &'static str,
        /// Deadline that was exceeded
        timeout: Duration,
    },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StorageError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StorageError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

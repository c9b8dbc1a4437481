//! Bridge error types.

use std::path::PathBuf;

use aegnix_core::{CanonicalError, EnvelopeError, StorageError};
use aegnix_crypto::CryptoError;
use thiserror::Error;

/// Errors surfaced by the bridge binary and its helpers.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Storage backend could not be opened or failed outside the engine.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Envelope engine rejected the operation.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Key material was malformed.
    #[error("key error: {0}")]
    Crypto(#[from] CryptoError),

    /// Payload JSON could not be represented canonically.
    #[error("payload error: {0}")]
    Payload(#[from] CanonicalError),

    /// Key file could not be read or did not hold a hex key.
    #[error("key file {path}: {reason}")]
    KeyFile {
        /// File that was read
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Input or output file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON input or output failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

//! Error types for the envelope protocol.
//!
//! Every variant is a terminal, reported outcome: the engine never retries or
//! recovers internally. Any ambiguity (missing field, unknown algorithm,
//! storage timeout) resolves to one of these errors, never to acceptance.

use thiserror::Error;

use crate::{
    canonical::CanonicalError, envelope::EnvelopeState, keyring::KeyStatus, storage::StorageError,
};

/// Reasons an envelope operation can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Structurally invalid input or a payload that cannot be canonicalized
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// What was wrong with the input
        reason: String,
    },

    /// Signature does not verify against the canonical bytes
    #[error("invalid signature")]
    InvalidSignature,

    /// No key record for the envelope's (producer, key id)
    #[error("unknown key: producer {producer}, key {key_id}")]
    UnknownKey {
        /// Envelope producer
        producer: String,
        /// Key identifier named by the envelope
        key_id: String,
    },

    /// Key found but revoked as of the verification time
    #[error("key revoked: producer {producer}, key {key_id}, revoked at {revoked_at_millis}")]
    KeyRevoked {
        /// Envelope producer
        producer: String,
        /// Revoked key identifier
        key_id: String,
        /// Revocation time (ms since epoch)
        revoked_at_millis: u64,
    },

    /// Key found but past its expiry time
    #[error("key expired: producer {producer}, key {key_id}, expired at {expired_at_millis}")]
    KeyExpired {
        /// Envelope producer
        producer: String,
        /// Expired key identifier
        key_id: String,
        /// Expiry time (ms since epoch)
        expired_at_millis: u64,
    },

    /// Key found but not trusted by the operator
    #[error("key not trusted: producer {producer}, key {key_id}, status {status}")]
    KeyNotTrusted {
        /// Envelope producer
        producer: String,
        /// Key identifier
        key_id: String,
        /// Current trust level
        status: KeyStatus,
    },

    /// Nonce already seen for this (producer, key id)
    #[error("replay detected")]
    ReplayDetected,

    /// Envelope timestamp is older than the replay window
    #[error("stale envelope: timestamp {timestamp_millis} older than window start {window_start_millis}")]
    StaleEnvelope {
        /// Envelope timestamp (ms since epoch)
        timestamp_millis: u64,
        /// Oldest accepted timestamp at verification time
        window_start_millis: u64,
    },

    /// Envelope timestamp is further in the future than the allowed skew
    #[error("clock skew: timestamp {timestamp_millis} ahead of limit {limit_millis}")]
    ClockSkew {
        /// Envelope timestamp (ms since epoch)
        timestamp_millis: u64,
        /// Latest accepted timestamp at verification time
        limit_millis: u64,
    },

    /// Sealed payload could not be decrypted or did not match its commitment
    #[error("decryption failed")]
    DecryptionFailed,

    /// Operation invoked on an envelope in the wrong lifecycle state
    #[error("invalid state: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current envelope state
        state: EnvelopeState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Storage collaborator failed or timed out
    #[error("storage unavailable: {reason}")]
    StorageUnavailable {
        /// Underlying storage failure
        reason: String,
    },
}

impl EnvelopeError {
    /// Stable machine-readable reason, recorded in the audit log.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope { .. } => "malformed_envelope",
            Self::InvalidSignature => "invalid_signature",
            Self::UnknownKey { .. } => "unknown_key",
            Self::KeyRevoked { .. } => "key_revoked",
            Self::KeyExpired { .. } => "key_expired",
            Self::KeyNotTrusted { .. } => "key_not_trusted",
            Self::ReplayDetected => "replay_detected",
            Self::StaleEnvelope { .. } => "stale_envelope",
            Self::ClockSkew { .. } => "clock_skew",
            Self::DecryptionFailed => "decryption_failed",
            Self::InvalidState { .. } => "invalid_state",
            Self::StorageUnavailable { .. } => "storage_unavailable",
        }
    }

    /// Returns true if the failure came from the storage collaborator.
    ///
    /// These are the only outcomes a caller may reasonably retry; every
    /// other variant is a verdict about the envelope itself.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope { reason: reason.into() }
    }
}

impl From<StorageError> for EnvelopeError {
    fn from(err: StorageError) -> Self {
        Self::StorageUnavailable { reason: err.to_string() }
    }
}

impl From<CanonicalError> for EnvelopeError {
    fn from(err: CanonicalError) -> Self {
        Self::MalformedEnvelope { reason: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn storage_errors_become_unavailable() {
        let err: EnvelopeError = StorageError::Timeout {
            operation: "persist_seen",
            timeout: Duration::from_millis(5),
        }
        .into();

        assert!(err.is_storage_failure());
        assert_eq!(err.reason_code(), "storage_unavailable");
    }

    #[test]
    fn canonical_errors_become_malformed() {
        let err: EnvelopeError = CanonicalError::NonFiniteNumber.into();

        assert!(matches!(err, EnvelopeError::MalformedEnvelope { .. }));
        assert!(!err.is_storage_failure());
    }

    #[test]
    fn decryption_failure_display_is_opaque() {
        assert_eq!(EnvelopeError::DecryptionFailed.to_string(), "decryption failed");
    }
}

//! Audit log records.
//!
//! One entry per verification outcome. Entries are append-only: the engine
//! writes them and never reads them back.

use serde::{Deserialize, Serialize};

/// Result of verifying an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    /// Signature, key status and replay checks all passed
    Accepted,
    /// Verification failed
    Rejected {
        /// Stable reason code (see `EnvelopeError::reason_code`)
        reason: String,
    },
}

/// Immutable record of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Envelope id (hex digest of the signing bytes)
    pub envelope_id: String,
    /// Envelope producer
    pub producer: String,
    /// Envelope subject
    pub subject: String,
    /// Key identifier named by the envelope
    pub key_id: String,
    /// Verification outcome
    pub outcome: AuditOutcome,
    /// When the outcome was decided (ms since epoch)
    pub recorded_at_millis: u64,
}

impl AuditLogEntry {
    /// Returns true if the entry records an accepted envelope.
    pub fn is_accepted(&self) -> bool {
        self.outcome == AuditOutcome::Accepted
    }
}

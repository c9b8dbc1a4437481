//! Key records for registered signing keys.
//!
//! A record binds an agent's public key to an opaque key identifier chosen
//! by the agent. Records are never deleted, only revoked; revocation is
//! permanent.
//!
//! A key verifies envelopes only while it is unrevoked, unexpired and
//! [`KeyStatus::Trusted`]. Pending and untrusted keys stay in the keyring so
//! an operator can promote them later by registering the record again.

use std::{fmt, str::FromStr};

use aegnix_crypto::{PUBLIC_KEY_LENGTH, SigningPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EnvelopeError;

/// Length of a key fingerprint in hex characters (first 16 digest bytes)
pub const FINGERPRINT_HEX_LENGTH: usize = 32;

/// Operator-assigned trust level of a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Verifies envelopes
    #[default]
    Trusted,
    /// Registered, awaiting operator approval
    Pending,
    /// Explicitly distrusted
    Untrusted,
}

impl KeyStatus {
    /// Lowercase name, as used on the command line and in JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Pending => "pending",
            Self::Untrusted => "untrusted",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trusted" => Ok(Self::Trusted),
            "pending" => Ok(Self::Pending),
            "untrusted" => Ok(Self::Untrusted),
            other => Err(format!("unknown key status {other:?}")),
        }
    }
}

/// Registered public signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Agent (producer) identifier
    pub agent_id: String,
    /// Opaque key identifier, unique per agent
    pub key_id: String,
    /// Raw Ed25519 public key
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    /// Hex fingerprint of `public_key`, see [`fingerprint`]
    pub fingerprint: String,
    /// Registration time (ms since epoch)
    pub created_at_millis: u64,
    /// Revocation time (ms since epoch), if revoked
    pub revoked_at_millis: Option<u64>,
    /// Trust level
    #[serde(default)]
    pub status: KeyStatus,
    /// Expiry time (ms since epoch), if the key is time-limited
    #[serde(default)]
    pub expires_at_millis: Option<u64>,
    /// Roles granted to the key's holder
    #[serde(default)]
    pub roles: Vec<String>,
}

impl KeyRecord {
    /// Record for a newly registered, non-revoked key.
    pub fn new(
        agent_id: impl Into<String>,
        key_id: impl Into<String>,
        public_key: &SigningPublicKey,
        created_at_millis: u64,
    ) -> Self {
        let public_key = public_key.to_bytes();
        Self {
            agent_id: agent_id.into(),
            key_id: key_id.into(),
            fingerprint: fingerprint(&public_key),
            public_key,
            created_at_millis,
            revoked_at_millis: None,
            status: KeyStatus::Trusted,
            expires_at_millis: None,
            roles: Vec::new(),
        }
    }

    /// Set the trust level.
    #[must_use]
    pub fn with_status(mut self, status: KeyStatus) -> Self {
        self.status = status;
        self
    }

    /// Expire the key at `expires_at_millis`.
    #[must_use]
    pub fn with_expiry(mut self, expires_at_millis: u64) -> Self {
        self.expires_at_millis = Some(expires_at_millis);
        self
    }

    /// Replace the granted roles.
    #[must_use]
    pub fn with_roles<I, R>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if the key is revoked as of `now_millis`.
    pub fn is_revoked_at(&self, now_millis: u64) -> bool {
        self.revoked_at_millis.is_some_and(|at| now_millis >= at)
    }

    /// Returns true if the key has expired as of `now_millis`.
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        self.expires_at_millis.is_some_and(|at| now_millis >= at)
    }

    /// Returns true if the holder was granted `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Parsed public key.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope`: stored bytes are not a valid Ed25519 point
    pub fn signing_key(&self) -> Result<SigningPublicKey, EnvelopeError> {
        SigningPublicKey::from_bytes(&self.public_key).map_err(|e| {
            EnvelopeError::malformed(format!("stored key {}/{}: {e}", self.agent_id, self.key_id))
        })
    }
}

/// Stable fingerprint of a public key: hex SHA-256, truncated to 32 chars.
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..FINGERPRINT_HEX_LENGTH / 2])
}

#[cfg(test)]
mod tests {
    use aegnix_crypto::generate_signing_keypair;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn fingerprint_is_truncated_sha256() {
        let fp = fingerprint(&[0u8; 32]);

        assert_eq!(fp.len(), FINGERPRINT_HEX_LENGTH);
        assert_eq!(fp, "66687aadf862bd776c8fc18b8e9f8e20");
    }

    #[test]
    fn revocation_takes_effect_at_timestamp() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let (_, public) = generate_signing_keypair(&mut rng);
        let mut record = KeyRecord::new("fusion-ae", "k1", &public, 100);

        assert!(!record.is_revoked_at(u64::MAX));

        record.revoked_at_millis = Some(500);
        assert!(!record.is_revoked_at(499));
        assert!(record.is_revoked_at(500));
        assert!(record.is_revoked_at(501));
    }

    #[test]
    fn expiry_takes_effect_at_timestamp() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let (_, public) = generate_signing_keypair(&mut rng);
        let record = KeyRecord::new("fusion-ae", "k1", &public, 100);

        assert!(!record.is_expired_at(u64::MAX));

        let record = record.with_expiry(500);
        assert!(!record.is_expired_at(499));
        assert!(record.is_expired_at(500));
    }

    #[test]
    fn status_parses_lowercase_names() {
        for status in [KeyStatus::Trusted, KeyStatus::Pending, KeyStatus::Untrusted] {
            assert_eq!(status.as_str().parse::<KeyStatus>(), Ok(status));
        }
        assert!("revoked".parse::<KeyStatus>().is_err());
        assert_eq!(KeyStatus::default(), KeyStatus::Trusted);
    }

    #[test]
    fn roles_are_matched_exactly() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let (_, public) = generate_signing_keypair(&mut rng);
        let record =
            KeyRecord::new("fusion-ae", "k1", &public, 0).with_roles(["producer", "fusion"]);

        assert!(record.has_role("fusion"));
        assert!(!record.has_role("fus"));
    }

    #[test]
    fn legacy_record_decodes_with_defaults() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let (_, public) = generate_signing_keypair(&mut rng);
        let record = KeyRecord::new("fusion-ae", "k1", &public, 0);
        let mut json = serde_json::to_value(&record).unwrap();
        for field in ["status", "expires_at_millis", "roles"] {
            json.as_object_mut().unwrap().remove(field);
        }

        let decoded: KeyRecord = serde_json::from_value(json).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn signing_key_roundtrips() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let (_, public) = generate_signing_keypair(&mut rng);
        let record = KeyRecord::new("fusion-ae", "k1", &public, 0);

        assert_eq!(record.signing_key().unwrap(), public);
        assert_eq!(record.fingerprint, fingerprint(&public.to_bytes()));
    }
}

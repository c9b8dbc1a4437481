//! Envelope data model, signing layout and wire format.
//!
//! An envelope moves through `Draft → Signed → Encrypted` on the producer
//! side. Each step adds fields; none rewrites a field covered by the
//! signature. The state is derived from which fields are present, so an
//! envelope can never claim a state its fields do not support.
//!
//! # Signing bytes
//!
//! The signature covers every field except itself, in a fixed order, each
//! length-prefixed or fixed-width:
//!
//! ```text
//! "aegnix-envelope-v1" (u32 len || bytes)
//! schema version      u8
//! producer            u32 len || UTF-8
//! subject             u32 len || UTF-8
//! nonce               16 bytes
//! key id              u32 len || UTF-8
//! timestamp           u64 big-endian, ms since Unix epoch
//! correlation id      0x00 | 0x01 || u32 len || UTF-8
//! sensitivity         u32 len || UTF-8
//! labels              u32 count || (u32 len || UTF-8)*
//! payload commitment  32 bytes
//! ```
//!
//! The payload commitment is `SHA-256("aegnix-payload-v1" || nonce ||
//! canonical payload)`. Sealing replaces the payload with ciphertext but
//! carries the commitment, so the signature stays verifiable without the
//! symmetric key (sign-then-encrypt).

use aegnix_crypto::{AEAD_ALGORITHM, AEAD_NONCE_LENGTH, AEAD_TAG_LENGTH, SealedBox, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    canonical::{self, CanonicalWriter, Value},
    error::EnvelopeError,
};

/// Current envelope schema version
pub const SCHEMA_VERSION: u8 = 1;

/// Envelope nonce size (128 bits)
pub const NONCE_LENGTH: usize = 16;

/// Payload commitment size (SHA-256)
pub const COMMITMENT_LENGTH: usize = 32;

/// Maximum length in bytes of any identifier, marking or label
pub const MAX_FIELD_LENGTH: usize = 1024;

/// Maximum number of labels on one envelope
pub const MAX_LABELS: usize = 64;

/// Sensitivity marking of a freshly built envelope
pub const DEFAULT_SENSITIVITY: &str = "UNCLASS";

const SIGNING_DOMAIN: &str = "aegnix-envelope-v1";
const COMMITMENT_DOMAIN: &[u8] = b"aegnix-payload-v1";
const AAD_DOMAIN: &str = "aegnix-aad-v1";

/// Producer-side lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Built, not yet signed
    Draft,
    /// Signed; payload in plaintext
    Signed,
    /// Signed, then payload sealed
    Encrypted,
}

/// Encrypted payload with the metadata needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// AEAD algorithm tag (only `AES-256-GCM` is accepted)
    pub algorithm: String,
    /// AEAD nonce
    pub iv: [u8; AEAD_NONCE_LENGTH],
    /// Ciphertext of the canonical payload bytes
    pub ciphertext: Vec<u8>,
    /// AEAD authentication tag
    pub tag: [u8; AEAD_TAG_LENGTH],
    /// Commitment to the plaintext, covered by the signature
    pub commitment: [u8; COMMITMENT_LENGTH],
}

impl SealedPayload {
    pub(crate) fn from_box(sealed: SealedBox, commitment: [u8; COMMITMENT_LENGTH]) -> Self {
        Self {
            algorithm: AEAD_ALGORITHM.to_string(),
            iv: sealed.nonce,
            ciphertext: sealed.ciphertext,
            tag: sealed.tag,
            commitment,
        }
    }

    pub(crate) fn to_box(&self) -> SealedBox {
        SealedBox { nonce: self.iv, ciphertext: self.ciphertext.clone(), tag: self.tag }
    }
}

/// Envelope payload: plaintext value or sealed ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plaintext structured value
    Plain(Value),
    /// Encrypted canonical payload
    Sealed(SealedPayload),
}

/// Signed (and optionally encrypted) message unit.
///
/// Fields are private: envelopes are created by the engine or decoded from
/// the wire, and only the engine's `sign` and `seal` steps add fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    schema_version: u8,
    producer: String,
    subject: String,
    nonce: [u8; NONCE_LENGTH],
    timestamp_millis: u64,
    corr_id: Option<String>,
    sensitivity: String,
    labels: Vec<String>,
    key_id: Option<String>,
    payload: Payload,
    signature: Option<Signature>,
}

impl Envelope {
    /// Assemble a draft.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope`: empty or oversized producer/subject, or a
    ///   payload that cannot be canonicalized
    pub(crate) fn draft(
        producer: &str,
        subject: &str,
        payload: Value,
        nonce: [u8; NONCE_LENGTH],
        timestamp_millis: u64,
    ) -> Result<Self, EnvelopeError> {
        check_field("producer", producer)?;
        check_field("subject", subject)?;
        canonical::encode(&payload)?;

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            producer: producer.to_string(),
            subject: subject.to_string(),
            nonce,
            timestamp_millis,
            corr_id: None,
            sensitivity: DEFAULT_SENSITIVITY.to_string(),
            labels: Vec::new(),
            key_id: None,
            payload: Payload::Plain(payload),
            signature: None,
        })
    }

    /// Lifecycle state implied by the present fields.
    pub fn state(&self) -> EnvelopeState {
        match (&self.signature, &self.payload) {
            (None, _) => EnvelopeState::Draft,
            (Some(_), Payload::Plain(_)) => EnvelopeState::Signed,
            (Some(_), Payload::Sealed(_)) => EnvelopeState::Encrypted,
        }
    }

    /// Schema version.
    pub fn schema_version(&self) -> u8 {
        self.schema_version
    }

    /// Producer identifier.
    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Routing subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Random per-envelope nonce.
    pub fn nonce(&self) -> &[u8; NONCE_LENGTH] {
        &self.nonce
    }

    /// Creation time (ms since Unix epoch).
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp_millis
    }

    /// Correlation id, linking a reply to a request.
    pub fn corr_id(&self) -> Option<&str> {
        self.corr_id.as_deref()
    }

    /// Sensitivity marking, e.g. `UNCLASS` or `CUI`.
    pub fn sensitivity(&self) -> &str {
        &self.sensitivity
    }

    /// Handling labels, in the order they were added.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Signing key identifier, set by signing.
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Payload, plaintext or sealed.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Signature, set by signing.
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Attach a correlation id. Only allowed on drafts.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: the envelope is already signed
    /// - `MalformedEnvelope`: empty or oversized id
    pub fn set_corr_id(&mut self, corr_id: &str) -> Result<(), EnvelopeError> {
        self.require_state(EnvelopeState::Draft, "set correlation id")?;
        check_field("correlation id", corr_id)?;
        self.corr_id = Some(corr_id.to_string());
        Ok(())
    }

    /// Replace the sensitivity marking. Only allowed on drafts.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: the envelope is already signed
    /// - `MalformedEnvelope`: empty or oversized marking
    pub fn set_sensitivity(&mut self, sensitivity: &str) -> Result<(), EnvelopeError> {
        self.require_state(EnvelopeState::Draft, "set sensitivity")?;
        check_field("sensitivity", sensitivity)?;
        self.sensitivity = sensitivity.to_string();
        Ok(())
    }

    /// Append a handling label. Only allowed on drafts.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: the envelope is already signed
    /// - `MalformedEnvelope`: empty or oversized label, or too many labels
    pub fn add_label(&mut self, label: &str) -> Result<(), EnvelopeError> {
        self.require_state(EnvelopeState::Draft, "add label")?;
        check_field("label", label)?;
        if self.labels.len() >= MAX_LABELS {
            return Err(EnvelopeError::malformed(format!("more than {MAX_LABELS} labels")));
        }
        self.labels.push(label.to_string());
        Ok(())
    }

    /// Commitment to the plaintext payload.
    pub fn payload_commitment(&self) -> Result<[u8; COMMITMENT_LENGTH], EnvelopeError> {
        match &self.payload {
            Payload::Plain(value) => commitment_for(&self.nonce, value),
            Payload::Sealed(sealed) => Ok(sealed.commitment),
        }
    }

    /// Canonical bytes covered by the signature.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope`: no key id yet, or a non-canonical payload
    pub fn signing_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let key_id =
            self.key_id.as_deref().ok_or_else(|| EnvelopeError::malformed("missing key id"))?;
        self.signing_bytes_for(key_id)
    }

    /// Stable identifier: hex of the first 16 bytes of SHA-256 over the
    /// signing bytes.
    pub fn envelope_id(&self) -> Result<String, EnvelopeError> {
        let digest = Sha256::digest(self.signing_bytes()?);
        Ok(hex::encode(&digest[..16]))
    }

    /// Associated data binding a sealed payload to producer, subject, key id
    /// and nonce.
    pub(crate) fn associated_data(&self) -> Result<Vec<u8>, EnvelopeError> {
        let key_id =
            self.key_id.as_deref().ok_or_else(|| EnvelopeError::malformed("missing key id"))?;

        let mut writer = CanonicalWriter::new();
        writer.put_str(AAD_DOMAIN)?;
        writer.put_str(&self.producer)?;
        writer.put_str(&self.subject)?;
        writer.put_str(key_id)?;
        writer.put_fixed(&self.nonce);
        Ok(writer.finish())
    }

    pub(crate) fn signing_bytes_for(&self, key_id: &str) -> Result<Vec<u8>, EnvelopeError> {
        let commitment = self.payload_commitment()?;

        let mut writer = CanonicalWriter::new();
        writer.put_str(SIGNING_DOMAIN)?;
        writer.put_u8(self.schema_version);
        writer.put_str(&self.producer)?;
        writer.put_str(&self.subject)?;
        writer.put_fixed(&self.nonce);
        writer.put_str(key_id)?;
        writer.put_u64(self.timestamp_millis);
        writer.put_opt_str(self.corr_id.as_deref())?;
        writer.put_str(&self.sensitivity)?;
        writer.put_str_list(&self.labels)?;
        writer.put_fixed(&commitment);
        Ok(writer.finish())
    }

    pub(crate) fn attach_signature(&mut self, key_id: String, signature: Signature) {
        self.key_id = Some(key_id);
        self.signature = Some(signature);
    }

    pub(crate) fn replace_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub(crate) fn require_state(
        &self,
        expected: EnvelopeState,
        operation: &'static str,
    ) -> Result<(), EnvelopeError> {
        let state = self.state();
        if state != expected {
            return Err(EnvelopeError::InvalidState { state, operation });
        }
        Ok(())
    }

    /// Wire form of a signed or sealed envelope.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: drafts are not transmittable
    pub fn to_wire(&self) -> Result<WireEnvelope, EnvelopeError> {
        let (Some(key_id), Some(signature)) = (&self.key_id, &self.signature) else {
            return Err(EnvelopeError::InvalidState {
                state: self.state(),
                operation: "encode for transmission",
            });
        };

        let body = match &self.payload {
            Payload::Plain(value) => WireBody::Plain { payload: canonical::encode(value)? },
            Payload::Sealed(sealed) => WireBody::Sealed {
                algorithm: sealed.algorithm.clone(),
                iv: sealed.iv.to_vec(),
                ciphertext: sealed.ciphertext.clone(),
                tag: sealed.tag.to_vec(),
                commitment: sealed.commitment.to_vec(),
            },
        };

        Ok(WireEnvelope {
            schema_version: self.schema_version,
            producer: self.producer.clone(),
            subject: self.subject.clone(),
            nonce: self.nonce.to_vec(),
            timestamp_millis: self.timestamp_millis,
            corr_id: self.corr_id.clone(),
            sensitivity: self.sensitivity.clone(),
            labels: self.labels.clone(),
            key_id: key_id.clone(),
            body,
            signature: signature.to_bytes().to_vec(),
        })
    }

    /// CBOR encoding of the wire form.
    pub fn to_cbor(&self) -> Result<Vec<u8>, EnvelopeError> {
        self.to_wire()?.to_cbor()
    }

    /// Decode and validate a CBOR-encoded envelope.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Self::try_from(WireEnvelope::from_cbor(bytes)?)
    }
}

fn commitment_for(
    nonce: &[u8; NONCE_LENGTH],
    value: &Value,
) -> Result<[u8; COMMITMENT_LENGTH], EnvelopeError> {
    let canonical = canonical::encode(value)?;

    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_DOMAIN);
    hasher.update(nonce);
    hasher.update(&canonical);

    let mut out = [0u8; COMMITMENT_LENGTH];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

/// Returns true if `value` matches the payload commitment of `envelope`.
pub(crate) fn commitment_matches(
    envelope: &Envelope,
    value: &Value,
) -> Result<bool, EnvelopeError> {
    Ok(commitment_for(&envelope.nonce, value)? == envelope.payload_commitment()?)
}

pub(crate) fn check_field(name: &str, value: &str) -> Result<(), EnvelopeError> {
    if value.is_empty() {
        return Err(EnvelopeError::malformed(format!("{name} is empty")));
    }
    if value.len() > MAX_FIELD_LENGTH {
        return Err(EnvelopeError::malformed(format!(
            "{name} is {} bytes, limit {MAX_FIELD_LENGTH}",
            value.len()
        )));
    }
    Ok(())
}

fn fixed<const N: usize>(name: &str, bytes: &[u8]) -> Result<[u8; N], EnvelopeError> {
    bytes.try_into().map_err(|_| {
        EnvelopeError::malformed(format!("{name} is {} bytes, expected {N}", bytes.len()))
    })
}

/// Serialized envelope as it travels between peers.
///
/// Only signed envelopes have a wire form. Byte fields are validated for
/// width when converted back into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Schema version
    pub schema_version: u8,
    /// Producer identifier
    pub producer: String,
    /// Routing subject
    pub subject: String,
    /// 16-byte nonce
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// Creation time (ms since Unix epoch)
    pub timestamp_millis: u64,
    /// Optional correlation id
    pub corr_id: Option<String>,
    /// Sensitivity marking
    pub sensitivity: String,
    /// Handling labels
    #[serde(default)]
    pub labels: Vec<String>,
    /// Signing key identifier
    pub key_id: String,
    /// Payload, plaintext or sealed
    pub body: WireBody,
    /// 64-byte Ed25519 signature
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Wire form of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireBody {
    /// Canonical payload bytes
    Plain {
        /// Canonical encoding of the payload value
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Sealed payload
    Sealed {
        /// AEAD algorithm tag
        algorithm: String,
        /// 12-byte AEAD nonce
        #[serde(with = "serde_bytes")]
        iv: Vec<u8>,
        /// Ciphertext
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
        /// 16-byte authentication tag
        #[serde(with = "serde_bytes")]
        tag: Vec<u8>,
        /// 32-byte plaintext commitment
        #[serde(with = "serde_bytes")]
        commitment: Vec<u8>,
    },
}

impl WireEnvelope {
    /// Encode as CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|e| EnvelopeError::malformed(format!("CBOR encode failed: {e}")))?;
        Ok(out)
    }

    /// Decode from CBOR. Field contents are not validated here.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| EnvelopeError::malformed(format!("CBOR decode failed: {e}")))
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if wire.schema_version != SCHEMA_VERSION {
            return Err(EnvelopeError::malformed(format!(
                "unsupported schema version {}",
                wire.schema_version
            )));
        }
        check_field("producer", &wire.producer)?;
        check_field("subject", &wire.subject)?;
        check_field("key id", &wire.key_id)?;
        if let Some(corr_id) = &wire.corr_id {
            check_field("correlation id", corr_id)?;
        }
        check_field("sensitivity", &wire.sensitivity)?;
        if wire.labels.len() > MAX_LABELS {
            return Err(EnvelopeError::malformed(format!(
                "{} labels, limit {MAX_LABELS}",
                wire.labels.len()
            )));
        }
        for label in &wire.labels {
            check_field("label", label)?;
        }

        let nonce = fixed::<NONCE_LENGTH>("nonce", &wire.nonce)?;
        let signature = Signature::from_slice(&wire.signature)
            .map_err(|e| EnvelopeError::malformed(e.to_string()))?;

        let payload = match wire.body {
            WireBody::Plain { payload } => Payload::Plain(canonical::decode(&payload)?),
            WireBody::Sealed { algorithm, iv, ciphertext, tag, commitment } => {
                if algorithm != AEAD_ALGORITHM {
                    return Err(EnvelopeError::malformed(format!(
                        "unsupported algorithm {algorithm:?}"
                    )));
                }
                Payload::Sealed(SealedPayload {
                    algorithm,
                    iv: fixed("iv", &iv)?,
                    ciphertext,
                    tag: fixed("tag", &tag)?,
                    commitment: fixed("commitment", &commitment)?,
                })
            },
        };

        Ok(Self {
            schema_version: wire.schema_version,
            producer: wire.producer,
            subject: wire.subject,
            nonce,
            timestamp_millis: wire.timestamp_millis,
            corr_id: wire.corr_id,
            sensitivity: wire.sensitivity,
            labels: wire.labels,
            key_id: Some(wire.key_id),
            payload,
            signature: Some(signature),
        })
    }
}

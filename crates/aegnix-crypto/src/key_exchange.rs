//! X25519 key agreement with HKDF-SHA256 key derivation.
//!
//! Both sides of an exchange arrive at the same symmetric key:
//!
//! ```text
//! derive_shared_key(a_secret, B_public, ctx) == derive_shared_key(b_secret, A_public, ctx)
//! ```
//!
//! The derivation context is mixed into the HKDF `info` parameter, so keys
//! derived for different protocol versions or producer/subject pairs are
//! independent even when the key pairs are the same.

use std::fmt;

use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// Size of a derived symmetric key (256 bits)
pub const SYMMETRIC_KEY_LENGTH: usize = 32;

/// Label prepended to every HKDF info parameter
const KDF_LABEL: &[u8] = b"aegnix-kex-v1";

/// X25519 static secret. Zeroized on drop.
#[derive(Clone)]
pub struct ExchangeSecret(StaticSecret);

impl ExchangeSecret {
    /// Restore a secret from its raw 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(StaticSecret::from(raw)))
    }

    /// Raw 32 bytes, zeroized when the returned wrapper is dropped.
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes())
    }

    /// Public half of this secret.
    pub fn public_key(&self) -> ExchangePublicKey {
        ExchangePublicKey(PublicKey::from(&self.0))
    }
}

impl fmt::Debug for ExchangeSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExchangeSecret(..)")
    }
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExchangePublicKey(PublicKey);

impl ExchangePublicKey {
    /// Decode a 32-byte Montgomery u-coordinate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(PublicKey::from(raw)))
    }

    /// Raw 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExchangePublicKey(")?;
        for byte in &self.0.as_bytes()[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// 256-bit symmetric key for AEAD encryption only.
///
/// There is intentionally no conversion from this type into a signing key.
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LENGTH]);

impl SymmetricKey {
    /// Wrap existing key material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; SYMMETRIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_LENGTH,
                actual: bytes.len(),
            })?;
        Ok(Self(raw))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LENGTH] {
        &self.0
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Domain-separation context for key derivation.
///
/// Encodes a protocol label and, optionally, the producer/subject pair the
/// key is scoped to. Every component is length-prefixed so distinct
/// components can never collide by concatenation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationContext {
    bytes: Vec<u8>,
}

impl DerivationContext {
    /// Context bound only to a protocol label (e.g. `"aegnix-v1"`).
    pub fn new(protocol: &str) -> Self {
        let mut bytes = Vec::with_capacity(4 + protocol.len());
        push_component(&mut bytes, protocol.as_bytes());
        Self { bytes }
    }

    /// Narrow the context to a single producer/subject pair.
    #[must_use]
    pub fn with_pair(mut self, producer: &str, subject: &str) -> Self {
        push_component(&mut self.bytes, producer.as_bytes());
        push_component(&mut self.bytes, subject.as_bytes());
        self
    }

    /// Encoded context bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn push_component(out: &mut Vec<u8>, component: &[u8]) {
    out.extend_from_slice(&(component.len() as u32).to_be_bytes());
    out.extend_from_slice(component);
}

/// Generate a fresh X25519 key pair.
///
/// Caller MUST provide a cryptographically secure RNG in production.
pub fn generate_exchange_keypair<R: RngCore + CryptoRng>(
    rng: &mut R,
) -> (ExchangeSecret, ExchangePublicKey) {
    let secret = StaticSecret::random_from_rng(rng);
    let public = PublicKey::from(&secret);
    (ExchangeSecret(secret), ExchangePublicKey(public))
}

/// Derive a symmetric key from an X25519 exchange.
///
/// # Security
///
/// - Symmetric: both parties derive the same key for the same context
/// - Context-bound: different contexts produce independent keys
/// - Rejects non-contributory results, which only occur for low-order peer
///   public keys
///
/// # Errors
///
/// - `NonContributory`: the remote public key is a low-order point
pub fn derive_shared_key(
    local: &ExchangeSecret,
    remote: &ExchangePublicKey,
    context: &DerivationContext,
) -> Result<SymmetricKey, CryptoError> {
    let shared = local.0.diffie_hellman(&remote.0);
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());

    // info = label || context
    let mut info = Vec::with_capacity(KDF_LABEL.len() + context.as_bytes().len());
    info.extend_from_slice(KDF_LABEL);
    info.extend_from_slice(context.as_bytes());

    let mut key = [0u8; SYMMETRIC_KEY_LENGTH];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    let derived = SymmetricKey(key);
    key.zeroize();
    Ok(derived)
}

//! Ed25519 signatures over canonical envelope bytes.
//!
//! Ed25519 is deterministic, so identical `(bytes, key)` inputs always yield
//! identical signatures. Verification is a pure predicate: it never partially
//! trusts an input and has no side effects.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Ed25519 signature size (64 bytes)
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 public key size (32 bytes)
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 secret key seed size (32 bytes)
pub const SECRET_KEY_LENGTH: usize = 32;

/// Ed25519 signing key. Zeroized on drop.
#[derive(Clone)]
pub struct SigningSecret(SigningKey);

impl SigningSecret {
    /// Restore a signing key from its 32-byte seed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let seed: &[u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: SECRET_KEY_LENGTH, actual: bytes.len() }
        })?;
        Ok(Self(SigningKey::from_bytes(seed)))
    }

    /// 32-byte seed, wrapped so the copy is zeroized when dropped.
    pub fn to_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_LENGTH]> {
        Zeroizing::new(self.0.to_bytes())
    }

    /// Public half of this key.
    pub fn public_key(&self) -> SigningPublicKey {
        SigningPublicKey(self.0.verifying_key())
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSecret").field("public", &self.public_key()).finish_non_exhaustive()
    }
}

/// Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SigningPublicKey(VerifyingKey);

impl SigningPublicKey {
    /// Decode a 32-byte compressed Edwards point.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyLength` if `bytes` is not 32 bytes long
    /// - `InvalidPublicKey` if the bytes are not a valid point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: &[u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: PUBLIC_KEY_LENGTH, actual: bytes.len() }
        })?;
        VerifyingKey::from_bytes(raw).map(Self).map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Raw 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey(")?;
        for byte in &self.0.as_bytes()[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Fixed-length Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Parse a signature, enforcing the fixed 64-byte length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidSignatureLength { expected: SIGNATURE_LENGTH, actual: bytes.len() }
        })?;
        Ok(Self(raw))
    }

    /// Raw signature bytes.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0
    }

    /// Borrow the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Generate a fresh Ed25519 key pair.
///
/// Caller MUST provide a cryptographically secure RNG in production.
pub fn generate_signing_keypair<R: RngCore + CryptoRng>(
    rng: &mut R,
) -> (SigningSecret, SigningPublicKey) {
    let signing_key = SigningKey::generate(rng);
    let public = SigningPublicKey(signing_key.verifying_key());
    (SigningSecret(signing_key), public)
}

/// Sign canonical bytes.
pub fn sign(canonical_bytes: &[u8], secret: &SigningSecret) -> Signature {
    Signature(secret.0.sign(canonical_bytes).to_bytes())
}

/// Verify a signature over canonical bytes.
///
/// Returns `false` for any failure; there is no partially-valid outcome.
pub fn verify(canonical_bytes: &[u8], signature: &Signature, public_key: &SigningPublicKey) -> bool {
    let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
    public_key.0.verify_strict(canonical_bytes, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn keypair(seed: u64) -> (SigningSecret, SigningPublicKey) {
        generate_signing_keypair(&mut ChaCha20Rng::seed_from_u64(seed))
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (secret, public) = keypair(1);
        let signature = sign(b"canonical bytes", &secret);

        assert!(verify(b"canonical bytes", &signature, &public));
    }

    #[test]
    fn signing_is_deterministic() {
        let (secret, _) = keypair(2);

        assert_eq!(sign(b"same input", &secret), sign(b"same input", &secret));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (secret, _) = keypair(3);
        let (_, other_public) = keypair(4);
        let signature = sign(b"message", &secret);

        assert!(!verify(b"message", &signature, &other_public));
    }

    #[test]
    fn modified_message_fails_verification() {
        let (secret, public) = keypair(5);
        let signature = sign(b"message", &secret);

        assert!(!verify(b"messagE", &signature, &public));
    }

    #[test]
    fn secret_restores_from_seed() {
        let (secret, public) = keypair(6);
        let restored = SigningSecret::from_bytes(secret.to_bytes().as_slice()).unwrap();

        assert_eq!(restored.public_key(), public);
        assert_eq!(sign(b"x", &restored), sign(b"x", &secret));
    }

    #[test]
    fn public_key_roundtrip() {
        let (_, public) = keypair(7);
        let decoded = SigningPublicKey::from_bytes(&public.to_bytes()).unwrap();

        assert_eq!(decoded, public);
    }

    #[test]
    fn public_key_wrong_length_rejected() {
        assert_eq!(
            SigningPublicKey::from_bytes(&[0u8; 31]),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 31 })
        );
    }

    #[test]
    fn signature_wrong_length_rejected() {
        assert_eq!(
            Signature::from_slice(&[0u8; 63]),
            Err(CryptoError::InvalidSignatureLength { expected: 64, actual: 63 })
        );
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let (secret, _) = keypair(8);
        let seed_hex = hex::encode(secret.to_bytes().as_slice());
        let rendered = format!("{secret:?}");

        assert!(!rendered.contains(&seed_hex[..16]));
    }
}

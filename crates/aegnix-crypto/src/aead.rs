//! Payload encryption using AES-256-GCM.
//!
//! The nonce is generated inside [`encrypt`] from the caller's CSPRNG on
//! every call. There is no API that accepts a caller-chosen nonce, so a
//! counter shared across processes can never be plugged in by accident.
//!
//! Associated data is authenticated but not encrypted. Binding envelope
//! metadata (producer, subject, key id) here means a ciphertext moved under
//! a different envelope fails to decrypt.

use aes_gcm::{
    Aes256Gcm, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use rand::{CryptoRng, RngCore};

use crate::{error::CryptoError, key_exchange::SymmetricKey};

/// Algorithm tag carried in sealed envelopes
pub const AEAD_ALGORITHM: &str = "AES-256-GCM";

/// AES-GCM nonce size (96 bits)
pub const AEAD_NONCE_LENGTH: usize = 12;

/// AES-GCM authentication tag size (128 bits)
pub const AEAD_TAG_LENGTH: usize = 16;

/// Ciphertext with the nonce and detached tag needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    /// Random 96-bit nonce used for this encryption
    pub nonce: [u8; AEAD_NONCE_LENGTH],
    /// Ciphertext (same length as the plaintext)
    pub ciphertext: Vec<u8>,
    /// 128-bit authentication tag
    pub tag: [u8; AEAD_TAG_LENGTH],
}

/// Encrypt `plaintext` under `key`, authenticating `associated_data`.
///
/// # Security
///
/// - Nonce is drawn fresh from `rng` for every call
/// - Caller MUST provide a cryptographically secure RNG in production
///
/// # Errors
///
/// - `EncryptionFailed`: plaintext exceeds the AES-GCM message limit
pub fn encrypt<R: RngCore + CryptoRng>(
    plaintext: &[u8],
    key: &SymmetricKey,
    associated_data: &[u8],
    rng: &mut R,
) -> Result<SealedBox, CryptoError> {
    let mut nonce = [0u8; AEAD_NONCE_LENGTH];
    rng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), associated_data, &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailed { len: plaintext.len() })?;

    let mut tag_bytes = [0u8; AEAD_TAG_LENGTH];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedBox { nonce, ciphertext: buffer, tag: tag_bytes })
}

/// Decrypt a [`SealedBox`].
///
/// # Errors
///
/// - `DecryptionFailed`: tag mismatch, wrong key or wrong associated data.
///   The three cases are indistinguishable and no plaintext is returned.
pub fn decrypt(
    sealed: &SealedBox,
    key: &SymmetricKey,
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut buffer = sealed.ciphertext.clone();

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            associated_data,
            &mut buffer,
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn test_key(fill: u8) -> SymmetricKey {
        SymmetricKey::from_bytes(&[fill; 32]).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key(0x11);
        let mut rng = ChaCha20Rng::seed_from_u64(1);

        let sealed = encrypt(b"Hello, World!", &key, b"aad", &mut rng).unwrap();
        let plaintext = decrypt(&sealed, &key, b"aad").unwrap();

        assert_eq!(plaintext, b"Hello, World!");
    }

    #[test]
    fn encrypt_decrypt_empty_message() {
        let key = test_key(0x22);
        let mut rng = ChaCha20Rng::seed_from_u64(2);

        let sealed = encrypt(b"", &key, b"", &mut rng).unwrap();

        assert!(sealed.ciphertext.is_empty());
        assert_eq!(decrypt(&sealed, &key, b"").unwrap(), b"");
    }

    #[test]
    fn ciphertext_length_matches_plaintext() {
        let key = test_key(0x33);
        let mut rng = ChaCha20Rng::seed_from_u64(3);

        let sealed = encrypt(b"test message", &key, b"", &mut rng).unwrap();

        assert_eq!(sealed.ciphertext.len(), b"test message".len());
    }

    #[test]
    fn nonces_differ_between_calls() {
        let key = test_key(0x44);
        let mut rng = ChaCha20Rng::seed_from_u64(4);

        let first = encrypt(b"same", &key, b"", &mut rng).unwrap();
        let second = encrypt(b"same", &key, b"", &mut rng).unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let sealed = encrypt(b"secret", &test_key(0x55), b"aad", &mut rng).unwrap();

        assert_eq!(decrypt(&sealed, &test_key(0x56), b"aad"), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn wrong_associated_data_fails_decryption() {
        let key = test_key(0x66);
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let sealed = encrypt(b"secret", &key, b"subject=a", &mut rng).unwrap();

        assert_eq!(decrypt(&sealed, &key, b"subject=b"), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let key = test_key(0x77);
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let mut sealed = encrypt(b"original message", &key, b"", &mut rng).unwrap();

        sealed.ciphertext[0] ^= 0x01;

        assert_eq!(decrypt(&sealed, &key, b""), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn tampered_tag_fails_decryption() {
        let key = test_key(0x88);
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let mut sealed = encrypt(b"original message", &key, b"", &mut rng).unwrap();

        sealed.tag[15] ^= 0x80;

        assert_eq!(decrypt(&sealed, &key, b""), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn tampered_nonce_fails_decryption() {
        let key = test_key(0x99);
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let mut sealed = encrypt(b"original message", &key, b"", &mut rng).unwrap();

        sealed.nonce[0] ^= 0x01;

        assert_eq!(decrypt(&sealed, &key, b""), Err(CryptoError::DecryptionFailed));
    }
}

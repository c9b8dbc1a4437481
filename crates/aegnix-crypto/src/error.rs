//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from signature, key agreement and AEAD operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Signature bytes have the wrong length
    #[error("invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength {
        /// Expected signature length
        expected: usize,
        /// Actual signature length
        actual: usize,
    },

    /// Public key bytes do not decode to a valid curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key agreement produced an all-zero shared secret (low-order peer key)
    #[error("key agreement produced a non-contributory shared secret")]
    NonContributory,

    /// Plaintext exceeds the AEAD message size limit
    #[error("encryption failed: plaintext of {len} bytes exceeds AEAD limit")]
    EncryptionFailed {
        /// Plaintext length
        len: usize,
    },

    /// Decryption failed.
    ///
    /// Deliberately carries no detail: a wrong key, wrong associated data and
    /// a tampered ciphertext or tag are indistinguishable to the caller.
    #[error("decryption failed")]
    DecryptionFailed,
}

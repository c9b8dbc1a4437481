//! AEGNIX Cryptographic Primitives
//!
//! Cryptographic building blocks for AEGNIX envelopes. Every function is pure
//! and synchronous: no shared mutable state, no I/O. Callers provide the
//! random number generator, which keeps tests deterministic and makes the
//! source of entropy explicit at every call site.
//!
//! # Primitives
//!
//! ```text
//! Canonical envelope bytes ──► Ed25519 sign / verify        (signature)
//!
//! X25519 private ─┐
//!                 ├─► ECDH ─► HKDF-SHA256(info = context) ─► SymmetricKey
//! X25519 public ──┘                                          (key_exchange)
//!
//! SymmetricKey + AAD + fresh 96-bit nonce ─► AES-256-GCM      (aead)
//! ```
//!
//! # Security
//!
//! Signatures:
//! - Ed25519 is deterministic: identical inputs always produce identical
//!   signatures
//! - Verification uses strict mode (rejects small-order keys and
//!   non-canonical signatures)
//!
//! Key agreement:
//! - `derive_shared_key(a, B, ctx) == derive_shared_key(b, A, ctx)`
//! - Non-contributory shared secrets (low-order peer keys) are rejected
//! - The derived [`SymmetricKey`] has no conversion into a signing key
//!
//! Encryption:
//! - Nonces are drawn from the caller's CSPRNG inside [`encrypt`]; callers can
//!   never pass a nonce, so nonce reuse cannot be expressed through this API
//! - Every decryption failure collapses into [`CryptoError::DecryptionFailed`]
//!
//! Key material is zeroized on drop.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
mod error;
pub mod key_exchange;
pub mod signature;

pub use aead::{AEAD_ALGORITHM, AEAD_NONCE_LENGTH, AEAD_TAG_LENGTH, SealedBox, decrypt, encrypt};
pub use error::CryptoError;
pub use key_exchange::{
    DerivationContext, ExchangePublicKey, ExchangeSecret, SYMMETRIC_KEY_LENGTH, SymmetricKey,
    derive_shared_key, generate_exchange_keypair,
};
pub use signature::{
    PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH, SIGNATURE_LENGTH, Signature, SigningPublicKey,
    SigningSecret, generate_signing_keypair, sign, verify,
};

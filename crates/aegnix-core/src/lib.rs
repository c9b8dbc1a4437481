//! AEGNIX Envelope Protocol
//!
//! Signed, replay-safe and optionally encrypted message envelopes exchanged
//! between autonomous peers and a coordinating bridge.
//!
//! # Architecture
//!
//! ```text
//! Producer                                   Consumer
//! ────────                                   ────────
//! build ─► Draft                             Envelope (from wire)
//! sign  ─► Signed ──┐                           │ keyring lookup (fail fast)
//! seal  ─► Encrypted┴─► WireEnvelope (CBOR) ─►  │ signature check
//!                                               │ ReplayGuard::check_and_mark
//!                                               ▼
//!                                        VerifiedEnvelope ─► open ─► AcceptedEnvelope
//! ```
//!
//! - [`canonical`]: deterministic encoding of structured payloads
//! - [`envelope`]: data model, signing layout, wire format
//! - [`replay`]: sliding-window replay guard over durable storage
//! - [`engine`]: orchestration and the audit trail
//! - [`keyring`] and [`capability`]: what the bridge knows about each agent
//! - [`storage`]: persistence capability plus in-memory and fault-injecting
//!   adapters
//!
//! Cryptographic primitives live in `aegnix-crypto`. All of them are
//! synchronous and run outside the replay lock; only storage calls block,
//! and those run under a deadline.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod audit;
pub mod canonical;
pub mod capability;
pub mod config;
pub mod engine;
pub mod env;
pub mod envelope;
pub mod error;
pub mod keyring;
pub mod replay;
pub mod storage;

pub use audit::{AuditLogEntry, AuditOutcome};
pub use canonical::{CanonicalError, Number, Value};
pub use capability::Capability;
pub use config::EngineConfig;
pub use engine::{AcceptedEnvelope, EnvelopeEngine, VerifiedEnvelope};
pub use env::{EnvRng, Environment, SimEnv};
pub use envelope::{
    DEFAULT_SENSITIVITY, Envelope, EnvelopeState, MAX_LABELS, NONCE_LENGTH, Payload,
    SCHEMA_VERSION, SealedPayload, WireBody, WireEnvelope,
};
pub use error::EnvelopeError;
pub use keyring::{KeyRecord, KeyStatus, fingerprint};
pub use replay::{ReplayDecision, ReplayGuard, ReplayKey};
pub use storage::{ChaoticStorage, MemoryStorage, Storage, StorageError};

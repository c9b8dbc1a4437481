//! Storage abstraction for the keyring, replay state and audit log.
//!
//! Trait-based abstraction over the persistence engine. The trait is
//! synchronous; the engine runs every call on the blocking pool under a
//! deadline (see [`call_with_timeout`]), so adapters are free to block.

mod chaotic;
mod error;
mod memory;

use std::time::Duration;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;

use crate::{
    audit::AuditLogEntry, capability::Capability, keyring::KeyRecord, replay::ReplayKey,
};

/// Storage abstraction for key records, seen nonces and audit entries
///
/// Must be Clone (shared between the engine and the replay guard), Send +
/// Sync (thread-safe), and synchronous (no async methods). Implementations
/// typically share internal state via Arc, so clones access the same
/// underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Insert or replace a key record.
    ///
    /// # Invariants
    ///
    /// - Pre: no revoked record exists for `(agent_id, key_id)`, otherwise
    ///   `Conflict` (revocation is permanent)
    /// - Post: at most one record per `(agent_id, key_id)`
    fn upsert_key(&self, record: &KeyRecord) -> Result<(), StorageError>;

    /// Key record for `(agent_id, key_id)`, revoked or not.
    fn get_key(&self, agent_id: &str, key_id: &str) -> Result<Option<KeyRecord>, StorageError>;

    /// Mark a key revoked from `at_millis` onwards.
    ///
    /// Revoking an already revoked key keeps the earlier revocation time.
    /// Returns `NotFound` if no record exists.
    fn revoke_key(&self, agent_id: &str, key_id: &str, at_millis: u64)
    -> Result<(), StorageError>;

    /// All key records, ordered by `(agent_id, key_id)`.
    fn list_keys(&self) -> Result<Vec<KeyRecord>, StorageError>;

    /// Key record whose public key has the given fingerprint.
    fn find_key_by_fingerprint(&self, fingerprint: &str)
    -> Result<Option<KeyRecord>, StorageError>;

    /// Durably record a replay key as seen.
    ///
    /// Returns `false` if the key was already present; the existing
    /// first-seen time is kept.
    fn persist_seen(&self, key: &ReplayKey, first_seen_millis: u64) -> Result<bool, StorageError>;

    /// Returns true if the replay key has been recorded.
    fn was_seen(&self, key: &ReplayKey) -> Result<bool, StorageError>;

    /// Remove replay keys first seen before `before_millis`.
    ///
    /// Returns the number of removed entries.
    fn prune_seen(&self, before_millis: u64) -> Result<usize, StorageError>;

    /// Append an audit entry. Entries are never modified or removed.
    fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError>;

    /// Insert or replace the capability declaration of `capability.agent_id`.
    fn upsert_capability(&self, capability: &Capability) -> Result<(), StorageError>;

    /// Capability declaration of `agent_id`, if any.
    fn get_capability(&self, agent_id: &str) -> Result<Option<Capability>, StorageError>;

    /// All capability declarations, ordered by agent id.
    fn list_capabilities(&self) -> Result<Vec<Capability>, StorageError>;
}

/// Run a storage call on the blocking pool with a deadline.
///
/// A call that misses the deadline keeps running in the background; its
/// result is discarded and the caller sees `Timeout`.
pub(crate) async fn call_with_timeout<S, T, F>(
    storage: &S,
    timeout: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, StorageError>
where
    S: Storage,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StorageError> + Send + 'static,
{
    let storage = storage.clone();
    let task = tokio::task::spawn_blocking(move || call(&storage));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(StorageError::Io(format!("{operation} task failed: {join_err}"))),
        Err(_) => Err(StorageError::Timeout { operation, timeout }),
    }
}

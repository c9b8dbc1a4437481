use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{Storage, StorageError};
use crate::{
    audit::AuditLogEntry, capability::Capability, keyring::KeyRecord, replay::ReplayKey,
};

/// In-memory storage implementation for testing and simulation
///
/// Keys live in a `BTreeMap` so listing is ordered; seen nonces in a
/// `HashMap`. All state is wrapped in `Arc<Mutex<>>` to allow Clone and
/// concurrent access. A poisoned lock surfaces as `StorageError::Io` from
/// trait methods.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Key records by `(agent_id, key_id)`
    keys: BTreeMap<(String, String), KeyRecord>,

    /// Replay keys and their first-seen time
    seen: HashMap<ReplayKey, u64>,

    /// Append-only audit log
    audit: Vec<AuditLogEntry>,

    /// Capability declarations by agent id
    capabilities: BTreeMap<String, Capability>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())) }
    }

    /// Snapshot of the audit log, in append order.
    ///
    /// Useful for debugging and testing.
    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).audit.clone()
    }

    /// Number of replay keys currently recorded.
    pub fn seen_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).seen.len()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStorageInner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Io("memory storage lock poisoned".to_string()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn upsert_key(&self, record: &KeyRecord) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let id = (record.agent_id.clone(), record.key_id.clone());

        if inner.keys.get(&id).is_some_and(|existing| existing.revoked_at_millis.is_some()) {
            return Err(StorageError::Conflict(format!(
                "key {}/{} is revoked",
                record.agent_id, record.key_id
            )));
        }

        inner.keys.insert(id, record.clone());
        Ok(())
    }

    fn get_key(&self, agent_id: &str, key_id: &str) -> Result<Option<KeyRecord>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.keys.get(&(agent_id.to_string(), key_id.to_string())).cloned())
    }

    fn revoke_key(
        &self,
        agent_id: &str,
        key_id: &str,
        at_millis: u64,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let record = inner.keys.get_mut(&(agent_id.to_string(), key_id.to_string())).ok_or_else(
            || StorageError::NotFound {
                agent_id: agent_id.to_string(),
                key_id: key_id.to_string(),
            },
        )?;

        record.revoked_at_millis.get_or_insert(at_millis);
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<KeyRecord>, StorageError> {
        Ok(self.lock()?.keys.values().cloned().collect())
    }

    fn find_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<KeyRecord>, StorageError> {
        let inner = self.lock()?;
        Ok(inner.keys.values().find(|record| record.fingerprint == fingerprint).cloned())
    }

    fn persist_seen(&self, key: &ReplayKey, first_seen_millis: u64) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        if inner.seen.contains_key(key) {
            return Ok(false);
        }
        inner.seen.insert(key.clone(), first_seen_millis);
        Ok(true)
    }

    fn was_seen(&self, key: &ReplayKey) -> Result<bool, StorageError> {
        Ok(self.lock()?.seen.contains_key(key))
    }

    fn prune_seen(&self, before_millis: u64) -> Result<usize, StorageError> {
        let mut inner = self.lock()?;
        let before = inner.seen.len();
        inner.seen.retain(|_, first_seen| *first_seen >= before_millis);
        Ok(before - inner.seen.len())
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError> {
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }

    fn upsert_capability(&self, capability: &Capability) -> Result<(), StorageError> {
        self.lock()?.capabilities.insert(capability.agent_id.clone(), capability.clone());
        Ok(())
    }

    fn get_capability(&self, agent_id: &str) -> Result<Option<Capability>, StorageError> {
        Ok(self.lock()?.capabilities.get(agent_id).cloned())
    }

    fn list_capabilities(&self) -> Result<Vec<Capability>, StorageError> {
        Ok(self.lock()?.capabilities.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use aegnix_crypto::generate_signing_keypair;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::audit::AuditOutcome;

    fn record(agent: &str, key: &str, seed: u64) -> KeyRecord {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let (_, public) = generate_signing_keypair(&mut rng);
        KeyRecord::new(agent, key, &public, 1_000)
    }

    fn replay_key(nonce: u8) -> ReplayKey {
        ReplayKey::new("fusion-ae", "k1", [nonce; 16])
    }

    #[test]
    fn test_get_missing_key() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_key("nobody", "k1").unwrap(), None);
    }

    #[test]
    fn test_upsert_and_get_key() {
        let storage = MemoryStorage::new();
        let rec = record("fusion-ae", "k1", 1);

        storage.upsert_key(&rec).unwrap();

        assert_eq!(storage.get_key("fusion-ae", "k1").unwrap(), Some(rec));
    }

    #[test]
    fn test_upsert_replaces_active_key() {
        let storage = MemoryStorage::new();
        storage.upsert_key(&record("fusion-ae", "k1", 1)).unwrap();
        let replacement = record("fusion-ae", "k1", 2);

        storage.upsert_key(&replacement).unwrap();

        assert_eq!(storage.list_keys().unwrap(), vec![replacement]);
    }

    #[test]
    fn test_upsert_revoked_key_conflicts() {
        let storage = MemoryStorage::new();
        storage.upsert_key(&record("fusion-ae", "k1", 1)).unwrap();
        storage.revoke_key("fusion-ae", "k1", 2_000).unwrap();

        let result = storage.upsert_key(&record("fusion-ae", "k1", 2));

        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[test]
    fn test_revoke_missing_key() {
        let storage = MemoryStorage::new();
        let result = storage.revoke_key("fusion-ae", "k1", 0);
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn test_revoke_keeps_first_time() {
        let storage = MemoryStorage::new();
        storage.upsert_key(&record("fusion-ae", "k1", 1)).unwrap();

        storage.revoke_key("fusion-ae", "k1", 2_000).unwrap();
        storage.revoke_key("fusion-ae", "k1", 9_000).unwrap();

        let rec = storage.get_key("fusion-ae", "k1").unwrap().unwrap();
        assert_eq!(rec.revoked_at_millis, Some(2_000));
    }

    #[test]
    fn test_list_keys_ordered() {
        let storage = MemoryStorage::new();
        storage.upsert_key(&record("b", "k1", 1)).unwrap();
        storage.upsert_key(&record("a", "k2", 2)).unwrap();
        storage.upsert_key(&record("a", "k1", 3)).unwrap();

        let ids: Vec<_> = storage
            .list_keys()
            .unwrap()
            .into_iter()
            .map(|r| format!("{}/{}", r.agent_id, r.key_id))
            .collect();

        assert_eq!(ids, ["a/k1", "a/k2", "b/k1"]);
    }

    #[test]
    fn test_find_by_fingerprint() {
        let storage = MemoryStorage::new();
        let rec = record("fusion-ae", "k1", 1);
        storage.upsert_key(&rec).unwrap();
        storage.upsert_key(&record("other", "k1", 2)).unwrap();

        assert_eq!(storage.find_key_by_fingerprint(&rec.fingerprint).unwrap(), Some(rec));
        assert_eq!(storage.find_key_by_fingerprint("00").unwrap(), None);
    }

    #[test]
    fn test_persist_seen_once() {
        let storage = MemoryStorage::new();
        let key = replay_key(1);

        assert!(!storage.was_seen(&key).unwrap());
        assert!(storage.persist_seen(&key, 10).unwrap());
        assert!(!storage.persist_seen(&key, 20).unwrap());
        assert!(storage.was_seen(&key).unwrap());
    }

    #[test]
    fn test_prune_seen() {
        let storage = MemoryStorage::new();
        storage.persist_seen(&replay_key(1), 10).unwrap();
        storage.persist_seen(&replay_key(2), 20).unwrap();
        storage.persist_seen(&replay_key(3), 30).unwrap();

        assert_eq!(storage.prune_seen(25).unwrap(), 2);
        assert_eq!(storage.seen_count(), 1);
        assert!(storage.was_seen(&replay_key(3)).unwrap());
    }

    #[test]
    fn test_capability_upsert_replaces() {
        let storage = MemoryStorage::new();
        storage.upsert_capability(&Capability::new("radar-ae").publishing("raw.radar")).unwrap();
        storage.upsert_capability(&Capability::new("fusion-ae").subscribing("raw.radar")).unwrap();
        let updated = Capability::new("radar-ae").publishing("raw.radar.v2");

        storage.upsert_capability(&updated).unwrap();

        assert_eq!(storage.get_capability("radar-ae").unwrap(), Some(updated));
        assert_eq!(storage.get_capability("nobody").unwrap(), None);
        let ids: Vec<_> =
            storage.list_capabilities().unwrap().into_iter().map(|c| c.agent_id).collect();
        assert_eq!(ids, ["fusion-ae", "radar-ae"]);
    }

    #[test]
    fn test_audit_append_order() {
        let storage = MemoryStorage::new();
        for (i, outcome) in [AuditOutcome::Accepted, AuditOutcome::Rejected {
            reason: "replay_detected".to_string(),
        }]
        .into_iter()
        .enumerate()
        {
            storage
                .append_audit(&AuditLogEntry {
                    envelope_id: format!("id-{i}"),
                    producer: "fusion-ae".to_string(),
                    subject: "fused.track".to_string(),
                    key_id: "k1".to_string(),
                    outcome,
                    recorded_at_millis: i as u64,
                })
                .unwrap();
        }

        let entries = storage.audit_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_accepted());
        assert!(!entries[1].is_accepted());
    }
}

//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Key
//! records, seen nonces, audit entries and capability declarations all
//! survive bridge restarts, so a restart never reopens a replay window.

use std::{path::Path, sync::Arc};

use aegnix_core::{AuditLogEntry, Capability, KeyRecord, ReplayKey, Storage, StorageError};
use redb::{Database, ReadableTable, TableDefinition};

/// Table: keys
/// Key: u32 len || agent_id || u32 len || key_id
/// Value: CBOR-encoded KeyRecord
const KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("keys");

/// Table: seen
/// Key: `ReplayKey::storage_key()`
/// Value: first-seen time (ms since epoch)
const SEEN: TableDefinition<&[u8], u64> = TableDefinition::new("seen");

/// Table: audit
/// Key: append sequence number
/// Value: CBOR-encoded AuditLogEntry
const AUDIT: TableDefinition<u64, &[u8]> = TableDefinition::new("audit");

/// Table: capabilities
/// Key: agent_id
/// Value: CBOR-encoded Capability
const CAPABILITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("capabilities");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (KEYS, SEEN, AUDIT, CAPABILITIES).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(KEYS).map_err(io)?;
            let _ = txn.open_table(SEEN).map_err(io)?;
            let _ = txn.open_table(AUDIT).map_err(io)?;
            let _ = txn.open_table(CAPABILITIES).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Number of audit entries written so far.
    pub fn audit_len(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(AUDIT).map_err(io)?;

        Ok(table.last().map_err(io)?.map_or(0, |(seq, _)| seq.value() + 1))
    }

    /// Audit entries in append order.
    pub fn audit_entries(&self) -> Result<Vec<AuditLogEntry>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(AUDIT).map_err(io)?;

        let mut entries = Vec::new();
        for result in table.iter().map_err(io)? {
            let (_, value) = result.map_err(io)?;
            entries.push(ciborium::from_reader(value.value())?);
        }
        Ok(entries)
    }
}

impl Storage for RedbStorage {
    fn upsert_key(&self, record: &KeyRecord) -> Result<(), StorageError> {
        let key = encode_key_id(&record.agent_id, &record.key_id);
        let mut bytes = Vec::new();
        ciborium::into_writer(record, &mut bytes)?;

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(KEYS).map_err(io)?;

            if let Some(existing) = table.get(key.as_slice()).map_err(io)? {
                let existing: KeyRecord = ciborium::from_reader(existing.value())?;
                if existing.revoked_at_millis.is_some() {
                    return Err(StorageError::Conflict(format!(
                        "key {}/{} is revoked",
                        record.agent_id, record.key_id
                    )));
                }
            }

            table.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn get_key(&self, agent_id: &str, key_id: &str) -> Result<Option<KeyRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(KEYS).map_err(io)?;

        let key = encode_key_id(agent_id, key_id);
        match table.get(key.as_slice()).map_err(io)? {
            Some(value) => Ok(Some(ciborium::from_reader(value.value())?)),
            None => Ok(None),
        }
    }

    fn revoke_key(
        &self,
        agent_id: &str,
        key_id: &str,
        at_millis: u64,
    ) -> Result<(), StorageError> {
        let key = encode_key_id(agent_id, key_id);

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(KEYS).map_err(io)?;

            let mut record: KeyRecord = match table.get(key.as_slice()).map_err(io)? {
                Some(value) => ciborium::from_reader(value.value())?,
                None => {
                    return Err(StorageError::NotFound {
                        agent_id: agent_id.to_string(),
                        key_id: key_id.to_string(),
                    });
                },
            };
            record.revoked_at_millis.get_or_insert(at_millis);

            let mut bytes = Vec::new();
            ciborium::into_writer(&record, &mut bytes)?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<KeyRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(KEYS).map_err(io)?;

        let mut records: Vec<KeyRecord> = Vec::new();
        for result in table.iter().map_err(io)? {
            let (_, value) = result.map_err(io)?;
            records.push(ciborium::from_reader(value.value())?);
        }

        // Length-prefixed keys do not sort by (agent, key id)
        records.sort_by(|a, b| (&a.agent_id, &a.key_id).cmp(&(&b.agent_id, &b.key_id)));
        Ok(records)
    }

    fn find_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<KeyRecord>, StorageError> {
        Ok(self.list_keys()?.into_iter().find(|record| record.fingerprint == fingerprint))
    }

    fn persist_seen(&self, key: &ReplayKey, first_seen_millis: u64) -> Result<bool, StorageError> {
        let key = key.storage_key();

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(SEEN).map_err(io)?;

            if table.get(key.as_slice()).map_err(io)?.is_some() {
                return Ok(false); // Already marked; abort the transaction
            }
            table.insert(key.as_slice(), first_seen_millis).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(true)
    }

    fn was_seen(&self, key: &ReplayKey) -> Result<bool, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(SEEN).map_err(io)?;

        Ok(table.get(key.storage_key().as_slice()).map_err(io)?.is_some())
    }

    fn prune_seen(&self, before_millis: u64) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let pruned = {
            let mut table = txn.open_table(SEEN).map_err(io)?;

            let mut expired = Vec::new();
            for result in table.iter().map_err(io)? {
                let (key, first_seen) = result.map_err(io)?;
                if first_seen.value() < before_millis {
                    expired.push(key.value().to_vec());
                }
            }

            for key in &expired {
                table.remove(key.as_slice()).map_err(io)?;
            }
            expired.len()
        };
        txn.commit().map_err(io)?;

        Ok(pruned)
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(entry, &mut bytes)?;

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(AUDIT).map_err(io)?;

            let next = table.last().map_err(io)?.map_or(0, |(seq, _)| seq.value() + 1);
            table.insert(next, bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn upsert_capability(&self, capability: &Capability) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(capability, &mut bytes)?;

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(CAPABILITIES).map_err(io)?;
            table.insert(capability.agent_id.as_str(), bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn get_capability(&self, agent_id: &str) -> Result<Option<Capability>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(CAPABILITIES).map_err(io)?;

        match table.get(agent_id).map_err(io)? {
            Some(value) => Ok(Some(ciborium::from_reader(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_capabilities(&self) -> Result<Vec<Capability>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(CAPABILITIES).map_err(io)?;

        let mut capabilities = Vec::new();
        for result in table.iter().map_err(io)? {
            let (_, value) = result.map_err(io)?;
            capabilities.push(ciborium::from_reader(value.value())?);
        }
        Ok(capabilities)
    }
}

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Encode `(agent_id, key_id)` as a table key.
///
/// Format: [u32 BE len][agent_id][u32 BE len][key_id]
fn encode_key_id(agent_id: &str, key_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + agent_id.len() + key_id.len());
    for part in [agent_id, key_id] {
        key.extend_from_slice(&(part.len() as u32).to_be_bytes());
        key.extend_from_slice(part.as_bytes());
    }
    key
}

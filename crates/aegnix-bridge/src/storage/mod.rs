//! Storage backends selectable at bridge startup.
//!
//! [`BridgeStorage`] wraps every backend the bridge can run against behind
//! one concrete type so the engine is instantiated once, whatever the
//! configured provider.

mod redb;

use aegnix_core::{
    AuditLogEntry, Capability, KeyRecord, MemoryStorage, ReplayKey, Storage, StorageError,
};
use clap::ValueEnum;

pub use self::redb::RedbStorage;

/// Storage provider named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageProvider {
    /// Process-local maps; state is lost on exit
    Memory,
    /// Redb file at the configured path
    Redb,
}

/// Storage backend chosen by [`StorageProvider`].
#[derive(Clone)]
pub enum BridgeStorage {
    /// In-memory backend
    Memory(MemoryStorage),
    /// Durable Redb backend
    Redb(RedbStorage),
}

impl BridgeStorage {
    /// Provider this backend was opened for.
    pub fn provider(&self) -> StorageProvider {
        match self {
            Self::Memory(_) => StorageProvider::Memory,
            Self::Redb(_) => StorageProvider::Redb,
        }
    }
}

macro_rules! delegate {
    ($self:ident, $storage:ident => $call:expr) => {
        match $self {
            BridgeStorage::Memory($storage) => $call,
            BridgeStorage::Redb($storage) => $call,
        }
    };
}

impl Storage for BridgeStorage {
    fn upsert_key(&self, record: &KeyRecord) -> Result<(), StorageError> {
        delegate!(self, s => s.upsert_key(record))
    }

    fn get_key(&self, agent_id: &str, key_id: &str) -> Result<Option<KeyRecord>, StorageError> {
        delegate!(self, s => s.get_key(agent_id, key_id))
    }

    fn revoke_key(
        &self,
        agent_id: &str,
        key_id: &str,
        at_millis: u64,
    ) -> Result<(), StorageError> {
        delegate!(self, s => s.revoke_key(agent_id, key_id, at_millis))
    }

    fn list_keys(&self) -> Result<Vec<KeyRecord>, StorageError> {
        delegate!(self, s => s.list_keys())
    }

    fn find_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<KeyRecord>, StorageError> {
        delegate!(self, s => s.find_key_by_fingerprint(fingerprint))
    }

    fn persist_seen(&self, key: &ReplayKey, first_seen_millis: u64) -> Result<bool, StorageError> {
        delegate!(self, s => s.persist_seen(key, first_seen_millis))
    }

    fn was_seen(&self, key: &ReplayKey) -> Result<bool, StorageError> {
        delegate!(self, s => s.was_seen(key))
    }

    fn prune_seen(&self, before_millis: u64) -> Result<usize, StorageError> {
        delegate!(self, s => s.prune_seen(before_millis))
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError> {
        delegate!(self, s => s.append_audit(entry))
    }

    fn upsert_capability(&self, capability: &Capability) -> Result<(), StorageError> {
        delegate!(self, s => s.upsert_capability(capability))
    }

    fn get_capability(&self, agent_id: &str) -> Result<Option<Capability>, StorageError> {
        delegate!(self, s => s.get_capability(agent_id))
    }

    fn list_capabilities(&self) -> Result<Vec<Capability>, StorageError> {
        delegate!(self, s => s.list_capabilities())
    }
}

#[cfg(test)]
mod tests {
    use aegnix_core::{EnvRng, KeyRecord};
    use aegnix_crypto::generate_signing_keypair;

    use super::*;
    use crate::system_env::SystemEnv;

    #[test]
    fn memory_backend_delegates() {
        let storage = BridgeStorage::Memory(MemoryStorage::new());
        let (_, public) = generate_signing_keypair(&mut EnvRng::new(&SystemEnv));
        let record = KeyRecord::new("fusion-ae", "k1", &public, 0);

        storage.upsert_key(&record).unwrap();

        assert_eq!(storage.provider(), StorageProvider::Memory);
        assert_eq!(storage.list_keys().unwrap(), vec![record]);
    }
}

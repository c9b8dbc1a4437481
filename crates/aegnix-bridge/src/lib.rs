//! AEGNIX bridge.
//!
//! Production glue around [`aegnix_core`]: the system clock and OS RNG, a
//! durable Redb store, and the configuration used by the `aegnix` binary.
//!
//! # Components
//!
//! - [`SystemEnv`]: Production environment (real time, crypto RNG)
//! - [`RedbStorage`]: Durable keyring, replay log and audit log
//! - [`BridgeStorage`]: Backend selected by [`StorageProvider`]
//! - [`BridgeConfig`]: Flags with environment fallbacks

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
mod error;
pub mod keys;
pub mod storage;
mod system_env;

use aegnix_core::{AcceptedEnvelope, EnvelopeEngine, MemoryStorage, Payload};
pub use config::BridgeConfig;
pub use error::BridgeError;
use serde_json::json;
pub use storage::{BridgeStorage, RedbStorage, StorageProvider};
pub use system_env::SystemEnv;
use tracing::info;

/// Engine as instantiated by the bridge.
pub type BridgeEngine = EnvelopeEngine<SystemEnv, BridgeStorage>;

/// Open the configured storage backend.
///
/// Creates the parent directory of the Redb file if needed.
///
/// # Errors
///
/// - `Io`: the parent directory cannot be created
/// - `Storage`: the database cannot be opened
pub fn open_storage(config: &BridgeConfig) -> Result<BridgeStorage, BridgeError> {
    match config.storage_provider {
        StorageProvider::Memory => {
            info!("using in-memory storage; state is lost on exit");
            Ok(BridgeStorage::Memory(MemoryStorage::new()))
        },
        StorageProvider::Redb => {
            if let Some(parent) = config.db_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            info!(path = %config.db_path.display(), "opening redb storage");
            Ok(BridgeStorage::Redb(RedbStorage::open(&config.db_path)?))
        },
    }
}

/// Build an engine over the configured backend.
///
/// # Errors
///
/// See [`open_storage`].
pub fn open_engine(config: &BridgeConfig) -> Result<BridgeEngine, BridgeError> {
    let storage = open_storage(config)?;
    Ok(EnvelopeEngine::new(SystemEnv::new(), storage, config.engine_config()))
}

/// JSON report for an accepted envelope.
///
/// # Errors
///
/// - `Envelope`: the envelope id cannot be computed
pub fn accepted_report(accepted: &AcceptedEnvelope) -> Result<serde_json::Value, BridgeError> {
    let envelope = accepted.envelope();

    Ok(json!({
        "envelope_id": envelope.envelope_id()?,
        "producer": envelope.producer(),
        "subject": envelope.subject(),
        "key_id": envelope.key_id(),
        "corr_id": envelope.corr_id(),
        "sensitivity": envelope.sensitivity(),
        "labels": envelope.labels(),
        "timestamp_millis": envelope.timestamp_millis(),
        "sealed": matches!(envelope.payload(), Payload::Sealed(_)),
        "payload": serde_json::Value::from(accepted.payload()),
    }))
}

//! Bridge configuration.
//!
//! Every setting is a command-line flag with an environment variable
//! fallback, so the same binary runs from a shell or a container manifest.

use std::{path::PathBuf, time::Duration};

use aegnix_core::{EngineConfig, config::DEFAULT_MAX_CACHED_NONCES};
use clap::Args;

use crate::storage::StorageProvider;

/// Default path of the Redb state file
pub const DEFAULT_DB_PATH: &str = "db/aegnix_state.redb";

/// Storage and replay settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct BridgeConfig {
    /// Storage backend
    #[arg(long, env = "AEGNIX_STORAGE_PROVIDER", value_enum, default_value = "redb")]
    pub storage_provider: StorageProvider,

    /// Path of the Redb state file
    #[arg(long, env = "AEGNIX_DB_PATH", default_value = DEFAULT_DB_PATH)]
    pub db_path: PathBuf,

    /// Replay window in seconds
    #[arg(long, env = "AEGNIX_REPLAY_WINDOW_SECS", default_value_t = 300)]
    pub replay_window_secs: u64,

    /// Tolerated clock skew in seconds
    #[arg(long, env = "AEGNIX_MAX_CLOCK_SKEW_SECS", default_value_t = 30)]
    pub max_clock_skew_secs: u64,

    /// Deadline for each storage call in milliseconds
    #[arg(long, env = "AEGNIX_STORAGE_TIMEOUT_MS", default_value_t = 2_000)]
    pub storage_timeout_ms: u64,

    /// Replay keys kept in memory
    #[arg(long, env = "AEGNIX_MAX_CACHED_NONCES", default_value_t = DEFAULT_MAX_CACHED_NONCES)]
    pub max_cached_nonces: usize,
}

impl BridgeConfig {
    /// Engine settings derived from the flags.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            replay_window: Duration::from_secs(self.replay_window_secs),
            max_clock_skew: Duration::from_secs(self.max_clock_skew_secs),
            storage_timeout: Duration::from_millis(self.storage_timeout_ms),
            max_cached_nonces: self.max_cached_nonces,
            ..EngineConfig::default()
        }
    }
}

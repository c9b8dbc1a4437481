//! Engine configuration.

use std::time::Duration;

/// Default replay window: envelopes older than this are rejected as stale
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default tolerance for envelope timestamps ahead of the local clock
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Default deadline for a single storage call
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on replay keys held in memory
pub const DEFAULT_MAX_CACHED_NONCES: usize = 100_000;

/// Default protocol label mixed into key derivation
pub const DEFAULT_KDF_PROTOCOL: &str = "aegnix-v1";

/// Tunables for the envelope engine and replay guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Accept envelopes whose timestamp is at most this old
    pub replay_window: Duration,
    /// Accept envelopes whose timestamp is at most this far in the future
    pub max_clock_skew: Duration,
    /// Deadline for each storage call
    pub storage_timeout: Duration,
    /// Replay keys kept in the in-memory cache. The durable store stays
    /// authoritative when entries are dropped.
    pub max_cached_nonces: usize,
    /// Protocol label for [`aegnix_crypto::DerivationContext`]
    pub kdf_protocol: String,
}

impl EngineConfig {
    /// Replay keys first seen before `now - retention` can no longer match
    /// an envelope that passes the window check.
    pub fn retention_millis(&self) -> u64 {
        (self.replay_window + self.max_clock_skew).as_millis() as u64
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replay_window: DEFAULT_REPLAY_WINDOW,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            max_cached_nonces: DEFAULT_MAX_CACHED_NONCES,
            kdf_protocol: DEFAULT_KDF_PROTOCOL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_covers_window_and_skew() {
        let config = EngineConfig::default();
        assert_eq!(config.retention_millis(), 330_000);
    }
}

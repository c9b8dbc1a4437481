//! Replay protection over a sliding time window.
//!
//! A replay key is the triple (producer, key id, nonce). The guard accepts
//! each key at most once:
//!
//! - Envelopes whose timestamp falls outside `[now - window, now + skew]` are
//!   rejected before any lookup, so only keys seen within the retention
//!   horizon (`window + skew`) ever need to be remembered.
//! - Check-and-mark runs under one async mutex per guard. The durable write
//!   completes before the guard reports `Accepted`, so a crash cannot reopen
//!   the window.
//! - The in-memory cache is a bounded fast path. The durable store is
//!   authoritative: a cache miss always consults it.
//! - Durable entries past the retention horizon are pruned at most once per
//!   retention period, piggybacked on an accepted mark. A failed prune is
//!   logged and retried next period; it never rejects the envelope.
//!
//! Storage failures and timeouts surface as `StorageUnavailable`, never as
//! acceptance.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    config::EngineConfig,
    envelope::NONCE_LENGTH,
    error::EnvelopeError,
    storage::{Storage, call_with_timeout},
};

/// Identity of a message for replay purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayKey {
    /// Envelope producer
    pub producer: String,
    /// Signing key identifier
    pub key_id: String,
    /// Envelope nonce
    pub nonce: [u8; NONCE_LENGTH],
}

impl ReplayKey {
    /// Create a replay key.
    pub fn new(
        producer: impl Into<String>,
        key_id: impl Into<String>,
        nonce: [u8; NONCE_LENGTH],
    ) -> Self {
        Self { producer: producer.into(), key_id: key_id.into(), nonce }
    }

    /// Unambiguous byte encoding, usable as a database key.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.producer.len() + self.key_id.len() + NONCE_LENGTH);
        for part in [self.producer.as_bytes(), self.key_id.as_bytes()] {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
        out.extend_from_slice(&self.nonce);
        out
    }
}

/// Outcome of [`ReplayGuard::check_and_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDecision {
    /// First sighting; the key is now durably marked
    Accepted,
    /// Key was already marked
    Duplicate,
}

/// Sliding-window replay guard backed by durable storage.
///
/// Owned by the caller and passed by reference into verification, so tests
/// and tenants can run isolated guards side by side.
pub struct ReplayGuard<S: Storage> {
    storage: S,
    window_millis: u64,
    skew_millis: u64,
    retention_millis: u64,
    storage_timeout: Duration,
    max_cached: usize,
    cache: Mutex<SeenCache>,
}

#[derive(Default)]
struct SeenCache {
    /// Key to first-seen time
    seen: HashMap<ReplayKey, u64>,
    /// Insertion order, for eviction
    order: VecDeque<(u64, ReplayKey)>,
    /// Horizon of the last durable prune
    pruned_to: u64,
}

impl SeenCache {
    fn insert(&mut self, key: ReplayKey, first_seen: u64, max: usize) {
        if self.seen.insert(key.clone(), first_seen).is_none() {
            self.order.push_back((first_seen, key));
        }
        while self.seen.len() > max {
            let Some((_, oldest)) = self.order.pop_front() else { break };
            self.seen.remove(&oldest);
        }
    }

    fn evict_before(&mut self, horizon: u64) -> usize {
        let mut evicted = 0;
        while self.order.front().is_some_and(|(first_seen, _)| *first_seen < horizon) {
            let Some((first_seen, key)) = self.order.pop_front() else { break };
            if self.seen.get(&key) == Some(&first_seen) {
                self.seen.remove(&key);
                evicted += 1;
            }
        }
        evicted
    }
}

impl<S: Storage> ReplayGuard<S> {
    /// Create a guard over `storage` with the window and timeouts from
    /// `config`. Durable state from earlier runs is honored immediately.
    pub fn new(storage: S, config: &EngineConfig) -> Self {
        Self {
            storage,
            window_millis: config.replay_window.as_millis() as u64,
            skew_millis: config.max_clock_skew.as_millis() as u64,
            retention_millis: config.retention_millis(),
            storage_timeout: config.storage_timeout,
            max_cached: config.max_cached_nonces.max(1),
            cache: Mutex::new(SeenCache::default()),
        }
    }

    /// Atomically check whether `key` was seen and mark it if not.
    ///
    /// Exactly one of any number of concurrent calls with the same key
    /// observes `Accepted`.
    ///
    /// # Errors
    ///
    /// - `StaleEnvelope`: `timestamp_millis` is older than the window
    /// - `ClockSkew`: `timestamp_millis` is too far ahead of `now_millis`
    /// - `StorageUnavailable`: the durable store failed or timed out; the key
    ///   is not marked in memory
    pub async fn check_and_mark(
        &self,
        key: &ReplayKey,
        timestamp_millis: u64,
        now_millis: u64,
    ) -> Result<ReplayDecision, EnvelopeError> {
        self.check_window(timestamp_millis, now_millis)?;

        let mut cache = self.cache.lock().await;
        cache.evict_before(now_millis.saturating_sub(self.retention_millis));

        if cache.seen.contains_key(key) {
            debug!(producer = %key.producer, key_id = %key.key_id, "replay: duplicate (cached)");
            return Ok(ReplayDecision::Duplicate);
        }

        let lookup = key.clone();
        let seen = call_with_timeout(&self.storage, self.storage_timeout, "was_seen", move |s| {
            s.was_seen(&lookup)
        })
        .await
        .inspect_err(|e| warn!(error = %e, "replay: durable lookup failed"))?;

        if seen {
            debug!(producer = %key.producer, key_id = %key.key_id, "replay: duplicate (durable)");
            cache.insert(key.clone(), now_millis, self.max_cached);
            return Ok(ReplayDecision::Duplicate);
        }

        let mark = key.clone();
        let inserted =
            call_with_timeout(&self.storage, self.storage_timeout, "persist_seen", move |s| {
                s.persist_seen(&mark, now_millis)
            })
            .await
            .inspect_err(|e| warn!(error = %e, "replay: durable mark failed"))?;

        cache.insert(key.clone(), now_millis, self.max_cached);

        if inserted {
            let horizon = now_millis.saturating_sub(self.retention_millis);
            if horizon >= cache.pruned_to.saturating_add(self.retention_millis) {
                cache.pruned_to = horizon;
                match self.prune_durable(horizon).await {
                    Ok(pruned) => debug!(pruned, horizon, "replay: periodic prune"),
                    Err(e) => warn!(error = %e, horizon, "replay: periodic prune failed"),
                }
            }
            Ok(ReplayDecision::Accepted)
        } else {
            // Another process sharing the store marked it first
            Ok(ReplayDecision::Duplicate)
        }
    }

    /// Drop replay keys older than the retention horizon, in memory and in
    /// the durable store. Returns the number of durable entries removed.
    pub async fn prune_expired(&self, now_millis: u64) -> Result<usize, EnvelopeError> {
        let horizon = now_millis.saturating_sub(self.retention_millis);

        let mut cache = self.cache.lock().await;
        let evicted = cache.evict_before(horizon);

        let pruned = self.prune_durable(horizon).await?;
        cache.pruned_to = cache.pruned_to.max(horizon);

        debug!(evicted, pruned, horizon, "replay: pruned expired keys");
        Ok(pruned)
    }

    async fn prune_durable(&self, horizon: u64) -> Result<usize, EnvelopeError> {
        Ok(call_with_timeout(&self.storage, self.storage_timeout, "prune_seen", move |s| {
            s.prune_seen(horizon)
        })
        .await?)
    }

    /// Number of replay keys in the in-memory cache.
    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.seen.len()
    }

    fn check_window(&self, timestamp_millis: u64, now_millis: u64) -> Result<(), EnvelopeError> {
        let window_start_millis = now_millis.saturating_sub(self.window_millis);
        if timestamp_millis < window_start_millis {
            return Err(EnvelopeError::StaleEnvelope { timestamp_millis, window_start_millis });
        }

        let limit_millis = now_millis.saturating_add(self.skew_millis);
        if timestamp_millis > limit_millis {
            return Err(EnvelopeError::ClockSkew { timestamp_millis, limit_millis });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChaoticStorage, MemoryStorage};

    const NOW: u64 = 1_700_000_000_000;

    fn key(nonce: u8) -> ReplayKey {
        ReplayKey::new("fusion-ae", "fusion-ed25519-1", [nonce; NONCE_LENGTH])
    }

    fn guard<S: Storage>(storage: S) -> ReplayGuard<S> {
        ReplayGuard::new(storage, &EngineConfig::default())
    }

    #[tokio::test]
    async fn first_accepted_then_duplicate() {
        let guard = guard(MemoryStorage::new());

        assert_eq!(guard.check_and_mark(&key(1), NOW, NOW).await, Ok(ReplayDecision::Accepted));
        assert_eq!(guard.check_and_mark(&key(1), NOW, NOW).await, Ok(ReplayDecision::Duplicate));
        assert_eq!(guard.check_and_mark(&key(2), NOW, NOW).await, Ok(ReplayDecision::Accepted));
    }

    #[tokio::test]
    async fn distinct_producers_do_not_collide() {
        let guard = guard(MemoryStorage::new());
        let other = ReplayKey::new("other-ae", "fusion-ed25519-1", [1; NONCE_LENGTH]);

        guard.check_and_mark(&key(1), NOW, NOW).await.unwrap();

        assert_eq!(guard.check_and_mark(&other, NOW, NOW).await, Ok(ReplayDecision::Accepted));
    }

    #[tokio::test]
    async fn stale_timestamp_rejected() {
        let guard = guard(MemoryStorage::new());
        let old = NOW - 5 * 60 * 1000 - 1;

        let result = guard.check_and_mark(&key(1), old, NOW).await;

        assert!(matches!(result, Err(EnvelopeError::StaleEnvelope { .. })));
    }

    #[tokio::test]
    async fn future_timestamp_rejected() {
        let guard = guard(MemoryStorage::new());

        let result = guard.check_and_mark(&key(1), NOW + 30_001, NOW).await;

        assert!(matches!(result, Err(EnvelopeError::ClockSkew { .. })));
    }

    #[tokio::test]
    async fn window_edges_accepted() {
        let guard = guard(MemoryStorage::new());

        assert!(guard.check_and_mark(&key(1), NOW - 5 * 60 * 1000, NOW).await.is_ok());
        assert!(guard.check_and_mark(&key(2), NOW + 30_000, NOW).await.is_ok());
    }

    #[tokio::test]
    async fn restart_keeps_durable_state() {
        let storage = MemoryStorage::new();
        guard(storage.clone()).check_and_mark(&key(1), NOW, NOW).await.unwrap();

        let restarted = guard(storage);

        assert_eq!(
            restarted.check_and_mark(&key(1), NOW, NOW + 1).await,
            Ok(ReplayDecision::Duplicate)
        );
    }

    #[tokio::test]
    async fn cache_bound_falls_back_to_store() {
        let config = EngineConfig { max_cached_nonces: 2, ..EngineConfig::default() };
        let guard = ReplayGuard::new(MemoryStorage::new(), &config);

        for nonce in 0..5 {
            guard.check_and_mark(&key(nonce), NOW, NOW).await.unwrap();
        }

        assert_eq!(guard.cached_len().await, 2);
        assert_eq!(guard.check_and_mark(&key(0), NOW, NOW).await, Ok(ReplayDecision::Duplicate));
    }

    #[tokio::test]
    async fn storage_failure_is_not_acceptance() {
        let guard = guard(ChaoticStorage::new(MemoryStorage::new(), 1.0));

        let result = guard.check_and_mark(&key(1), NOW, NOW).await;

        assert!(matches!(result, Err(EnvelopeError::StorageUnavailable { .. })));
        assert_eq!(guard.cached_len().await, 0);
    }

    #[tokio::test]
    async fn storage_timeout_is_not_acceptance() {
        let config =
            EngineConfig { storage_timeout: Duration::from_millis(10), ..EngineConfig::default() };
        let storage =
            ChaoticStorage::new(MemoryStorage::new(), 0.0).with_latency(Duration::from_millis(200));
        let guard = ReplayGuard::new(storage, &config);

        let result = guard.check_and_mark(&key(1), NOW, NOW).await;

        assert!(matches!(result, Err(EnvelopeError::StorageUnavailable { .. })));
    }

    #[tokio::test]
    async fn prune_removes_expired_entries() {
        let storage = MemoryStorage::new();
        let guard = guard(storage.clone());
        guard.check_and_mark(&key(1), NOW, NOW).await.unwrap();
        guard.check_and_mark(&key(2), NOW + 60_000, NOW + 60_000).await.unwrap();

        let later = NOW + 330_001;
        let pruned = guard.prune_expired(later).await.unwrap();

        assert_eq!(pruned, 1);
        assert_eq!(storage.seen_count(), 1);
        assert_eq!(guard.cached_len().await, 1);
    }

    #[tokio::test]
    async fn accepted_marks_prune_durable_state_periodically() {
        let storage = MemoryStorage::new();
        let guard = guard(storage.clone());
        let hour = 60 * 60 * 1000;

        for i in 0..50u8 {
            let now = NOW + u64::from(i) * hour;
            guard.check_and_mark(&key(i), now, now).await.unwrap();
        }

        // Each mark is an hour past the last, beyond the retention horizon
        assert!(storage.seen_count() <= 2, "kept {} entries", storage.seen_count());
        assert!(storage.was_seen(&key(49)).unwrap());
    }

    #[tokio::test]
    async fn periodic_prune_keeps_entries_inside_retention() {
        let storage = MemoryStorage::new();
        let guard = guard(storage.clone());

        for i in 0..20u8 {
            let now = NOW + u64::from(i) * 1_000;
            guard.check_and_mark(&key(i), now, now).await.unwrap();
        }

        assert_eq!(storage.seen_count(), 20);
    }

    #[tokio::test]
    async fn failed_periodic_prune_does_not_reject() {
        let storage =
            ChaoticStorage::new(MemoryStorage::new(), 0.0).with_failing_operation("prune_seen");
        let guard = guard(storage.clone());
        let later = NOW + 2 * EngineConfig::default().retention_millis();

        assert_eq!(guard.check_and_mark(&key(1), NOW, NOW).await, Ok(ReplayDecision::Accepted));
        assert_eq!(
            guard.check_and_mark(&key(2), later, later).await,
            Ok(ReplayDecision::Accepted)
        );
        assert!(storage.inner().was_seen(&key(1)).unwrap());
    }

    #[test]
    fn storage_key_is_unambiguous() {
        let a = ReplayKey::new("ab", "c", [0; NONCE_LENGTH]);
        let b = ReplayKey::new("a", "bc", [0; NONCE_LENGTH]);

        assert_ne!(a.storage_key(), b.storage_key());
    }
}

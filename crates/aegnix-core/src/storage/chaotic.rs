//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails or delays operations to test that
//! storage failures and timeouts always surface as rejections, never as
//! accepted envelopes.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use super::{Storage, StorageError};
use crate::{
    audit::AuditLogEntry, capability::Capability, keyring::KeyRecord, replay::ReplayKey,
};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but randomly fails
/// operations based on a configured failure rate, and optionally sleeps
/// before every call. Clones share the RNG and the operation counter.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// Delay applied before every operation
    latency: Option<Duration>,
    /// Operation that always fails, regardless of the rate
    always_failing: Option<&'static str>,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operations attempted, including injected failures
    operation_count: Arc<AtomicUsize>,
}

/// Linear congruential generator, reproducible for a given seed
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    #[allow(clippy::panic, reason = "test-only constructor argument check")]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        if !(0.0..=1.0).contains(&failure_rate) {
            panic!("failure_rate must be between 0.0 and 1.0, got {failure_rate}");
        }

        Self {
            inner,
            failure_rate,
            latency: None,
            always_failing: None,
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep for `latency` before every operation.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Always fail `operation` (a `Storage` method name).
    #[must_use]
    pub fn with_failing_operation(mut self, operation: &'static str) -> Self {
        self.always_failing = Some(operation);
        self
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Count the operation, apply latency, then roll for failure.
    fn enter(&self, operation: &str) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate || self.always_failing == Some(operation) {
            return Err(StorageError::Io(format!("chaotic failure injection: {operation}")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn upsert_key(&self, record: &KeyRecord) -> Result<(), StorageError> {
        self.enter("upsert_key")?;
        self.inner.upsert_key(record)
    }

    fn get_key(&self, agent_id: &str, key_id: &str) -> Result<Option<KeyRecord>, StorageError> {
        self.enter("get_key")?;
        self.inner.get_key(agent_id, key_id)
    }

    fn revoke_key(
        &self,
        agent_id: &str,
        key_id: &str,
        at_millis: u64,
    ) -> Result<(), StorageError> {
        self.enter("revoke_key")?;
        self.inner.revoke_key(agent_id, key_id, at_millis)
    }

    fn list_keys(&self) -> Result<Vec<KeyRecord>, StorageError> {
        self.enter("list_keys")?;
        self.inner.list_keys()
    }

    fn find_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<KeyRecord>, StorageError> {
        self.enter("find_key_by_fingerprint")?;
        self.inner.find_key_by_fingerprint(fingerprint)
    }

    fn persist_seen(&self, key: &ReplayKey, first_seen_millis: u64) -> Result<bool, StorageError> {
        self.enter("persist_seen")?;
        self.inner.persist_seen(key, first_seen_millis)
    }

    fn was_seen(&self, key: &ReplayKey) -> Result<bool, StorageError> {
        self.enter("was_seen")?;
        self.inner.was_seen(key)
    }

    fn prune_seen(&self, before_millis: u64) -> Result<usize, StorageError> {
        self.enter("prune_seen")?;
        self.inner.prune_seen(before_millis)
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StorageError> {
        self.enter("append_audit")?;
        self.inner.append_audit(entry)
    }

    fn upsert_capability(&self, capability: &Capability) -> Result<(), StorageError> {
        self.enter("upsert_capability")?;
        self.inner.upsert_capability(capability)
    }

    fn get_capability(&self, agent_id: &str) -> Result<Option<Capability>, StorageError> {
        self.enter("get_capability")?;
        self.inner.get_capability(agent_id)
    }

    fn list_capabilities(&self) -> Result<Vec<Capability>, StorageError> {
        self.enter("list_capabilities")?;
        self.inner.list_capabilities()
    }
}

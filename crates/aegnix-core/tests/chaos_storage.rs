//! Chaos tests for storage failures during verification
//!
//! Wrapping the store in `ChaoticStorage` must never turn a failure into an
//! acceptance:
//! - Every storage error or timeout surfaces as `StorageUnavailable`
//! - No nonce is accepted twice, whatever the failure pattern
//! - An envelope reported accepted is durably marked

use std::time::Duration;

use aegnix_core::{
    ChaoticStorage, EngineConfig, EnvelopeEngine, EnvelopeError, MemoryStorage, SimEnv, Value,
};
use proptest::prelude::*;

const START: u64 = 1_700_000_000_000;

fn payload() -> Value {
    [("msg", Value::from("hello"))].into_iter().collect()
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(future)
}

#[test]
fn prop_chaos_never_accepts_twice() {
    proptest!(ProptestConfig::with_cases(24), |(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        attempts in 2usize..8,
    )| {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed);
        let engine =
            EnvelopeEngine::new(SimEnv::new(seed, START), storage, EngineConfig::default());
        let guard = engine.replay_guard();
        let (secret, public) = engine.generate_signing_keypair();
        let mut envelope = engine.build("fusion-ae", "fused.track", payload()).unwrap();
        engine.sign(&mut envelope, &secret, "fusion-ed25519-1").unwrap();

        let mut accepted = 0;
        for _ in 0..attempts {
            match block_on(engine.verify_with_key(&guard, &envelope, &public)) {
                Ok(_) => accepted += 1,
                Err(EnvelopeError::ReplayDetected) => {},
                Err(e) => prop_assert!(e.is_storage_failure(), "unexpected error {:?}", e),
            }
        }

        prop_assert!(accepted <= 1);
        if accepted == 1 {
            prop_assert_eq!(engine.storage().inner().seen_count(), 1);
        }
    });
}

#[tokio::test]
async fn failing_store_rejects_with_storage_unavailable() {
    let engine = EnvelopeEngine::new(
        SimEnv::new(1, START),
        ChaoticStorage::new(MemoryStorage::new(), 1.0),
        EngineConfig::default(),
    );
    let (secret, public) = engine.generate_signing_keypair();
    let mut envelope = engine.build("fusion-ae", "fused.track", payload()).unwrap();
    engine.sign(&mut envelope, &secret, "fusion-ed25519-1").unwrap();

    let by_key = engine.verify_with_key(&engine.replay_guard(), &envelope, &public).await;
    let by_registry = engine.verify(&engine.replay_guard(), &envelope).await;

    assert!(matches!(by_key, Err(EnvelopeError::StorageUnavailable { .. })));
    assert!(matches!(by_registry, Err(EnvelopeError::StorageUnavailable { .. })));
    assert_eq!(engine.storage().inner().seen_count(), 0);
}

#[tokio::test]
async fn slow_store_times_out_as_storage_unavailable() {
    let config =
        EngineConfig { storage_timeout: Duration::from_millis(20), ..EngineConfig::default() };
    let storage =
        ChaoticStorage::new(MemoryStorage::new(), 0.0).with_latency(Duration::from_millis(300));
    let engine = EnvelopeEngine::new(SimEnv::new(2, START), storage, config);
    let (secret, public) = engine.generate_signing_keypair();
    let mut envelope = engine.build("fusion-ae", "fused.track", payload()).unwrap();
    engine.sign(&mut envelope, &secret, "fusion-ed25519-1").unwrap();

    let result = engine.verify_with_key(&engine.replay_guard(), &envelope, &public).await;

    assert!(matches!(result, Err(EnvelopeError::StorageUnavailable { .. })));
}

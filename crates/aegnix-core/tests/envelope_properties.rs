//! Property-based tests for the envelope pipeline
//!
//! These tests verify the end-to-end invariants:
//!
//! 1. **Round-trip**: verify(sign(build(p, s, payload))) succeeds and yields
//!    the same canonical payload
//! 2. **Tamper detection**: flipping any bit of any signed field fails
//!    verification
//! 3. **Determinism**: canonical bytes ignore map insertion order
//! 4. **Replay**: a verified envelope is never accepted twice
//! 5. **Revocation**: verification after revocation fails with `KeyRevoked`

use aegnix_core::{
    EngineConfig, EnvelopeEngine, EnvelopeError, MemoryStorage, SimEnv, Value, WireBody,
    WireEnvelope, canonical,
};
use proptest::prelude::*;

const START: u64 = 1_700_000_000_000;

fn engine(seed: u64) -> EnvelopeEngine<SimEnv, MemoryStorage> {
    EnvelopeEngine::new(SimEnv::new(seed, START), MemoryStorage::new(), EngineConfig::default())
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(future)
}

fn hello() -> Value {
    [("msg", Value::from("hello"))].into_iter().collect()
}

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _.-]{0,16}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Sequence),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::Mapping),
        ]
    })
}

fn flip_string_bit(s: &mut String, bit: usize) -> bool {
    let mut bytes = s.clone().into_bytes();
    let i = bit % (bytes.len() * 8);
    bytes[i / 8] ^= 1 << (i % 8);
    match String::from_utf8(bytes) {
        Ok(flipped) => {
            *s = flipped;
            true
        },
        // Invalid UTF-8 cannot even be represented in the wire struct
        Err(_) => false,
    }
}

fn flip_bytes_bit(bytes: &mut [u8], bit: usize) {
    let i = bit % (bytes.len() * 8);
    bytes[i / 8] ^= 1 << (i % 8);
}

/// Flip one bit in the selected signed field. Returns false if the flip is
/// not representable.
fn tamper(wire: &mut WireEnvelope, field: usize, bit: usize) -> bool {
    match field {
        0 => flip_string_bit(&mut wire.producer, bit),
        1 => flip_string_bit(&mut wire.subject, bit),
        2 => {
            flip_bytes_bit(&mut wire.nonce, bit);
            true
        },
        3 => {
            wire.timestamp_millis ^= 1 << (bit % 20);
            true
        },
        4 => flip_string_bit(&mut wire.key_id, bit),
        5 => flip_string_bit(&mut wire.sensitivity, bit),
        6 => match &mut wire.body {
            WireBody::Plain { payload } => {
                flip_bytes_bit(payload, bit);
                true
            },
            WireBody::Sealed { .. } => false,
        },
        _ => {
            flip_bytes_bit(&mut wire.signature, bit);
            true
        },
    }
}

#[test]
fn prop_sign_verify_roundtrip() {
    proptest!(ProptestConfig::with_cases(32), |(
        seed in any::<u64>(),
        producer in "[a-z][a-z0-9-]{0,15}",
        subject in "[a-z][a-z0-9.]{0,15}",
        payload in arb_value(),
    )| {
        let engine = engine(seed);
        let guard = engine.replay_guard();
        let (secret, public) = engine.generate_signing_keypair();

        let mut envelope = engine.build(&producer, &subject, payload.clone()).unwrap();
        engine.sign(&mut envelope, &secret, "k1").unwrap();

        let received = aegnix_core::Envelope::from_cbor(&envelope.to_cbor().unwrap()).unwrap();
        let verified = block_on(engine.verify_with_key(&guard, &received, &public)).unwrap();
        let accepted = block_on(engine.open(verified, None)).unwrap();

        prop_assert_eq!(
            canonical::encode(accepted.payload()).unwrap(),
            canonical::encode(&payload).unwrap()
        );
    });
}

#[test]
fn prop_single_bit_tamper_rejected() {
    proptest!(ProptestConfig::with_cases(64), |(
        seed in any::<u64>(),
        field in 0usize..8,
        bit in any::<usize>(),
    )| {
        let engine = engine(seed);
        let guard = engine.replay_guard();
        let (secret, public) = engine.generate_signing_keypair();
        let mut envelope = engine.build("fusion-ae", "fused.track", hello()).unwrap();
        engine.sign(&mut envelope, &secret, "fusion-ed25519-1").unwrap();

        let mut wire = envelope.to_wire().unwrap();
        if tamper(&mut wire, field, bit) {
            let tampered = aegnix_core::Envelope::try_from(wire);
            let result = match tampered {
                Ok(tampered) => block_on(engine.verify_with_key(&guard, &tampered, &public)),
                Err(e) => Err(e),
            };
            prop_assert!(result.is_err(), "tampered field {} accepted", field);
        }

        // Rejections never consume the original nonce
        let original = block_on(engine.verify_with_key(&guard, &envelope, &public));
        prop_assert!(original.is_ok());
    });
}

#[test]
fn prop_canonical_bytes_ignore_insertion_order() {
    proptest!(|(entries in prop::collection::vec(("[a-z]{1,8}", any::<i64>()), 0..12))| {
        let forward: Value = entries.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect();
        let backward: Value =
            entries.iter().rev().map(|(k, v)| (k.clone(), Value::from(*v))).collect();

        // Later duplicates win on collect, so compare only when keys are unique
        let mut keys: Vec<_> = entries.iter().map(|(k, _)| k).collect();
        keys.sort();
        keys.dedup();
        prop_assume!(keys.len() == entries.len());

        prop_assert_eq!(canonical::encode(&forward).unwrap(), canonical::encode(&backward).unwrap());
    });
}

#[test]
fn prop_canonical_decode_reencodes_identically() {
    proptest!(|(value in arb_value())| {
        let bytes = canonical::encode(&value).unwrap();
        let decoded = canonical::decode(&bytes).unwrap();

        prop_assert_eq!(canonical::encode(&decoded).unwrap(), bytes);
    });
}

#[tokio::test]
async fn fusion_scenario_verifies_once_then_replay() {
    let engine = engine(7);
    let guard = engine.replay_guard();
    let (secret, public) = engine.generate_signing_keypair();
    engine.register_key("fusion-ae", "fusion-ed25519-1", &public).await.unwrap();

    let mut envelope = engine.build("fusion-ae", "fused.track", hello()).unwrap();
    engine.sign(&mut envelope, &secret, "fusion-ed25519-1").unwrap();
    let wire = envelope.to_cbor().unwrap();

    let first = aegnix_core::Envelope::from_cbor(&wire).unwrap();
    let verified = engine.verify(&guard, &first).await.unwrap();
    let accepted = engine.open(verified, None).await.unwrap();
    assert_eq!(accepted.payload(), &hello());
    assert_eq!(accepted.envelope().producer(), "fusion-ae");
    assert_eq!(accepted.envelope().subject(), "fused.track");

    let resubmitted = aegnix_core::Envelope::from_cbor(&wire).unwrap();
    assert_eq!(engine.verify(&guard, &resubmitted).await, Err(EnvelopeError::ReplayDetected));
}

#[tokio::test]
async fn revoked_key_rejected_after_revocation() {
    let engine = engine(8);
    let (secret, public) = engine.generate_signing_keypair();
    engine.register_key("fusion-ae", "fusion-ed25519-1", &public).await.unwrap();
    let mut envelope = engine.build("fusion-ae", "fused.track", hello()).unwrap();
    engine.sign(&mut envelope, &secret, "fusion-ed25519-1").unwrap();

    engine.verify(&engine.replay_guard(), &envelope).await.unwrap();

    engine.env().advance_millis(1_000);
    engine.revoke_key("fusion-ae", "fusion-ed25519-1").await.unwrap();
    engine.env().advance_millis(1);

    // Fresh guard: the key check runs before any replay bookkeeping
    let result = engine.verify(&engine.replay_guard(), &envelope).await;
    assert!(matches!(result, Err(EnvelopeError::KeyRevoked { .. })));

    let mut later = engine.build("fusion-ae", "fused.track", hello()).unwrap();
    engine.sign(&mut later, &secret, "fusion-ed25519-1").unwrap();
    let result = engine.verify(&engine.replay_guard(), &later).await;
    assert!(matches!(result, Err(EnvelopeError::KeyRevoked { .. })));
}

#[tokio::test]
async fn unknown_key_rejected() {
    let engine = engine(9);
    let (secret, public) = engine.generate_signing_keypair();
    engine.register_key("fusion-ae", "fusion-ed25519-1", &public).await.unwrap();
    let mut envelope = engine.build("fusion-ae", "fused.track", hello()).unwrap();
    engine.sign(&mut envelope, &secret, "fusion-ed25519-2").unwrap();

    let result = engine.verify(&engine.replay_guard(), &envelope).await;

    assert!(matches!(result, Err(EnvelopeError::UnknownKey { .. })));
}

#[tokio::test]
async fn sealed_envelope_roundtrip_with_derived_keys() {
    let engine = engine(10);
    let guard = engine.replay_guard();
    let (secret, public) = engine.generate_signing_keypair();
    let (producer_x, producer_x_pub) = engine.generate_exchange_keypair();
    let (bridge_x, bridge_x_pub) = engine.generate_exchange_keypair();

    let producer_key =
        engine.derive_key(&producer_x, &bridge_x_pub, "fusion-ae", "fused.track").unwrap();
    let bridge_key =
        engine.derive_key(&bridge_x, &producer_x_pub, "fusion-ae", "fused.track").unwrap();

    let mut envelope = engine.build("fusion-ae", "fused.track", hello()).unwrap();
    envelope.set_corr_id("req-42").unwrap();
    engine.sign(&mut envelope, &secret, "fusion-ed25519-1").unwrap();
    engine.seal(&mut envelope, &producer_key).unwrap();

    let received = aegnix_core::Envelope::from_cbor(&envelope.to_cbor().unwrap()).unwrap();

    // Authenticity is checkable without the symmetric key
    let verified = engine.verify_with_key(&guard, &received, &public).await.unwrap();
    let accepted = engine.open(verified, Some(&bridge_key)).await.unwrap();

    assert_eq!(accepted.payload(), &hello());
    assert_eq!(accepted.envelope().corr_id(), Some("req-42"));
}

#[tokio::test]
async fn sealed_envelope_wrong_key_or_tamper_fails_opaquely() {
    let engine = engine(11);
    let (secret, public) = engine.generate_signing_keypair();
    let (x, _) = engine.generate_exchange_keypair();
    let (_, peer) = engine.generate_exchange_keypair();
    let (_, stranger) = engine.generate_exchange_keypair();
    let key = engine.derive_key(&x, &peer, "fusion-ae", "fused.track").unwrap();
    let wrong = engine.derive_key(&x, &stranger, "fusion-ae", "fused.track").unwrap();

    let guard = engine.replay_guard();
    let sealed = || {
        let mut envelope = engine.build("fusion-ae", "fused.track", hello()).unwrap();
        engine.sign(&mut envelope, &secret, "fusion-ed25519-1").unwrap();
        engine.seal(&mut envelope, &key).unwrap();
        envelope
    };

    let envelope = sealed();
    let verified = engine.verify_with_key(&guard, &envelope, &public).await.unwrap();
    assert_eq!(engine.open(verified, Some(&wrong)).await, Err(EnvelopeError::DecryptionFailed));

    // Fresh nonce: the first envelope's nonce is already marked in the shared store
    let mut wire = sealed().to_wire().unwrap();
    if let WireBody::Sealed { ciphertext, .. } = &mut wire.body {
        ciphertext[0] ^= 0x01;
    }
    let tampered = aegnix_core::Envelope::try_from(wire).unwrap();
    assert_ne!(tampered.nonce(), envelope.nonce());
    let verified = engine.verify_with_key(&guard, &tampered, &public).await.unwrap();
    assert_eq!(engine.open(verified, Some(&key)).await, Err(EnvelopeError::DecryptionFailed));

    let rejected = engine
        .storage()
        .audit_entries()
        .into_iter()
        .filter(|entry| !entry.is_accepted())
        .count();
    assert_eq!(rejected, 2);
}

#[tokio::test]
async fn stale_and_future_envelopes_rejected() {
    let engine = engine(12);
    let (secret, public) = engine.generate_signing_keypair();

    let mut old = engine.build("fusion-ae", "fused.track", hello()).unwrap();
    engine.sign(&mut old, &secret, "k1").unwrap();
    engine.env().advance_millis(5 * 60 * 1000 + 1);

    let result = engine.verify_with_key(&engine.replay_guard(), &old, &public).await;
    assert!(matches!(result, Err(EnvelopeError::StaleEnvelope { .. })));

    engine.env().advance_millis(60_000);
    let mut future = engine.build("fusion-ae", "fused.track", hello()).unwrap();
    engine.sign(&mut future, &secret, "k1").unwrap();
    engine.env().set_millis(START);

    let result = engine.verify_with_key(&engine.replay_guard(), &future, &public).await;
    assert!(matches!(result, Err(EnvelopeError::ClockSkew { .. })));
}

//! Envelope orchestration.
//!
//! Producer side: [`EnvelopeEngine::build`] → [`EnvelopeEngine::sign`] →
//! optionally [`EnvelopeEngine::seal`]. Consumer side:
//! [`EnvelopeEngine::verify`] yields a [`VerifiedEnvelope`] (signature valid,
//! nonce marked), and [`EnvelopeEngine::open`] turns it into an
//! [`AcceptedEnvelope`] with the plaintext payload. Consumer states are
//! types, so an unverified envelope can never be opened.
//!
//! Every consumer-side outcome is appended to the audit log, including a
//! verified envelope that later fails to open.

use aegnix_crypto::{
    DerivationContext, ExchangePublicKey, ExchangeSecret, SigningPublicKey, SigningSecret,
    SymmetricKey, decrypt, derive_shared_key, encrypt, generate_exchange_keypair,
    generate_signing_keypair, sign, verify,
};
use tracing::{debug, error, warn};

use crate::{
    audit::{AuditLogEntry, AuditOutcome},
    canonical::{self, Value},
    capability::Capability,
    config::EngineConfig,
    env::{EnvRng, Environment},
    envelope::{
        Envelope, EnvelopeState, NONCE_LENGTH, Payload, SealedPayload, check_field,
        commitment_matches,
    },
    error::EnvelopeError,
    keyring::{KeyRecord, KeyStatus, fingerprint},
    replay::{ReplayDecision, ReplayGuard, ReplayKey},
    storage::{Storage, StorageError, call_with_timeout},
};

/// Envelope whose signature verified and whose nonce was durably marked.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEnvelope {
    envelope: Envelope,
    verified_at_millis: u64,
}

impl VerifiedEnvelope {
    /// The verified envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// When verification succeeded (ms since epoch).
    pub fn verified_at_millis(&self) -> u64 {
        self.verified_at_millis
    }

    /// Returns true if the payload is sealed and needs a key to open.
    pub fn is_sealed(&self) -> bool {
        self.envelope.state() == EnvelopeState::Encrypted
    }
}

/// Fully accepted envelope with its plaintext payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedEnvelope {
    envelope: Envelope,
    payload: Value,
}

impl AcceptedEnvelope {
    /// The envelope as received (payload possibly still sealed).
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Plaintext payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Builds, signs, seals, verifies and opens envelopes.
///
/// Generic over the environment (clock and randomness) and the storage
/// collaborator. The replay guard is not owned by the engine: callers pass
/// one into each verification so guard lifetime and sharing stay explicit.
#[derive(Clone)]
pub struct EnvelopeEngine<E: Environment, S: Storage> {
    env: E,
    storage: S,
    config: EngineConfig,
}

impl<E: Environment, S: Storage> EnvelopeEngine<E, S> {
    /// Create an engine.
    pub fn new(env: E, storage: S, config: EngineConfig) -> Self {
        Self { env, storage, config }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Storage collaborator.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// New replay guard over this engine's storage.
    pub fn replay_guard(&self) -> ReplayGuard<S> {
        ReplayGuard::new(self.storage.clone(), &self.config)
    }

    /// Fresh Ed25519 key pair from the environment's RNG.
    pub fn generate_signing_keypair(&self) -> (SigningSecret, SigningPublicKey) {
        generate_signing_keypair(&mut EnvRng::new(&self.env))
    }

    /// Fresh X25519 key pair from the environment's RNG.
    pub fn generate_exchange_keypair(&self) -> (ExchangeSecret, ExchangePublicKey) {
        generate_exchange_keypair(&mut EnvRng::new(&self.env))
    }

    /// Assemble a draft with a fresh nonce and the current time.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope`: empty producer or subject, or a payload that
    ///   cannot be canonicalized
    pub fn build(
        &self,
        producer: &str,
        subject: &str,
        payload: Value,
    ) -> Result<Envelope, EnvelopeError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        self.env.random_bytes(&mut nonce);

        Envelope::draft(producer, subject, payload, nonce, self.env.wall_clock_millis())
    }

    /// Sign a draft, attaching the signature and key id.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: the envelope is already signed
    /// - `MalformedEnvelope`: empty key id
    pub fn sign(
        &self,
        envelope: &mut Envelope,
        secret: &SigningSecret,
        key_id: &str,
    ) -> Result<(), EnvelopeError> {
        envelope.require_state(EnvelopeState::Draft, "sign")?;
        check_field("key id", key_id)?;

        let bytes = envelope.signing_bytes_for(key_id)?;
        envelope.attach_signature(key_id.to_string(), sign(&bytes, secret));

        debug!(producer = envelope.producer(), subject = envelope.subject(), key_id, "signed");
        Ok(())
    }

    /// Derive the symmetric key for a producer/subject pair.
    ///
    /// Both sides derive the same key from their own exchange secret and the
    /// peer's public key.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope`: the peer key is a low-order point
    pub fn derive_key(
        &self,
        local: &ExchangeSecret,
        remote: &ExchangePublicKey,
        producer: &str,
        subject: &str,
    ) -> Result<SymmetricKey, EnvelopeError> {
        let context = DerivationContext::new(&self.config.kdf_protocol).with_pair(producer, subject);
        derive_shared_key(local, remote, &context)
            .map_err(|e| EnvelopeError::malformed(format!("key exchange: {e}")))
    }

    /// Encrypt the payload of a signed envelope in place.
    ///
    /// Associated data binds producer, subject, key id and nonce. The
    /// signature stays valid: it covers the payload commitment, which the
    /// sealed form carries.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: the envelope is not in `Signed` state
    pub fn seal(&self, envelope: &mut Envelope, key: &SymmetricKey) -> Result<(), EnvelopeError> {
        envelope.require_state(EnvelopeState::Signed, "seal")?;
        let Payload::Plain(value) = envelope.payload() else {
            return Err(EnvelopeError::InvalidState { state: envelope.state(), operation: "seal" });
        };

        let plaintext = canonical::encode(value)?;
        let commitment = envelope.payload_commitment()?;
        let aad = envelope.associated_data()?;

        let sealed = encrypt(&plaintext, key, &aad, &mut EnvRng::new(&self.env))
            .map_err(|e| EnvelopeError::malformed(e.to_string()))?;
        envelope.replace_payload(Payload::Sealed(SealedPayload::from_box(sealed, commitment)));

        debug!(producer = envelope.producer(), subject = envelope.subject(), "sealed");
        Ok(())
    }

    /// Verify against the registered key for the envelope's producer and key
    /// id, then mark its nonce.
    ///
    /// Key status is checked before any cryptographic work.
    ///
    /// # Errors
    ///
    /// - `UnknownKey` / `KeyRevoked`: keyring lookup failed closed
    /// - `InvalidSignature`: signature does not cover the envelope
    /// - `ReplayDetected`, `StaleEnvelope`, `ClockSkew`: replay guard verdicts
    /// - `StorageUnavailable`: keyring, replay store or audit log failed
    pub async fn verify(
        &self,
        guard: &ReplayGuard<S>,
        envelope: &Envelope,
    ) -> Result<VerifiedEnvelope, EnvelopeError> {
        let now = self.env.wall_clock_millis();
        let result = self.verify_inner(guard, envelope, None, now).await;
        self.audit(envelope, result, now).await
    }

    /// Verify against a caller-pinned public key, then mark its nonce.
    ///
    /// Skips the keyring. For peers that learned the producer's key out of
    /// band and keep no registry.
    pub async fn verify_with_key(
        &self,
        guard: &ReplayGuard<S>,
        envelope: &Envelope,
        public_key: &SigningPublicKey,
    ) -> Result<VerifiedEnvelope, EnvelopeError> {
        let now = self.env.wall_clock_millis();
        let result = self.verify_inner(guard, envelope, Some(public_key), now).await;
        self.audit(envelope, result, now).await
    }

    /// Decrypt a sealed payload, or pass a plaintext payload through.
    ///
    /// A failure is appended to the audit log as a rejection of the
    /// envelope; the nonce stays consumed.
    ///
    /// # Errors
    ///
    /// - `DecryptionFailed`: no key for a sealed payload, wrong key, tampered
    ///   ciphertext, or plaintext that does not match the signed commitment.
    ///   The cases are indistinguishable.
    pub async fn open(
        &self,
        verified: VerifiedEnvelope,
        key: Option<&SymmetricKey>,
    ) -> Result<AcceptedEnvelope, EnvelopeError> {
        let envelope = verified.envelope;

        match unseal(&envelope, key) {
            Ok(payload) => Ok(AcceptedEnvelope { envelope, payload }),
            Err(e) => self.audit(&envelope, Err(e), self.env.wall_clock_millis()).await,
        }
    }

    /// Register (or replace) a producer's public key as trusted.
    ///
    /// # Errors
    ///
    /// See [`EnvelopeEngine::register_record`].
    pub async fn register_key(
        &self,
        agent_id: &str,
        key_id: &str,
        public_key: &SigningPublicKey,
    ) -> Result<KeyRecord, EnvelopeError> {
        let record = KeyRecord::new(agent_id, key_id, public_key, self.env.wall_clock_millis());
        self.register_record(record).await
    }

    /// Register (or replace) a fully specified key record.
    ///
    /// Used to set status, expiry and roles, and to promote a pending key.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope`: empty agent id, key id or role, or an
    ///   inconsistent fingerprint
    /// - `KeyRevoked`: the key id was revoked; revocation is permanent
    /// - `StorageUnavailable`: the keyring failed
    pub async fn register_record(&self, record: KeyRecord) -> Result<KeyRecord, EnvelopeError> {
        check_field("agent id", &record.agent_id)?;
        check_field("key id", &record.key_id)?;
        for role in &record.roles {
            check_field("role", role)?;
        }
        if record.fingerprint != fingerprint(&record.public_key) {
            return Err(EnvelopeError::malformed("fingerprint does not match public key"));
        }
        if record.revoked_at_millis.is_some() {
            return Err(EnvelopeError::malformed("cannot register a revoked record"));
        }
        record.signing_key()?;

        let (agent_id, key_id) = (record.agent_id.as_str(), record.key_id.as_str());
        if let Some(existing) = self.fetch_key(agent_id, key_id).await?
            && let Some(revoked_at_millis) = existing.revoked_at_millis
        {
            return Err(EnvelopeError::KeyRevoked {
                producer: agent_id.to_string(),
                key_id: key_id.to_string(),
                revoked_at_millis,
            });
        }

        let stored = record.clone();
        if let Err(e) = self.storage_call("upsert_key", move |s| s.upsert_key(&stored)).await {
            return Err(match e {
                // Revoked between the check above and the write
                StorageError::Conflict(_) => self.revoked_conflict(&record).await,
                other => other.into(),
            });
        }

        debug!(
            agent_id,
            key_id,
            fingerprint = %record.fingerprint,
            status = %record.status,
            "key registered"
        );
        Ok(record)
    }

    /// Revoke a key from now on.
    ///
    /// # Errors
    ///
    /// - `UnknownKey`: no such key
    /// - `StorageUnavailable`: the keyring failed
    pub async fn revoke_key(&self, agent_id: &str, key_id: &str) -> Result<(), EnvelopeError> {
        let now = self.env.wall_clock_millis();
        let (agent, key) = (agent_id.to_string(), key_id.to_string());

        self.storage_call("revoke_key", move |s| s.revoke_key(&agent, &key, now)).await.map_err(
            |e| match e {
                StorageError::NotFound { .. } => EnvelopeError::UnknownKey {
                    producer: agent_id.to_string(),
                    key_id: key_id.to_string(),
                },
                other => other.into(),
            },
        )?;

        warn!(agent_id, key_id, revoked_at = now, "key revoked");
        Ok(())
    }

    /// All registered keys.
    pub async fn list_keys(&self) -> Result<Vec<KeyRecord>, EnvelopeError> {
        Ok(self.storage_call("list_keys", |s| s.list_keys()).await?)
    }

    /// Key record holding exactly this public key, revoked or not.
    ///
    /// Looks up by fingerprint, then compares the full key bytes.
    pub async fn find_key_by_public_key(
        &self,
        public_key: &SigningPublicKey,
    ) -> Result<Option<KeyRecord>, EnvelopeError> {
        let bytes = public_key.to_bytes();
        let found = self.find_key_by_fingerprint(&fingerprint(&bytes)).await?;
        Ok(found.filter(|record| record.public_key == bytes))
    }

    /// Record an agent's capability declaration, replacing any earlier one.
    ///
    /// The update time is set from the engine clock.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope`: empty or oversized agent id or subject
    /// - `StorageUnavailable`: the store failed
    pub async fn declare_capability(
        &self,
        mut capability: Capability,
    ) -> Result<Capability, EnvelopeError> {
        check_field("agent id", &capability.agent_id)?;
        for subject in capability.publishes.iter().chain(&capability.subscribes) {
            check_field("subject", subject)?;
        }
        capability.updated_at_millis = self.env.wall_clock_millis();

        let stored = capability.clone();
        self.storage_call("upsert_capability", move |s| s.upsert_capability(&stored)).await?;

        debug!(
            agent_id = %capability.agent_id,
            publishes = capability.publishes.len(),
            subscribes = capability.subscribes.len(),
            "capability declared"
        );
        Ok(capability)
    }

    /// Capability declaration of `agent_id`, if any.
    pub async fn capability(&self, agent_id: &str) -> Result<Option<Capability>, EnvelopeError> {
        let agent_id = agent_id.to_string();
        Ok(self.storage_call("get_capability", move |s| s.get_capability(&agent_id)).await?)
    }

    /// All capability declarations, ordered by agent id.
    pub async fn list_capabilities(&self) -> Result<Vec<Capability>, EnvelopeError> {
        Ok(self.storage_call("list_capabilities", |s| s.list_capabilities()).await?)
    }

    /// Drop replay state older than the retention horizon.
    ///
    /// The guard also prunes on its own once per retention period; this
    /// forces a pass, e.g. from a maintenance job. Returns the number of
    /// durable entries removed.
    ///
    /// # Errors
    ///
    /// - `StorageUnavailable`: the replay store failed
    pub async fn prune_replay_state(
        &self,
        guard: &ReplayGuard<S>,
    ) -> Result<usize, EnvelopeError> {
        guard.prune_expired(self.env.wall_clock_millis()).await
    }

    /// Key record with the given public key fingerprint.
    pub async fn find_key_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<KeyRecord>, EnvelopeError> {
        let fingerprint = fingerprint.to_string();
        Ok(self
            .storage_call("find_key_by_fingerprint", move |s| {
                s.find_key_by_fingerprint(&fingerprint)
            })
            .await?)
    }

    async fn verify_inner(
        &self,
        guard: &ReplayGuard<S>,
        envelope: &Envelope,
        pinned: Option<&SigningPublicKey>,
        now: u64,
    ) -> Result<VerifiedEnvelope, EnvelopeError> {
        let (Some(key_id), Some(signature)) = (envelope.key_id(), envelope.signature()) else {
            return Err(EnvelopeError::InvalidState {
                state: envelope.state(),
                operation: "verify",
            });
        };

        let public_key = match pinned {
            Some(key) => *key,
            None => self.lookup_active_key(envelope.producer(), key_id, now).await?,
        };

        let bytes = envelope.signing_bytes()?;
        if !verify(&bytes, signature, &public_key) {
            return Err(EnvelopeError::InvalidSignature);
        }

        let replay_key = ReplayKey::new(envelope.producer(), key_id, *envelope.nonce());
        match guard.check_and_mark(&replay_key, envelope.timestamp_millis(), now).await? {
            ReplayDecision::Accepted => {
                Ok(VerifiedEnvelope { envelope: envelope.clone(), verified_at_millis: now })
            },
            ReplayDecision::Duplicate => Err(EnvelopeError::ReplayDetected),
        }
    }

    async fn lookup_active_key(
        &self,
        producer: &str,
        key_id: &str,
        now: u64,
    ) -> Result<SigningPublicKey, EnvelopeError> {
        let record = self.fetch_key(producer, key_id).await?.ok_or_else(|| {
            EnvelopeError::UnknownKey { producer: producer.to_string(), key_id: key_id.to_string() }
        })?;

        if let Some(revoked_at_millis) = record.revoked_at_millis
            && record.is_revoked_at(now)
        {
            return Err(EnvelopeError::KeyRevoked {
                producer: producer.to_string(),
                key_id: key_id.to_string(),
                revoked_at_millis,
            });
        }
        if let Some(expired_at_millis) = record.expires_at_millis
            && record.is_expired_at(now)
        {
            return Err(EnvelopeError::KeyExpired {
                producer: producer.to_string(),
                key_id: key_id.to_string(),
                expired_at_millis,
            });
        }
        if record.status != KeyStatus::Trusted {
            return Err(EnvelopeError::KeyNotTrusted {
                producer: producer.to_string(),
                key_id: key_id.to_string(),
                status: record.status,
            });
        }

        record.signing_key()
    }

    /// Error for an upsert refused because the key is revoked.
    async fn revoked_conflict(&self, record: &KeyRecord) -> EnvelopeError {
        let revoked_at_millis = match self.fetch_key(&record.agent_id, &record.key_id).await {
            Ok(Some(current)) => current.revoked_at_millis,
            Ok(None) => None,
            Err(e) => return e,
        };

        match revoked_at_millis {
            Some(revoked_at_millis) => EnvelopeError::KeyRevoked {
                producer: record.agent_id.clone(),
                key_id: record.key_id.clone(),
                revoked_at_millis,
            },
            None => EnvelopeError::StorageUnavailable {
                reason: format!("upsert of {}/{} conflicted", record.agent_id, record.key_id),
            },
        }
    }

    async fn fetch_key(
        &self,
        agent_id: &str,
        key_id: &str,
    ) -> Result<Option<KeyRecord>, EnvelopeError> {
        let (agent, key) = (agent_id.to_string(), key_id.to_string());
        Ok(self.storage_call("get_key", move |s| s.get_key(&agent, &key)).await?)
    }

    /// Append the outcome to the audit log and pass it through.
    ///
    /// An accepted envelope whose audit write fails is rejected. A rejection
    /// whose audit write fails keeps its original reason.
    async fn audit<T>(
        &self,
        envelope: &Envelope,
        result: Result<T, EnvelopeError>,
        now: u64,
    ) -> Result<T, EnvelopeError> {
        let outcome = match &result {
            Ok(_) => AuditOutcome::Accepted,
            Err(e) => AuditOutcome::Rejected { reason: e.reason_code().to_string() },
        };
        let entry = AuditLogEntry {
            envelope_id: envelope.envelope_id().unwrap_or_else(|_| "unidentified".to_string()),
            producer: envelope.producer().to_string(),
            subject: envelope.subject().to_string(),
            key_id: envelope.key_id().unwrap_or_default().to_string(),
            outcome,
            recorded_at_millis: now,
        };

        match &result {
            Ok(_) => debug!(
                envelope_id = %entry.envelope_id,
                producer = %entry.producer,
                key_id = %entry.key_id,
                subject = %entry.subject,
                "envelope accepted"
            ),
            Err(e) if e.is_storage_failure() => error!(
                envelope_id = %entry.envelope_id,
                producer = %entry.producer,
                reason = e.reason_code(),
                error = %e,
                "envelope rejected"
            ),
            Err(e) => warn!(
                envelope_id = %entry.envelope_id,
                producer = %entry.producer,
                key_id = %entry.key_id,
                reason = e.reason_code(),
                "envelope rejected"
            ),
        }

        let appended = self.storage_call("append_audit", move |s| s.append_audit(&entry)).await;
        match (result, appended) {
            (Ok(verified), Ok(())) => Ok(verified),
            (Ok(_), Err(e)) => {
                error!(error = %e, "audit append failed, rejecting accepted envelope");
                Err(e.into())
            },
            (Err(original), Err(e)) => {
                warn!(error = %e, "audit append failed for rejected envelope");
                Err(original)
            },
            (Err(original), Ok(())) => Err(original),
        }
    }

    async fn storage_call<T, F>(&self, operation: &'static str, call: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, StorageError> + Send + 'static,
    {
        call_with_timeout(&self.storage, self.config.storage_timeout, operation, call).await
    }
}

/// Plaintext payload of a verified envelope.
fn unseal(envelope: &Envelope, key: Option<&SymmetricKey>) -> Result<Value, EnvelopeError> {
    let sealed = match envelope.payload() {
        Payload::Plain(value) => return Ok(value.clone()),
        Payload::Sealed(sealed) => sealed,
    };

    let key = key.ok_or(EnvelopeError::DecryptionFailed)?;
    let aad = envelope.associated_data()?;

    let plaintext =
        decrypt(&sealed.to_box(), key, &aad).map_err(|_| EnvelopeError::DecryptionFailed)?;
    let value = canonical::decode(&plaintext).map_err(|_| EnvelopeError::DecryptionFailed)?;
    if !commitment_matches(envelope, &value)? {
        return Err(EnvelopeError::DecryptionFailed);
    }
    Ok(value)
}

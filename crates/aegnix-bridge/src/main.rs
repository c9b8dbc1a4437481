//! AEGNIX bridge binary.
//!
//! # Usage
//!
//! ```bash
//! # Generate signing and exchange key pairs
//! aegnix keygen --name fusion-ae --out-dir keys
//!
//! # Register the producer key with the bridge keyring
//! aegnix register --agent fusion-ae --key-id fusion-ed25519-1 --public-key keys/fusion-ae.sign.pub
//!
//! # Declare what the producer publishes and consumes
//! aegnix declare --agent fusion-ae --publish fused.track --subscribe raw.radar
//!
//! # Sign (and optionally seal) a JSON payload
//! aegnix sign --producer fusion-ae --subject fused.track --key-id fusion-ed25519-1 \
//!     --secret-key keys/fusion-ae.sign.key --payload track.json --out track.env \
//!     --sensitivity CUI --label coalition \
//!     --seal --exchange-secret keys/fusion-ae.kx.key --peer-public keys/consumer.kx.pub
//!
//! # Verify, mark the nonce and print the payload
//! aegnix verify --input track.env \
//!     --exchange-secret keys/consumer.kx.key --peer-public keys/fusion-ae.kx.pub
//!
//! # Drop replay state past the retention horizon
//! aegnix prune
//! ```

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use aegnix_bridge::{BridgeConfig, BridgeEngine, BridgeError, accepted_report, keys, open_engine};
use aegnix_core::{Capability, Envelope, Environment, KeyRecord, KeyStatus, Value};
use aegnix_crypto::{
    ExchangePublicKey, ExchangeSecret, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH, SigningPublicKey,
    SigningSecret, SymmetricKey,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// AEGNIX envelope bridge
#[derive(Parser, Debug)]
#[command(name = "aegnix")]
#[command(about = "Sign, seal and verify AEGNIX envelopes")]
#[command(version)]
struct Args {
    #[command(flatten)]
    config: BridgeConfig,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AEGNIX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an Ed25519 signing pair and an X25519 exchange pair
    Keygen {
        /// File name prefix
        #[arg(long)]
        name: String,
        /// Directory to write into
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Register a producer's public signing key
    Register {
        /// Producer agent id
        #[arg(long)]
        agent: String,
        /// Key id carried in envelopes
        #[arg(long)]
        key_id: String,
        /// Hex public key file
        #[arg(long)]
        public_key: PathBuf,
        /// Trust level (trusted, pending, untrusted)
        #[arg(long, default_value = "trusted")]
        status: KeyStatus,
        /// Expire the key this many seconds from now
        #[arg(long)]
        expires_in_secs: Option<u64>,
        /// Role granted to the key holder (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// Revoke a registered key
    Revoke {
        /// Producer agent id
        #[arg(long)]
        agent: String,
        /// Key id to revoke
        #[arg(long)]
        key_id: String,
    },
    /// Print the keyring as JSON
    ListKeys,
    /// Print the key record holding a public key
    FindKey {
        /// Hex public key file
        #[arg(long)]
        public_key: PathBuf,
    },
    /// Record an agent's publish/subscribe declaration
    Declare {
        /// Agent id
        #[arg(long)]
        agent: String,
        /// Subject the agent publishes to (repeatable)
        #[arg(long = "publish")]
        publishes: Vec<String>,
        /// Subject the agent subscribes to (repeatable)
        #[arg(long = "subscribe")]
        subscribes: Vec<String>,
        /// Metadata entry as key=value (repeatable)
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },
    /// Print capability declarations as JSON
    Capabilities {
        /// Only this agent
        #[arg(long)]
        agent: Option<String>,
    },
    /// Drop replay state past the retention horizon
    Prune,
    /// Build and sign an envelope from a JSON payload
    Sign {
        /// Producer agent id
        #[arg(long)]
        producer: String,
        /// Subject the envelope is published under
        #[arg(long)]
        subject: String,
        /// Key id of the signing key
        #[arg(long)]
        key_id: String,
        /// Hex signing secret file
        #[arg(long)]
        secret_key: PathBuf,
        /// JSON payload file, or `-` for stdin
        #[arg(long)]
        payload: PathBuf,
        /// Correlation id
        #[arg(long)]
        corr_id: Option<String>,
        /// Sensitivity marking
        #[arg(long)]
        sensitivity: Option<String>,
        /// Handling label (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Encrypt the payload with the key agreed from the exchange files
        #[arg(long, requires = "exchange_secret")]
        seal: bool,
        #[command(flatten)]
        exchange: ExchangeArgs,
        /// Output file for the CBOR envelope
        #[arg(long)]
        out: PathBuf,
    },
    /// Verify an envelope, mark its nonce and print its payload
    Verify {
        /// CBOR envelope file
        #[arg(long)]
        input: PathBuf,
        /// Pin this hex public key instead of consulting the keyring
        #[arg(long)]
        public_key: Option<PathBuf>,
        #[command(flatten)]
        exchange: ExchangeArgs,
    },
}

/// Key agreement inputs, used by `sign --seal` and to open sealed payloads.
#[derive(clap::Args, Debug)]
struct ExchangeArgs {
    /// Hex X25519 secret file of this side
    #[arg(long, requires = "peer_public")]
    exchange_secret: Option<PathBuf>,
    /// Hex X25519 public key file of the peer
    #[arg(long, requires = "exchange_secret")]
    peer_public: Option<PathBuf>,
}

impl ExchangeArgs {
    fn symmetric_key(
        &self,
        engine: &BridgeEngine,
        producer: &str,
        subject: &str,
    ) -> Result<Option<SymmetricKey>, BridgeError> {
        let (Some(secret), Some(peer)) = (&self.exchange_secret, &self.peer_public) else {
            return Ok(None);
        };

        let local = ExchangeSecret::from_bytes(&keys::read_hex_key(secret, SECRET_KEY_LENGTH)?)?;
        let remote = ExchangePublicKey::from_bytes(&keys::read_hex_key(peer, PUBLIC_KEY_LENGTH)?)?;

        Ok(Some(engine.derive_key(&local, &remote, producer, subject)?))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let engine = open_engine(&args.config)?;
    tracing::debug!(provider = ?args.config.storage_provider, "engine ready");

    run(&engine, args.command).await?;
    Ok(())
}

async fn run(engine: &BridgeEngine, command: Command) -> Result<(), BridgeError> {
    match command {
        Command::Keygen { name, out_dir } => {
            fs::create_dir_all(&out_dir)?;
            let (signing, verifying) = engine.generate_signing_keypair();
            let (exchange, exchange_public) = engine.generate_exchange_keypair();

            let path = |suffix: &str| out_dir.join(format!("{name}.{suffix}"));
            keys::write_secret_key(&path("sign.key"), signing.to_bytes().as_slice())?;
            keys::write_public_key(&path("sign.pub"), &verifying.to_bytes())?;
            keys::write_secret_key(&path("kx.key"), exchange.to_bytes().as_slice())?;
            keys::write_public_key(&path("kx.pub"), &exchange_public.to_bytes())?;

            emit(&serde_json::json!({
                "signing_fingerprint": aegnix_core::fingerprint(&verifying.to_bytes()),
                "out_dir": out_dir.display().to_string(),
            }))
        },
        Command::Register { agent, key_id, public_key, status, expires_in_secs, roles } => {
            let public = read_signing_public(&public_key)?;
            let now = engine.env().wall_clock_millis();

            let mut record =
                KeyRecord::new(&agent, &key_id, &public, now).with_status(status).with_roles(roles);
            if let Some(secs) = expires_in_secs {
                record = record.with_expiry(now.saturating_add(secs.saturating_mul(1_000)));
            }
            let record = engine.register_record(record).await?;
            emit(&serde_json::to_value(&record)?)
        },
        Command::Revoke { agent, key_id } => {
            engine.revoke_key(&agent, &key_id).await?;
            emit(&serde_json::json!({ "revoked": format!("{agent}/{key_id}") }))
        },
        Command::ListKeys => emit(&serde_json::to_value(engine.list_keys().await?)?),
        Command::FindKey { public_key } => {
            let public = read_signing_public(&public_key)?;
            emit(&serde_json::to_value(engine.find_key_by_public_key(&public).await?)?)
        },
        Command::Declare { agent, publishes, subscribes, meta } => {
            let capability = Capability {
                publishes,
                subscribes,
                meta: meta.into_iter().collect(),
                ..Capability::new(agent)
            };
            emit(&serde_json::to_value(engine.declare_capability(capability).await?)?)
        },
        Command::Capabilities { agent: Some(agent) } => {
            emit(&serde_json::to_value(engine.capability(&agent).await?)?)
        },
        Command::Capabilities { agent: None } => {
            emit(&serde_json::to_value(engine.list_capabilities().await?)?)
        },
        Command::Prune => {
            let pruned = engine.prune_replay_state(&engine.replay_guard()).await?;
            emit(&serde_json::json!({ "pruned": pruned }))
        },
        Command::Sign {
            producer,
            subject,
            key_id,
            secret_key,
            payload,
            corr_id,
            sensitivity,
            labels,
            seal,
            exchange,
            out,
        } => {
            let secret =
                SigningSecret::from_bytes(&keys::read_hex_key(&secret_key, SECRET_KEY_LENGTH)?)?;
            let payload = Value::try_from(read_json(&payload)?)?;

            let mut envelope = engine.build(&producer, &subject, payload)?;
            if let Some(corr_id) = &corr_id {
                envelope.set_corr_id(corr_id)?;
            }
            if let Some(sensitivity) = &sensitivity {
                envelope.set_sensitivity(sensitivity)?;
            }
            for label in &labels {
                envelope.add_label(label)?;
            }
            engine.sign(&mut envelope, &secret, &key_id)?;
            if seal && let Some(key) = exchange.symmetric_key(engine, &producer, &subject)? {
                engine.seal(&mut envelope, &key)?;
            }

            fs::write(&out, envelope.to_cbor()?)?;
            emit(&serde_json::json!({
                "envelope_id": envelope.envelope_id()?,
                "sealed": seal,
                "out": out.display().to_string(),
            }))
        },
        Command::Verify { input, public_key, exchange } => {
            let envelope = Envelope::from_cbor(&fs::read(&input)?)?;
            let guard = engine.replay_guard();

            let verified = match public_key {
                Some(path) => {
                    let public = read_signing_public(&path)?;
                    engine.verify_with_key(&guard, &envelope, &public).await?
                },
                None => engine.verify(&guard, &envelope).await?,
            };

            let key = exchange.symmetric_key(engine, envelope.producer(), envelope.subject())?;
            let accepted = engine.open(verified, key.as_ref()).await?;
            emit(&accepted_report(&accepted)?)
        },
    }
}

fn read_signing_public(path: &Path) -> Result<SigningPublicKey, BridgeError> {
    Ok(SigningPublicKey::from_bytes(&keys::read_hex_key(path, PUBLIC_KEY_LENGTH)?)?)
}

fn parse_meta(entry: &str) -> Result<(String, String), String> {
    entry
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {entry:?}"))
}

fn read_json(path: &Path) -> Result<serde_json::Value, BridgeError> {
    let text = if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        text
    } else {
        fs::read_to_string(path)?
    };
    Ok(serde_json::from_str(&text)?)
}

#[allow(clippy::print_stdout, reason = "command output is the binary's interface")]
fn emit(value: &serde_json::Value) -> Result<(), BridgeError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

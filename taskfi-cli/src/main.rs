//! TaskFi operator CLI
//!
//! Wallet key generation, sign-in message signing and verification, and an
//! in-process walkthrough of the escrow and withdrawal flow.

use std::{io::Read, sync::Arc};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use ed25519_dalek::SigningKey;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use taskfi_escrow::{
    engagement::{Engagement, EngagementRef, EngagementState, InMemoryEngagements},
    events::{EventRecord, NotificationSink},
    identity::{IdentityVerifier, SignedMessage, WalletAddress},
    models::Role,
    node::MarketNode,
    session::{Session, SignInOutcome},
    settings::Settings,
    transfer::{HttpTransferService, SimulatedTransferService, TransferService},
};
use tracing::{info, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "taskfi", version, about = "TaskFi escrow core operator tool")]
struct Cli {
    /// Config file (defaults to ./taskfi.toml when present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a wallet keypair
    Keygen,
    /// Produce a signed sign-in message
    Sign {
        /// Hex-encoded 32-byte secret key
        #[arg(long)]
        secret: String,
        /// Domain to bind the message to (defaults to the configured domain)
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        nonce: Option<String>,
    },
    /// Verify a signed sign-in message produced by `sign`
    Verify {
        /// JSON file with address, message and signature; stdin when omitted
        #[arg(long)]
        file: Option<String>,
    },
    /// Print the effective configuration
    Config,
    /// Run the escrow, release and withdrawal flow against in-memory stores
    Demo,
}

#[derive(Serialize, Deserialize)]
struct SignedPayload {
    address: String,
    message: String,
    signature: String,
}

/// Notification sink that writes events to the log
struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, record: &EventRecord) -> std::result::Result<(), String> {
        info!(
            sequence = record.sequence,
            kind = record.event.kind(),
            recipients = ?record.event.recipients(),
            "Notification"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Command::Keygen => keygen(),
        Command::Sign {
            secret,
            domain,
            nonce,
        } => sign(&settings, &secret, domain, nonce),
        Command::Verify { file } => verify(&settings, file.as_deref()),
        Command::Config => {
            let mut shown = settings;
            shown.session.jwt_secret = "<redacted>".to_string();
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
        Command::Demo => demo(settings).await,
    }
}

fn keygen() -> Result<()> {
    let key = SigningKey::generate(&mut OsRng);
    let address = WalletAddress::from_verifying_key(&key.verifying_key());
    println!(
        "{}",
        serde_json::json!({
            "address": address.as_str(),
            "secret": hex::encode(key.to_bytes()),
        })
    );
    Ok(())
}

fn signing_key(secret: &str) -> Result<SigningKey> {
    let bytes = hex::decode(secret.trim()).context("secret is not hex")?;
    let bytes: [u8; 32] = match bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => bail!("secret must be 32 bytes"),
    };
    Ok(SigningKey::from_bytes(&bytes))
}

fn random_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn signed_payload(key: &SigningKey, domain: &str, nonce: String) -> SignedPayload {
    let address = WalletAddress::from_verifying_key(&key.verifying_key());
    let message = SignedMessage::new(domain, &address, nonce, Utc::now());
    SignedPayload {
        address: address.to_string(),
        signature: message.sign(key),
        message: message.to_string(),
    }
}

fn sign(
    settings: &Settings,
    secret: &str,
    domain: Option<String>,
    nonce: Option<String>,
) -> Result<()> {
    let key = signing_key(secret)?;
    let domain = domain.unwrap_or_else(|| settings.auth.domain.clone());
    let payload = signed_payload(&key, &domain, nonce.unwrap_or_else(random_nonce));
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn verify(settings: &Settings, file: Option<&str>) -> Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let payload: SignedPayload = serde_json::from_str(&raw).context("parsing signed payload")?;

    let verifier = IdentityVerifier::new(settings.auth.clone());
    match verifier.verify(&payload.address, &payload.message, &payload.signature) {
        Ok(verified) => {
            println!(
                "{}",
                serde_json::json!({
                    "valid": true,
                    "address": verified.address().as_str(),
                    "nonce": verified.nonce(),
                    "issued_at": verified.issued_at(),
                })
            );
            Ok(())
        }
        Err(e) => bail!("signature rejected: {}", e),
    }
}

async fn register(
    node: &MarketNode,
    domain: &str,
    username: &str,
    role: Role,
) -> Result<(SigningKey, Session)> {
    let key = SigningKey::generate(&mut OsRng);
    let payload = signed_payload(&key, domain, random_nonce());

    let session = match node
        .sign_in(&payload.address, &payload.message, &payload.signature)
        .await?
    {
        SignInOutcome::ProfileRequired(verified) => {
            node.complete_profile(verified, username, role).await?
        }
        SignInOutcome::Authenticated(session) => session,
    };
    Ok((key, session))
}

async fn demo(settings: Settings) -> Result<()> {
    let domain = settings.auth.domain.clone();
    let transfers: Arc<dyn TransferService> =
        match HttpTransferService::from_config(&settings.transfer) {
            Some(http) => Arc::new(http),
            None => Arc::new(SimulatedTransferService::default()),
        };
    let engagements = Arc::new(InMemoryEngagements::new());
    let node = MarketNode::new(settings, engagements.clone(), transfers)?;
    let maintenance = node.spawn_maintenance();
    let dispatcher = node.events().spawn_dispatcher(Arc::new(LogSink));

    let (_, hirer) = register(&node, &domain, "demo_hirer", Role::Hirer).await?;
    let (freelancer_key, freelancer) =
        register(&node, &domain, "demo_freelancer", Role::Freelancer).await?;
    let freelancer_id = freelancer.identity.account_id;

    let job = EngagementRef::Job(Uuid::new_v4());
    engagements
        .upsert(Engagement {
            reference: job,
            client_id: hirer.identity.account_id,
            payee_id: freelancer_id,
            state: EngagementState::InProgress,
        })
        .await;

    let payment = node
        .create_escrow(&hirer.token, Decimal::from(100), job)
        .await?;
    info!(payment_id = %payment.id, "Escrowed 100");
    node.release_escrow(&hirer.token, payment.id).await?;

    let sheet = node.balance(&freelancer.token, freelancer_id).await?;
    info!(balance = %sheet.balance, "Balance after release");

    let destination = WalletAddress::from_verifying_key(&freelancer_key.verifying_key());
    let tx = node
        .request_withdrawal(&freelancer.token, Decimal::from(40), destination.as_str())
        .await?;
    info!(transaction_id = %tx.id, status = ?tx.status, "Withdrew 40");

    match node
        .request_withdrawal(&freelancer.token, Decimal::from(70), destination.as_str())
        .await
    {
        Ok(tx) => bail!("overdraft accepted: {:?}", tx.status),
        Err(e) => info!(code = e.code(), "Withdrawal of 70 refused"),
    }

    let sheet = node.balance(&freelancer.token, freelancer_id).await?;
    println!("{}", serde_json::to_string_pretty(&sheet)?);

    let health = node.health_check().await?;
    info!(
        healthy = health.healthy,
        accounts = health.accounts,
        events = health.events_published,
        "Demo finished"
    );

    // Let the dispatcher drain before exiting
    tokio::task::yield_now().await;
    dispatcher.abort();
    maintenance.abort();
    Ok(())
}

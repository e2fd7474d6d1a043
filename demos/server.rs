//! Example: Votifier server accepting v1 and v2 votes
//!
//! Generates an RSA key and a v2 token, prints both for the listing site,
//! and logs every vote it receives.
//!
//! Run with: `cargo run --example server -- --address 127.0.0.1:8192`

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::RsaPrivateKey;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use votifier_protocol::config::VotifierConfig;
use votifier_protocol::core::keys::encode_public_key;
use votifier_protocol::core::{CredentialRegistry, ProtocolVersion, ReceiverRecord, StaticToken, Vote};
use votifier_protocol::server::Server;
use votifier_protocol::utils::logging::init_logging;

#[derive(Debug, Parser)]
#[command(about = "Run a Votifier server that logs received votes")]
struct Args {
    /// TOML configuration file; defaults are used when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(long)]
    address: Option<String>,

    /// v2 token; a random one is generated when absent
    #[arg(long)]
    token: Option<String>,

    /// RSA modulus size for the v1 key
    #[arg(long, default_value_t = 2048)]
    bits: usize,

    /// Also write the base64 public key to this file
    #[arg(long)]
    public_key_out: Option<PathBuf>,
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => VotifierConfig::from_file(path)?,
        None => VotifierConfig::default(),
    };
    if let Some(address) = args.address {
        config.server.address = address;
    }
    config.validate_strict()?;
    init_logging(&config.logging);

    let bits = args.bits;
    let key = tokio::task::spawn_blocking(move || RsaPrivateKey::new(&mut OsRng, bits)).await??;
    let public_key = encode_public_key(&key.to_public_key())?;
    let token = args.token.unwrap_or_else(random_token);

    println!("v1 public key: {public_key}");
    println!("v2 token:      {token}");
    if let Some(path) = &args.public_key_out {
        std::fs::write(path, &public_key)?;
        println!("public key written to {}", path.display());
    }

    let registry = CredentialRegistry::new(vec![ReceiverRecord::new("default")
        .with_private_key(key)
        .with_token_lookup(StaticToken::new(token))]);
    let server = Server::new(
        registry,
        |vote: Vote, version: ProtocolVersion, site: &&str| -> Result<(), String> {
            info!(
                site = *site,
                %version,
                service = vote.service_name(),
                username = vote.username(),
                address = vote.address(),
                timestamp = vote.timestamp(),
                "Vote received"
            );
            Ok(())
        },
    )
    .with_config(config.server.clone());

    let listener = TcpListener::bind(&config.server.address).await?;
    info!(address = %listener.local_addr()?, "Listening for votes");

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    server.serve_with_shutdown(listener, shutdown_rx).await?;
    Ok(())
}

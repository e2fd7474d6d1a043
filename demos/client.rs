//! Example: send one vote to a Votifier server
//!
//! Run with a token for v2:
//! `cargo run --example client -- --token <token> --username steve`
//!
//! or with the server's public key file for v1:
//! `cargo run --example client -- --public-key-file key.txt --username steve`

use clap::Parser;
use std::path::PathBuf;
use votifier_protocol::client::{V1Client, V2Client, VoteClient};
use votifier_protocol::config::VotifierConfig;
use votifier_protocol::core::keys::decode_public_key;
use votifier_protocol::core::Vote;
use votifier_protocol::utils::logging::init_logging;

#[derive(Debug, Parser)]
#[command(about = "Send a single vote to a Votifier server")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:8192")]
    address: String,

    /// Send over v1, encrypting for the base64 public key in this file
    #[arg(long, conflicts_with = "token", required_unless_present = "token")]
    public_key_file: Option<PathBuf>,

    /// Send over v2, signing with this token
    #[arg(long)]
    token: Option<String>,

    #[arg(long, default_value = "demo-list")]
    service: String,

    #[arg(long)]
    username: String,

    /// Address reported for the voter
    #[arg(long, default_value = "127.0.0.1")]
    voter_address: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = VotifierConfig::default();
    config.client.address = args.address;
    init_logging(&config.logging);

    let client: Box<dyn VoteClient> = match (&args.public_key_file, args.token) {
        (Some(path), _) => {
            let key = decode_public_key(&std::fs::read_to_string(path)?)?;
            Box::new(V1Client::from_config(&config.client, key))
        }
        (None, Some(token)) => Box::new(V2Client::from_config(&config.client, token)),
        (None, None) => return Err("either --public-key-file or --token is required".into()),
    };

    let vote = Vote::new(args.service, args.username, args.voter_address);
    client.send_vote(&vote).await?;
    println!("sent: {vote}");
    Ok(())
}

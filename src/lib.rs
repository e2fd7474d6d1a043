//! # votifier-protocol
//!
//! Votifier vote notifications for Rust: an async server that accepts both
//! protocol generations on one port, and clients for each.
//!
//! - **v1**: the vote is RSA PKCS#1 v1.5 encrypted for the server's public
//!   key. Fire and forget.
//! - **v2**: the server greets every connection with a random challenge; the
//!   client signs the vote plus that challenge with HMAC-SHA256 under a
//!   shared token and gets a JSON verdict back.
//!
//! A server holds a [`CredentialRegistry`] of receiver records, each with
//! its own key and/or token lookup and a metadata value. The first record
//! that accepts a message wins, and its metadata is passed to the
//! [`VoteHandler`] together with the vote.
//!
//! ## Modules
//! - [`core`]: vote model, v1/v2 codecs, registry, stream framing
//! - [`server`]: accept loop and per-connection state machine
//! - [`client`]: [`V1Client`] and [`V2Client`]
//! - [`config`]: TOML configuration and protocol constants
//! - [`error`]: error types
//! - [`utils`]: logging setup, metrics, timeouts

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod server;
pub mod utils;

pub use client::{V1Client, V2Client, VoteClient};
pub use config::VotifierConfig;
pub use crate::core::{CredentialRegistry, ProtocolVersion, ReceiverRecord, StaticToken, Vote};
pub use error::{Result, VotifierError};
pub use server::{Server, VoteHandler};

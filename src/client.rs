//! # Votifier Clients
//!
//! Outbound counterparts of the server: [`V1Client`] encrypts the vote for
//! the server's RSA public key, [`V2Client`] signs it with a shared token and
//! the challenge from the server's greeting.
//!
//! Every send makes a fresh connection: connect within `connect_timeout`,
//! then finish the exchange within `io_timeout`. Nothing is retried.
//!
//! ## Example
//! ```rust,no_run
//! use votifier_protocol::client::{V2Client, VoteClient};
//! use votifier_protocol::core::Vote;
//!
//! # async fn run() -> votifier_protocol::error::Result<()> {
//! let client = V2Client::new("127.0.0.1:8192", "secret");
//! client.send_vote(&Vote::new("my-list", "steve", "203.0.113.7")).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use crate::core::codec::{ClientCodec, ServerMessage};
use crate::core::vote::Vote;
use crate::core::{v1, v2};
use crate::error::{constants, Result, VotifierError};
use crate::utils::metrics::Timer;
use crate::utils::timeout::{with_timeout_error, CLIENT_CONNECT_TIMEOUT, CLIENT_IO_TIMEOUT};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rsa::RsaPublicKey;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

/// How long the v1 client waits for a greeting it has no use for
const GREETING_GRACE: Duration = Duration::from_millis(250);

/// Longest greeting the v1 client bothers to read
const MAX_GREETING_LEN: usize = 256;

/// Anything that can deliver a vote to a Votifier server.
#[async_trait]
pub trait VoteClient: Send + Sync {
    async fn send_vote(&self, vote: &Vote) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    connect: Duration,
    io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: CLIENT_CONNECT_TIMEOUT,
            io: CLIENT_IO_TIMEOUT,
        }
    }
}

impl From<&ClientConfig> for Timeouts {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            io: config.io_timeout,
        }
    }
}

async fn connect(address: &str, timeout: Duration) -> Result<TcpStream> {
    with_timeout_error(
        async {
            let stream = TcpStream::connect(address).await?;
            Ok(stream)
        },
        timeout,
    )
    .await
}

/// Sends RSA-encrypted v1 votes. The server never acknowledges them.
#[derive(Debug, Clone)]
pub struct V1Client {
    address: String,
    public_key: RsaPublicKey,
    timeouts: Timeouts,
}

impl V1Client {
    pub fn new(address: impl Into<String>, public_key: RsaPublicKey) -> Self {
        Self {
            address: address.into(),
            public_key,
            timeouts: Timeouts::default(),
        }
    }

    /// Address and timeouts taken from `config`.
    pub fn from_config(config: &ClientConfig, public_key: RsaPublicKey) -> Self {
        Self {
            address: config.address.clone(),
            public_key,
            timeouts: config.into(),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.timeouts = Timeouts { connect, io };
        self
    }
}

#[async_trait]
impl VoteClient for V1Client {
    #[instrument(skip_all, fields(address = %self.address, service = vote.service_name()))]
    async fn send_vote(&self, vote: &Vote) -> Result<()> {
        let _timer = Timer::start("send_vote_v1");
        let ciphertext = v1::encode(vote, &self.public_key)?;
        let mut stream = connect(&self.address, self.timeouts.connect).await?;
        let grace = GREETING_GRACE.min(self.timeouts.io);

        with_timeout_error(
            async {
                discard_greeting(&mut stream, grace).await;
                stream.write_all(&ciphertext).await?;
                stream.shutdown().await?;
                discard_until_closed(&mut stream, grace).await;
                Ok(())
            },
            self.timeouts.io,
        )
        .await
    }
}

/// Read whatever greeting arrives within `grace` and drop it. Closing with
/// unread data would reset the connection before the server reads the vote;
/// a missing, long or broken greeting is not an error.
async fn discard_greeting(stream: &mut TcpStream, grace: Duration) {
    let read = async {
        let mut greeting = Vec::with_capacity(64);
        let mut chunk = [0u8; 64];
        while !greeting.contains(&b'\n') && greeting.len() < MAX_GREETING_LEN {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => greeting.extend_from_slice(&chunk[..n]),
            }
        }
        greeting.len()
    };

    match tokio::time::timeout(grace, read).await {
        Ok(len) => debug!(len, "Greeting discarded"),
        Err(_) => debug!("No greeting, sending anyway"),
    }
}

/// Give the server `grace` to close first so that leftover input never
/// turns our close into a reset.
async fn discard_until_closed(stream: &mut TcpStream, grace: Duration) {
    let mut sink = [0u8; 64];
    let _ = tokio::time::timeout(grace, async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

/// Sends challenge-bound, HMAC-signed v2 votes and reads the server's verdict.
#[derive(Clone)]
pub struct V2Client {
    address: String,
    token: String,
    timeouts: Timeouts,
}

impl V2Client {
    pub fn new(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: token.into(),
            timeouts: Timeouts::default(),
        }
    }

    /// Address and timeouts taken from `config`.
    pub fn from_config(config: &ClientConfig, token: impl Into<String>) -> Self {
        Self {
            address: config.address.clone(),
            token: token.into(),
            timeouts: config.into(),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.timeouts = Timeouts { connect, io };
        self
    }
}

impl fmt::Debug for V2Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V2Client")
            .field("address", &self.address)
            .field("token", &"<redacted>")
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[async_trait]
impl VoteClient for V2Client {
    #[instrument(skip_all, fields(address = %self.address, service = vote.service_name()))]
    async fn send_vote(&self, vote: &Vote) -> Result<()> {
        let _timer = Timer::start("send_vote_v2");
        let stream = connect(&self.address, self.timeouts.connect).await?;

        with_timeout_error(
            async {
                let mut framed = Framed::new(stream, ClientCodec::new());

                let challenge = match framed.next().await {
                    Some(Ok(ServerMessage::Greeting { challenge })) => challenge,
                    Some(Ok(ServerMessage::Response(_))) => {
                        return Err(VotifierError::Protocol(constants::ERR_NOT_V2_SERVER.into()))
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(VotifierError::ConnectionClosed),
                };
                debug!(%challenge, "Received challenge");

                let frame = v2::encode(vote, &self.token, &challenge)?;
                framed.send(frame).await?;

                match framed.next().await {
                    Some(Ok(ServerMessage::Response(response))) => {
                        debug!(status = %response.status, "Server responded");
                        response.into_result()
                    }
                    Some(Ok(ServerMessage::Greeting { .. })) => {
                        Err(VotifierError::Protocol(constants::ERR_RESPONSE_NOT_JSON.into()))
                    }
                    Some(Err(e)) => Err(e),
                    None => Err(VotifierError::ConnectionClosed),
                }
            },
            self.timeouts.io,
        )
        .await
    }
}

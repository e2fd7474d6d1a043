//! # Votifier Server
//!
//! Accepts TCP connections and runs each one on its own task. A connection
//! greets the peer with a fresh challenge, reads one v1 or v2 message,
//! matches it against the [`CredentialRegistry`] and hands the vote, its
//! protocol version and the matched record's metadata to the
//! [`VoteHandler`].
//!
//! ## Example
//! ```rust,no_run
//! use votifier_protocol::core::{CredentialRegistry, ProtocolVersion, ReceiverRecord, StaticToken, Vote};
//! use votifier_protocol::server::Server;
//!
//! # async fn run() -> votifier_protocol::error::Result<()> {
//! let registry = CredentialRegistry::new(vec![
//!     ReceiverRecord::new("main").with_token_lookup(StaticToken::new("secret")),
//! ]);
//! let server = Server::new(
//!     registry,
//!     |vote: Vote, version: ProtocolVersion, _site: &&str| -> Result<(), String> {
//!         println!("{version} vote from {}", vote.username());
//!         Ok(())
//!     },
//! );
//! server.listen_and_serve("0.0.0.0:8192").await
//! # }
//! ```

pub mod connection;

use crate::config::ServerConfig;
use crate::core::challenge::{ChallengeSource, OsChallengeSource};
use crate::core::registry::CredentialRegistry;
use crate::core::vote::{ProtocolVersion, Vote};
use crate::error::{HandlerError, Result};
use crate::utils::metrics::Metrics;
use connection::Connection;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

pub use connection::ConnectionState;

/// Application callback for accepted votes.
///
/// Called once per authenticated vote, on the blocking thread pool. An `Err`
/// or a panic is reported to v2 peers as `cause: "panic"` and swallowed for
/// v1 peers; either way only the current connection is affected.
pub trait VoteHandler<M>: Send + Sync {
    fn on_vote(&self, vote: Vote, version: ProtocolVersion, metadata: &M) -> std::result::Result<(), HandlerError>;
}

impl<M, F, E> VoteHandler<M> for F
where
    F: Fn(Vote, ProtocolVersion, &M) -> std::result::Result<(), E> + Send + Sync,
    E: fmt::Display,
{
    fn on_vote(&self, vote: Vote, version: ProtocolVersion, metadata: &M) -> std::result::Result<(), HandlerError> {
        self(vote, version, metadata).map_err(HandlerError::failed)
    }
}

/// Everything a connection task needs, cheap to clone.
pub(crate) struct ServerContext<M> {
    pub(crate) registry: Arc<CredentialRegistry<M>>,
    pub(crate) handler: Arc<dyn VoteHandler<M>>,
    pub(crate) challenges: Arc<dyn ChallengeSource>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) v1_block_lens: Vec<usize>,
}

impl<M> Clone for ServerContext<M> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            handler: self.handler.clone(),
            challenges: self.challenges.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            v1_block_lens: self.v1_block_lens.clone(),
        }
    }
}

/// A Votifier server for receiver records carrying metadata `M`.
pub struct Server<M> {
    ctx: ServerContext<M>,
}

impl<M: Send + Sync + 'static> Server<M> {
    /// Server with default configuration and OS-backed challenges.
    pub fn new(registry: CredentialRegistry<M>, handler: impl VoteHandler<M> + 'static) -> Self {
        if registry.is_empty() {
            warn!("Server created without receiver records; every vote will be rejected");
        }
        let v1_block_lens = registry.v1_block_lens();

        Self {
            ctx: ServerContext {
                registry: Arc::new(registry),
                handler: Arc::new(handler),
                challenges: Arc::new(OsChallengeSource),
                metrics: Arc::new(Metrics::new()),
                config: Arc::new(ServerConfig::default()),
                v1_block_lens,
            },
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.ctx.config = Arc::new(config);
        self
    }

    pub fn with_challenge_source(mut self, source: impl ChallengeSource + 'static) -> Self {
        self.ctx.challenges = Arc::new(source);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Counters shared with every connection this server spawns.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.metrics.clone()
    }

    /// Bind `address` and serve until accepting fails.
    #[instrument(skip(self))]
    pub async fn listen_and_serve(&self, address: &str) -> Result<()> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "Votifier server listening");
        self.serve(listener).await
    }

    /// Accept connections until `accept` fails, spawning one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.map_err(|e| {
                error!(error = %e, "Error accepting connection");
                e
            })?;
            self.spawn_connection(stream, peer);
        }
    }

    /// Like [`serve`](Self::serve), but also stops when `shutdown_rx` fires
    /// or its sender is dropped. The listener is closed first, then in-flight
    /// connections get up to `shutdown_timeout` to finish.
    pub async fn serve_with_shutdown(&self, listener: TcpListener, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down server. Waiting for connections to close...");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        drop(listener);
        self.drain().await;
        self.ctx.metrics.log_metrics();
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "New connection established");
        let connection = Connection::new(self.ctx.clone(), peer);
        tokio::spawn(connection.run(stream));
    }

    async fn drain(&self) {
        let timeout = tokio::time::sleep(self.ctx.config.shutdown_timeout);
        tokio::pin!(timeout);

        loop {
            let connections = self.ctx.metrics.active();
            if connections == 0 {
                info!("All connections closed, shutting down");
                return;
            }

            tokio::select! {
                _ = &mut timeout => {
                    warn!(connections, "Shutdown timeout reached, abandoning connections");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    debug!(connections, "Waiting for connections to close");
                }
            }
        }
    }
}

impl<M> fmt::Debug for Server<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("records", &self.ctx.registry.records().len())
            .field("v1_block_lens", &self.ctx.v1_block_lens)
            .field("config", &self.ctx.config)
            .finish()
    }
}

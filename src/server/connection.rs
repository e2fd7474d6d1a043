//! One accepted connection, from greeting to close.
//!
//! Every I/O operation on the socket shares a single deadline fixed when the
//! connection starts. Decoding and the vote handler run on the blocking pool,
//! so RSA work does not stall the reactor and a panicking handler only takes
//! down its own task.

use crate::core::codec::{Inbound, Outbound, ServerCodec};
use crate::core::v2::{V2Response, CAUSE_DECODE, CAUSE_PANIC};
use crate::core::vote::{ProtocolVersion, Vote};
use crate::error::{constants, DecodeError, HandlerError, Result, VotifierError};
use crate::server::ServerContext;
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_deadline;
use futures::{SinkExt, StreamExt};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn, Span};

/// Where a connection is in its single request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Challenge generated, greeting being written
    Greeting,
    /// Waiting for the client's message
    AwaitMessage,
    /// A v1 vote decrypted and matched a record
    DecodedV1,
    /// A v2 vote authenticated and matched a record
    DecodedV2,
    /// Decode, auth or handler failure
    Failed,
    /// Writing the v2 response
    Responding,
    Closed,
}

type ServerFramed = Framed<TcpStream, ServerCodec>;

/// Decrements the active connection count however the task ends.
struct ActiveConnection(Arc<Metrics>);

impl ActiveConnection {
    fn new(metrics: Arc<Metrics>) -> Self {
        metrics.connection_established();
        Self(metrics)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

pub(crate) struct Connection<M> {
    ctx: ServerContext<M>,
    peer: SocketAddr,
    state: ConnectionState,
}

impl<M: Send + Sync + 'static> Connection<M> {
    pub(crate) fn new(ctx: ServerContext<M>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            peer,
            state: ConnectionState::Greeting,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(from = ?self.state, to = ?next, "Connection state changed");
        self.state = next;
    }

    /// Drive the connection to completion. Never fails: every error ends
    /// this connection only and is logged and counted here.
    #[instrument(name = "connection", skip_all, fields(peer = %self.peer))]
    pub(crate) async fn run(mut self, stream: TcpStream) {
        let _active = ActiveConnection::new(self.ctx.metrics.clone());
        let deadline = Instant::now() + self.ctx.config.connection_timeout;

        if let Err(e) = self.exchange(stream, deadline).await {
            if e.is_transport() {
                self.ctx.metrics.transport_error();
                debug!(error = %e, state = ?self.state, "Connection ended early");
            } else {
                warn!(error = %e, state = ?self.state, "Connection failed");
            }
        }

        self.transition(ConnectionState::Closed);
    }

    async fn exchange(&mut self, stream: TcpStream, deadline: Instant) -> Result<()> {
        let challenge = self.ctx.challenges.next_challenge()?;
        let codec = ServerCodec::new(self.ctx.v1_block_lens.clone(), self.ctx.config.max_v2_body);
        let mut framed = Framed::new(stream, codec);

        with_deadline(framed.send(Outbound::Greeting(challenge.clone())), deadline).await?;
        self.transition(ConnectionState::AwaitMessage);

        let (version, decoded) = loop {
            let inbound = with_deadline(async { framed.next().await.transpose() }, deadline).await;
            let inbound = match inbound {
                Ok(Some(inbound)) => inbound,
                Ok(None) => return Err(VotifierError::ConnectionClosed),
                // Framing rejected before a full message arrived: always v2
                Err(e) if e.is_decode() => {
                    self.reject_decode(&e);
                    return self.respond(&mut framed, decode_response(), deadline).await;
                }
                Err(e) => return Err(e),
            };

            match inbound {
                Inbound::V1 { block, more } => {
                    let registry = self.ctx.registry.clone();
                    let len = block.len();
                    let decoded = blocking(move || registry.find_v1(&block)).await;
                    if more && decoded.is_err() {
                        debug!(len, "No v1 key of this size matched, reading on");
                        continue;
                    }
                    break (ProtocolVersion::V1, decoded);
                }
                Inbound::V2(frame) => {
                    let registry = self.ctx.registry.clone();
                    let challenge = challenge.clone();
                    let decoded = blocking(move || registry.find_v2(&frame, &challenge)).await;
                    break (ProtocolVersion::V2, decoded);
                }
            }
        };

        let (vote, record) = match decoded {
            Ok(matched) => matched,
            Err(e) => {
                self.reject_decode(&e);
                return match version {
                    ProtocolVersion::V1 => Ok(()),
                    ProtocolVersion::V2 => self.respond(&mut framed, decode_response(), deadline).await,
                };
            }
        };

        self.transition(match version {
            ProtocolVersion::V1 => ConnectionState::DecodedV1,
            ProtocolVersion::V2 => ConnectionState::DecodedV2,
        });
        info!(
            %version,
            service = vote.service_name(),
            username = vote.username(),
            record,
            "Vote received"
        );

        let response = match self.invoke_handler(vote, version, record).await {
            Ok(()) => {
                self.ctx.metrics.vote_accepted(version);
                V2Response::ok()
            }
            Err(e) => {
                self.transition(ConnectionState::Failed);
                self.ctx.metrics.handler_fault();
                warn!(error = %e, %version, "Vote handler failed");
                V2Response::error(CAUSE_PANIC, e.to_string())
            }
        };

        match version {
            ProtocolVersion::V1 => Ok(()),
            ProtocolVersion::V2 => self.respond(&mut framed, response, deadline).await,
        }
    }

    fn reject_decode(&mut self, err: &VotifierError) {
        self.transition(ConnectionState::Failed);
        self.ctx.metrics.decode_failure();
        debug!(error = %err, "Vote rejected");
    }

    async fn respond(&mut self, framed: &mut ServerFramed, response: V2Response, deadline: Instant) -> Result<()> {
        self.transition(ConnectionState::Responding);
        with_deadline(framed.send(Outbound::Response(response)), deadline).await
    }

    async fn invoke_handler(
        &self,
        vote: Vote,
        version: ProtocolVersion,
        record: usize,
    ) -> std::result::Result<(), HandlerError> {
        let registry = self.ctx.registry.clone();
        let handler = self.ctx.handler.clone();
        let span = Span::current();
        let _timer = Timer::start("vote_handler");

        let joined = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let metadata = registry.records()[record].metadata();
            handler.on_vote(vote, version, metadata)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(HandlerError::failed(e)),
        }
    }
}

/// Run CPU-bound decoding off the reactor. A panic surfaces as a decode
/// failure.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        work()
    })
    .await
    .map_err(|e| {
        debug!(error = %e, "Decode task failed");
        VotifierError::Decode(DecodeError::NoMatchingRecord)
    })?
}

/// Peers learn that decoding failed, not why.
fn decode_response() -> V2Response {
    V2Response::error(CAUSE_DECODE, constants::ERR_DECODE_GENERIC)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        constants::ERR_HANDLER_PANICKED.to_string()
    }
}

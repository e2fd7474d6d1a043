//! # Error Types
//!
//! Error handling for the Votifier protocol.
//!
//! This module defines every failure a connection, codec or client can run into,
//! from socket errors to authentication failures.
//!
//! ## Error Categories
//! - **Transport Errors**: dial, accept, read, write and deadline failures
//! - **Decode Errors**: malformed framing, JSON, field counts, bad tags
//! - **Auth Errors**: challenge or signature mismatch, unknown service
//! - **Handler Errors**: the embedding application's vote handler failed
//! - **Remote Errors**: a v2 server answered with `"status":"error"`
//!
//! Auth errors are folded into decode errors whenever they are reported to a
//! peer, so an attacker cannot tell a bad signature from a bad frame.
//!
//! ## Example Usage
//! ```rust
//! use votifier_protocol::error::{DecodeError, Result, VotifierError};
//! use tracing::error;
//!
//! fn check_tag(tag: &str) -> Result<()> {
//!     if tag != "VOTE" {
//!         return Err(DecodeError::BadTag(tag.to_string()).into());
//!     }
//!     Ok(())
//! }
//!
//! if let Err(e) = check_tag("NOPE") {
//!     error!(error = %e, "Rejected vote");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Message sent to v2 peers for every decode or auth failure
    pub const ERR_DECODE_GENERIC: &str = "unable to decode vote";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_TIMEOUT: &str = "Operation timed out";

    /// Greeting and response errors
    pub const ERR_NOT_V2_SERVER: &str = "not a v2 server";
    pub const ERR_GREETING_TOO_LONG: &str = "greeting line too long";
    pub const ERR_GREETING_NOT_UTF8: &str = "greeting is not valid UTF-8";
    pub const ERR_RESPONSE_NOT_JSON: &str = "response is not valid JSON";

    /// Encoding errors
    pub const ERR_NEWLINE_IN_FIELD: &str = "v1 vote fields must not contain a newline";
    pub const ERR_BODY_TOO_LARGE: &str = "v2 message body exceeds i16::MAX bytes";

    /// Handler errors
    pub const ERR_HANDLER_PANICKED: &str = "vote handler panicked";

    /// Challenge generation
    pub const ERR_CHALLENGE_RNG: &str = "secure random source failed";
}

/// Reasons an inbound message could not be turned into a [`Vote`](crate::core::vote::Vote).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("v2 magic mismatch: got {0:#06x}")]
    BadMagic(u16),

    #[error("message too short to carry a v2 header")]
    TruncatedHeader,

    #[error("invalid v2 body length: {0}")]
    InvalidLength(i16),

    #[error("v2 frame truncated: expected {expected} body bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("{0} trailing bytes after v2 frame")]
    TrailingBytes(usize),

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("invalid signature encoding: {0}")]
    Signature(String),

    #[error("RSA decryption failed")]
    Decryption,

    #[error("decrypted vote is not valid UTF-8")]
    NotUtf8,

    #[error("element count is invalid; wanted 6, got {0}")]
    FieldCount(usize),

    #[error("first element is incorrect; expected 'VOTE', got '{0}'")]
    BadTag(String),

    #[error("no receiver record accepted the vote")]
    NoMatchingRecord,
}

/// Authentication failures on an otherwise well-formed v2 message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("challenge invalid")]
    ChallengeMismatch,

    #[error("no token for service '{0}'")]
    UnknownService(String),

    #[error("signature invalid")]
    SignatureMismatch,
}

/// Failure raised by, or around, the application's vote handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Panicked(String),
}

impl HandlerError {
    /// Wrap any displayable application error.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

// VotifierError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum VotifierError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("remote server error: {cause}: {error}")]
    Remote { cause: String, error: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl VotifierError {
    /// True for decode and auth failures, the two kinds a v2 peer sees as `"decode"`.
    pub fn is_decode(&self) -> bool {
        matches!(self, VotifierError::Decode(_) | VotifierError::Auth(_))
    }

    /// True for socket-level failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            VotifierError::Io(_) | VotifierError::Timeout | VotifierError::ConnectionClosed
        )
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e.to_string())
    }
}

/// Type alias for Results using VotifierError
pub type Result<T> = std::result::Result<T, VotifierError>;

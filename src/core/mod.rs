//! # Core Protocol Components
//!
//! Vote model, the two wire codecs, credential matching and stream framing.
//!
//! ## Components
//! - **Vote**: the notification record and protocol version tag
//! - **v1**: RSA PKCS#1 v1.5 encrypted, newline-separated plaintext
//! - **v2**: challenge-bound, HMAC-SHA256 signed JSON in a binary frame
//! - **Registry**: ordered receiver records, first match wins
//! - **Codec**: `tokio_util` framing for server and client streams
//!
//! ## Wire Format
//! ```text
//! server -> client   "VOTIFIER 2 <challenge>\n"
//! client -> server   v1: RSA block (modulus size)
//!                    v2: [0x733A (2)] [Length (2)] [JSON body (Length)]
//! server -> client   v2 only: {"status":"ok"} | {"status":"error",...}
//! ```
//!
//! ## Security
//! - v2 bodies are capped at `i16::MAX` bytes before any allocation
//! - Signatures are compared in constant time
//! - Decode and auth failures look identical to the peer

pub mod challenge;
pub mod codec;
pub mod keys;
pub mod registry;
pub mod v1;
pub mod v2;
pub mod vote;

pub use challenge::{ChallengeSource, FixedChallenge, OsChallengeSource};
pub use registry::{CredentialRegistry, ReceiverRecord};
pub use v2::{ServiceTokens, StaticToken, TokenLookup, V2Response};
pub use vote::{ProtocolVersion, Vote};

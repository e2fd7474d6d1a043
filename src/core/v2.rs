//! v2 vote format: challenge-bound, HMAC-SHA256 signed JSON.
//!
//! ## Wire Format
//! ```text
//! [Magic 0x733A (i16 BE)] [Length (i16 BE)] [Body (Length bytes)]
//!
//! Body    = {"payload": "<Payload JSON text>", "signature": "<base64>"}
//! Payload = {"serviceName", "username", "address", "timestamp": i64 ms, "challenge"}
//! ```
//!
//! The signature is `HMAC-SHA256(token(serviceName), payload text)`. The
//! challenge is the one the server put in its greeting, so a captured
//! message cannot be replayed on another connection.
//!
//! Decoding is split in two: [`V2Message::parse`] checks framing and JSON
//! once, [`V2Message::verify`] checks challenge and signature against one
//! set of credentials. The registry parses once and verifies per record.

use crate::config::{MAX_V2_BODY, V2_MAGIC};
use crate::core::vote::Vote;
use crate::error::{constants, AuthError, DecodeError, Result, VotifierError};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

/// `cause` reported when a message fails to decode or authenticate
pub const CAUSE_DECODE: &str = "decode";

/// `cause` reported when the vote handler fails
pub const CAUSE_PANIC: &str = "panic";

/// Maps a service name to the shared secret used to sign its votes.
///
/// `None` means the service is unknown; its votes fail authentication.
pub trait TokenLookup: Send + Sync {
    fn token(&self, service_name: &str) -> Option<String>;
}

impl<F> TokenLookup for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn token(&self, service_name: &str) -> Option<String> {
        self(service_name)
    }
}

/// One token for every service.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenLookup for StaticToken {
    fn token(&self, _service_name: &str) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A token per service name. Unlisted services are rejected.
#[derive(Debug, Clone, Default)]
pub struct ServiceTokens {
    tokens: HashMap<String, String>,
}

impl ServiceTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the token for a service
    pub fn with_service(mut self, service_name: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(service_name.into(), token.into());
        self
    }
}

impl FromIterator<(String, String)> for ServiceTokens {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

impl TokenLookup for ServiceTokens {
    fn token(&self, service_name: &str) -> Option<String> {
        self.tokens.get(service_name).cloned()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    payload: String,
    #[serde(with = "base64_bytes")]
    signature: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    service_name: String,
    username: String,
    address: String,
    timestamp: i64,
    challenge: String,
}

/// A framed v2 message whose JSON has been parsed but not yet authenticated.
#[derive(Debug)]
pub struct V2Message {
    payload_text: String,
    signature: Vec<u8>,
    payload: Payload,
}

impl V2Message {
    /// Check magic, length and both JSON layers.
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        if bytes.len() >= 2 {
            let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
            if magic != V2_MAGIC {
                return Err(DecodeError::BadMagic(magic));
            }
        }
        if bytes.len() < 4 {
            return Err(DecodeError::TruncatedHeader);
        }

        let length = i16::from_be_bytes([bytes[2], bytes[3]]);
        if length < 0 {
            return Err(DecodeError::InvalidLength(length));
        }
        let expected = length as usize;
        let body = &bytes[4..];
        if body.len() < expected {
            return Err(DecodeError::TruncatedFrame {
                expected,
                actual: body.len(),
            });
        }
        if body.len() > expected {
            return Err(DecodeError::TrailingBytes(body.len() - expected));
        }

        let envelope: Envelope = serde_json::from_slice(body)?;
        let payload: Payload = serde_json::from_str(&envelope.payload)?;

        Ok(Self {
            payload_text: envelope.payload,
            signature: envelope.signature,
            payload,
        })
    }

    /// Service the sender claims to speak for. Not yet authenticated.
    pub fn service_name(&self) -> &str {
        &self.payload.service_name
    }

    /// Check the challenge and the signature under `lookup`.
    pub fn verify(
        &self,
        lookup: &dyn TokenLookup,
        challenge: &str,
    ) -> std::result::Result<Vote, AuthError> {
        if self.payload.challenge != challenge {
            return Err(AuthError::ChallengeMismatch);
        }

        let token = lookup
            .token(&self.payload.service_name)
            .ok_or_else(|| AuthError::UnknownService(self.payload.service_name.clone()))?;

        let mut mac = HmacSha256::new_from_slice(token.as_bytes())
            .map_err(|_| AuthError::SignatureMismatch)?;
        mac.update(self.payload_text.as_bytes());
        // verify_slice compares in constant time
        mac.verify_slice(&self.signature)
            .map_err(|_| AuthError::SignatureMismatch)?;

        Ok(Vote::with_timestamp(
            self.payload.service_name.as_str(),
            self.payload.username.as_str(),
            self.payload.address.as_str(),
            self.payload.timestamp.to_string(),
        ))
    }
}

/// Parse and authenticate a v2 message against one set of credentials.
pub fn decode(bytes: &[u8], lookup: &dyn TokenLookup, challenge: &str) -> Result<Vote> {
    let message = V2Message::parse(bytes)?;
    Ok(message.verify(lookup, challenge)?)
}

/// Sign and frame a vote for the connection that issued `challenge`.
#[instrument(skip(token), fields(service = vote.service_name()))]
pub fn encode(vote: &Vote, token: &str, challenge: &str) -> Result<Bytes> {
    let timestamp = vote.timestamp_millis().unwrap_or_else(|| {
        debug!(timestamp = vote.timestamp(), "Timestamp is not epoch millis, sending 0");
        0
    });

    let payload = Payload {
        service_name: vote.service_name().to_string(),
        username: vote.username().to_string(),
        address: vote.address().to_string(),
        timestamp,
        challenge: challenge.to_string(),
    };
    let payload_text = serde_json::to_string(&payload)
        .map_err(|e| VotifierError::Encode(format!("payload: {e}")))?;

    let signature = sign(token, &payload_text)?;

    let body = serde_json::to_vec(&Envelope {
        payload: payload_text,
        signature,
    })
    .map_err(|e| VotifierError::Encode(format!("envelope: {e}")))?;

    if body.len() > MAX_V2_BODY {
        return Err(VotifierError::Encode(constants::ERR_BODY_TOO_LARGE.into()));
    }

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u16(V2_MAGIC);
    frame.put_u16(body.len() as u16);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

fn sign(token: &str, payload_text: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(token.as_bytes())
        .map_err(|e| VotifierError::Encode(format!("HMAC key: {e}")))?;
    mac.update(payload_text.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Server reply to a v2 message.
///
/// Serialized as `{"status":"ok"}` or
/// `{"status":"error","cause":"decode"|"panic","error":"..."}`. Capitalized
/// keys are accepted when reading, as some servers emit them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2Response {
    #[serde(alias = "Status")]
    pub status: String,
    #[serde(default, alias = "Cause", skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, alias = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl V2Response {
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
            cause: None,
            error: None,
        }
    }

    pub fn error(cause: &str, error: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            cause: Some(cause.into()),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// `Ok(())` for an ok status, `VotifierError::Remote` otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        Err(VotifierError::Remote {
            cause: self.cause.unwrap_or_default(),
            error: self.error.unwrap_or_default(),
        })
    }
}

/// Byte arrays travel as standard padded base64 strings
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("invalid signature encoding: {e}")))
    }
}

//! Stream framing for both ends of a Votifier connection.
//!
//! [`ServerCodec`] turns the inbound byte stream into one complete v1 block
//! or v2 frame, and writes the greeting and v2 responses. [`ClientCodec`]
//! reads the greeting line and the JSON response, and writes raw message
//! bytes.
//!
//! Neither side assumes a message arrives in a single read: v2 frames are
//! assembled from their length field, v1 blocks from the receivers' modulus
//! sizes (or end of stream).

use crate::config::{GREETING_PREFIX, MAX_V2_BODY, V2_MAGIC};
use crate::core::v2::V2Response;
use crate::error::{constants, DecodeError, VotifierError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest greeting line a client will buffer
const MAX_GREETING_LEN: usize = 256;

/// A complete client message, split by the first two bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw RSA block (or whatever arrived before end of stream). While
    /// `more` is set a larger key size is still possible: the block is a
    /// copy of the buffered prefix and the bytes stay buffered.
    V1 { block: BytesMut, more: bool },
    /// Magic, length and body
    V2(BytesMut),
}

/// What the server writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// `VOTIFIER 2 <challenge>\n`
    Greeting(String),
    /// JSON reply to a v2 message
    Response(V2Response),
}

/// Server side framing.
#[derive(Debug, Clone)]
pub struct ServerCodec {
    v1_block_lens: Vec<usize>,
    /// How many of `v1_block_lens` have been handed out
    v1_offered: usize,
    max_v2_body: usize,
}

impl ServerCodec {
    /// `v1_block_lens` are the receivers' modulus sizes. When empty no
    /// receiver accepts v1 and non-magic input is rejected as a malformed
    /// v2 frame.
    pub fn new(mut v1_block_lens: Vec<usize>, max_v2_body: usize) -> Self {
        v1_block_lens.sort_unstable();
        v1_block_lens.dedup();
        Self {
            v1_block_lens,
            v1_offered: 0,
            max_v2_body: max_v2_body.min(MAX_V2_BODY),
        }
    }

    fn decode_v1(&mut self, src: &mut BytesMut) -> Option<Inbound> {
        let &size = self.v1_block_lens.get(self.v1_offered)?;
        if src.len() < size {
            return None;
        }
        self.v1_offered += 1;

        if self.v1_offered < self.v1_block_lens.len() {
            let block = BytesMut::from(&src[..size]);
            Some(Inbound::V1 { block, more: true })
        } else {
            let block = src.split_to(size);
            Some(Inbound::V1 { block, more: false })
        }
    }
}

impl Decoder for ServerCodec {
    type Item = Inbound;
    type Error = VotifierError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, VotifierError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([src[0], src[1]]);
        if magic == V2_MAGIC {
            if src.len() < 4 {
                return Ok(None);
            }
            let length = i16::from_be_bytes([src[2], src[3]]);
            if length < 0 || length as usize > self.max_v2_body {
                return Err(DecodeError::InvalidLength(length).into());
            }

            let total = 4 + length as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            return Ok(Some(Inbound::V2(src.split_to(total))));
        }

        if self.v1_block_lens.is_empty() {
            return Err(DecodeError::BadMagic(magic).into());
        }
        Ok(self.decode_v1(src))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, VotifierError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        // Peer stopped sending mid-message: hand over what we have and let
        // the codecs report what is wrong with it.
        let starts_with_magic = buf.len() >= 2 && buf[..2] == V2_MAGIC.to_be_bytes();
        if starts_with_magic || self.v1_block_lens.is_empty() {
            Ok(Some(Inbound::V2(buf.split())))
        } else {
            self.v1_offered = self.v1_block_lens.len();
            Ok(Some(Inbound::V1 {
                block: buf.split(),
                more: false,
            }))
        }
    }
}

impl Encoder<Outbound> for ServerCodec {
    type Error = VotifierError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), VotifierError> {
        match item {
            Outbound::Greeting(challenge) => {
                dst.reserve(GREETING_PREFIX.len() + challenge.len() + 1);
                dst.put_slice(GREETING_PREFIX.as_bytes());
                dst.put_slice(challenge.as_bytes());
                dst.put_u8(b'\n');
            }
            Outbound::Response(response) => {
                let json = serde_json::to_vec(&response)
                    .map_err(|e| VotifierError::Encode(format!("response: {e}")))?;
                dst.put_slice(&json);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    AwaitGreeting,
    AwaitResponse,
}

/// What a v2 client reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Challenge taken from the greeting line
    Greeting { challenge: String },
    Response(V2Response),
}

/// Client side framing.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    state: ClientState,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self {
            state: ClientState::AwaitGreeting,
        }
    }

    fn decode_greeting(&mut self, src: &mut BytesMut) -> Result<Option<ServerMessage>, VotifierError> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_GREETING_LEN {
                return Err(VotifierError::Protocol(constants::ERR_GREETING_TOO_LONG.into()));
            }
            return Ok(None);
        };

        let line = src.split_to(newline + 1);
        let line = std::str::from_utf8(&line[..newline])
            .map_err(|_| VotifierError::Protocol(constants::ERR_GREETING_NOT_UTF8.into()))?;
        let line = line.strip_suffix('\r').unwrap_or(line);

        let challenge = parse_greeting(line)?;
        self.state = ClientState::AwaitResponse;
        Ok(Some(ServerMessage::Greeting { challenge }))
    }

    fn decode_response(&mut self, src: &mut BytesMut) -> Result<Option<ServerMessage>, VotifierError> {
        let mut stream = serde_json::Deserializer::from_slice(src).into_iter::<V2Response>();
        match stream.next() {
            Some(Ok(response)) => {
                let consumed = stream.byte_offset();
                src.advance(consumed);
                Ok(Some(ServerMessage::Response(response)))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(VotifierError::Protocol(format!(
                "{}: {e}",
                constants::ERR_RESPONSE_NOT_JSON
            ))),
            None => Ok(None),
        }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the challenge from `VOTIFIER 2 <challenge>`.
///
/// Exactly three space-separated tokens are required; anything else means
/// the server does not speak v2.
pub fn parse_greeting(line: &str) -> Result<String, VotifierError> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 3 {
        return Err(VotifierError::Protocol(format!(
            "{}: greeting '{line}'",
            constants::ERR_NOT_V2_SERVER
        )));
    }
    Ok(parts[2].to_string())
}

impl Decoder for ClientCodec {
    type Item = ServerMessage;
    type Error = VotifierError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerMessage>, VotifierError> {
        match self.state {
            ClientState::AwaitGreeting => self.decode_greeting(src),
            ClientState::AwaitResponse => self.decode_response(src),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<ServerMessage>, VotifierError> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            buf.clear();
            return Ok(None);
        }

        let leftover = String::from_utf8_lossy(buf).into_owned();
        buf.clear();
        match self.state {
            ClientState::AwaitGreeting => Err(VotifierError::Protocol(format!(
                "{}: greeting '{leftover}'",
                constants::ERR_NOT_V2_SERVER
            ))),
            ClientState::AwaitResponse => Err(VotifierError::Protocol(format!(
                "{}: '{leftover}'",
                constants::ERR_RESPONSE_NOT_JSON
            ))),
        }
    }
}

impl Encoder<Bytes> for ClientCodec {
    type Error = VotifierError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), VotifierError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

//! Legacy v1 vote format.
//!
//! The plaintext is five newline-terminated fields:
//!
//! ```text
//! VOTE\n<service>\n<username>\n<address>\n<timestamp>\n
//! ```
//!
//! encrypted with RSA PKCS#1 v1.5 under the receiver's public key. There is
//! no framing; the ciphertext is exactly one modulus long. v1 peers never
//! get a response.

use crate::config::V1_TAG;
use crate::core::vote::Vote;
use crate::error::{constants, DecodeError, Result, VotifierError};
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use tracing::instrument;

/// Encrypt a vote for the holder of `public_key`.
///
/// # Errors
/// `VotifierError::Encode` if a field contains a newline or the plaintext
/// does not fit in one RSA block.
#[instrument(skip(public_key), fields(service = vote.service_name()))]
pub fn encode(vote: &Vote, public_key: &RsaPublicKey) -> Result<Vec<u8>> {
    if !vote.is_v1_safe() {
        return Err(VotifierError::Encode(constants::ERR_NEWLINE_IN_FIELD.into()));
    }

    let [service, username, address, timestamp] = vote.fields();
    let plaintext = [V1_TAG, service, username, address, timestamp, ""].join("\n");

    public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext.as_bytes())
        .map_err(|e| VotifierError::Encode(format!("RSA encryption failed: {e}")))
}

/// Decrypt and parse a v1 block.
pub fn decode(ciphertext: &[u8], private_key: &RsaPrivateKey) -> std::result::Result<Vote, DecodeError> {
    let plaintext = private_key
        .decrypt_blinded(&mut OsRng, Pkcs1v15Encrypt, ciphertext)
        .map_err(|_| DecodeError::Decryption)?;
    let plaintext = String::from_utf8(plaintext).map_err(|_| DecodeError::NotUtf8)?;

    let elements: Vec<&str> = plaintext.split('\n').collect();
    if elements.len() != 6 {
        return Err(DecodeError::FieldCount(elements.len()));
    }
    if elements[0] != V1_TAG {
        return Err(DecodeError::BadTag(elements[0].to_string()));
    }

    Ok(Vote::with_timestamp(
        elements[1],
        elements[2],
        elements[3],
        elements[4],
    ))
}

/// Size in bytes of every ciphertext produced for this key.
pub fn block_len(key: &impl PublicKeyParts) -> usize {
    key.size()
}

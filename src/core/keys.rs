//! Text encoding for v1 public keys.
//!
//! Listing sites are handed the server's public key as base64 of the DER
//! `SubjectPublicKeyInfo`, the format the Votifier plugin prints on startup.

use crate::error::{Result, VotifierError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::RsaPublicKey;

/// Encode a public key as base64 DER.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| VotifierError::Encode(format!("Failed to encode public key: {e}")))?;
    Ok(STANDARD.encode(der.as_bytes()))
}

/// Parse a base64 DER public key. Surrounding whitespace is ignored.
pub fn decode_public_key(text: &str) -> Result<RsaPublicKey> {
    let der = STANDARD
        .decode(text.trim())
        .map_err(|e| VotifierError::ConfigError(format!("Public key is not base64: {e}")))?;
    RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| VotifierError::ConfigError(format!("Invalid public key: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    #[test]
    fn test_public_key_text_roundtrip() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap().to_public_key();
        let text = encode_public_key(&key).unwrap();
        let parsed = decode_public_key(&format!("{text}\n")).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_garbage_key_rejected() {
        assert!(decode_public_key("not base64!").is_err());
        assert!(decode_public_key("aGVsbG8=").is_err());
    }
}

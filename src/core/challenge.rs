//! Per-connection challenge generation.
//!
//! The challenge binds a v2 message to the connection it was sent on. It is
//! drawn from an injected [`ChallengeSource`] so servers never share hidden
//! random state and tests can pin it.

use crate::config::CHALLENGE_BYTES;
use crate::error::{constants, Result, VotifierError};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Produces one challenge per accepted connection.
pub trait ChallengeSource: Send + Sync {
    fn next_challenge(&self) -> Result<String>;
}

/// 24 bytes from the operating system CSPRNG, base64 without padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsChallengeSource;

impl ChallengeSource for OsChallengeSource {
    fn next_challenge(&self) -> Result<String> {
        let mut bytes = [0u8; CHALLENGE_BYTES];
        OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
            VotifierError::Io(std::io::Error::other(format!(
                "{}: {e}",
                constants::ERR_CHALLENGE_RNG
            )))
        })?;
        Ok(STANDARD_NO_PAD.encode(bytes))
    }
}

/// Always hands out the same challenge. For tests only.
#[derive(Debug, Clone)]
pub struct FixedChallenge(pub String);

impl ChallengeSource for FixedChallenge {
    fn next_challenge(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_challenge_shape() {
        let challenge = OsChallengeSource.next_challenge().unwrap();
        // 24 bytes -> 32 base64 chars, no padding, no spaces or newlines
        assert_eq!(challenge.len(), 32);
        assert!(!challenge.contains(' '));
        assert!(!challenge.contains('\n'));
        assert!(!challenge.ends_with('='));
    }

    #[test]
    fn test_challenges_are_unique() {
        let seen: HashSet<String> = (0..1000)
            .map(|_| OsChallengeSource.next_challenge().unwrap())
            .collect();
        assert_eq!(seen.len(), 1000);
    }
}

//! Receiver records and multi-credential matching.
//!
//! One server can accept votes for several independent trust domains: each
//! [`ReceiverRecord`] carries its own RSA key and/or token lookup plus an
//! opaque metadata value. Records are tried in insertion order and the first
//! one that decodes the message wins; its metadata reaches the vote handler
//! so the application knows which domain the vote belongs to.

use crate::core::v1;
use crate::core::v2::{TokenLookup, V2Message};
use crate::core::vote::Vote;
use crate::error::{DecodeError, Result, VotifierError};
use rsa::RsaPrivateKey;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Credentials for one trust domain.
pub struct ReceiverRecord<M> {
    private_key: Option<RsaPrivateKey>,
    token_lookup: Option<Arc<dyn TokenLookup>>,
    metadata: M,
}

impl<M> ReceiverRecord<M> {
    /// A record that accepts nothing until a key or token lookup is added.
    pub fn new(metadata: M) -> Self {
        Self {
            private_key: None,
            token_lookup: None,
            metadata,
        }
    }

    /// Accept v1 votes encrypted for this key
    pub fn with_private_key(mut self, key: RsaPrivateKey) -> Self {
        self.private_key = Some(key);
        self
    }

    /// Accept v2 votes signed with the tokens this lookup returns
    pub fn with_token_lookup(mut self, lookup: impl TokenLookup + 'static) -> Self {
        self.token_lookup = Some(Arc::new(lookup));
        self
    }

    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.private_key.as_ref()
    }

    pub fn token_lookup(&self) -> Option<&dyn TokenLookup> {
        self.token_lookup.as_deref()
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }
}

impl<M: fmt::Debug> fmt::Debug for ReceiverRecord<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverRecord")
            .field("v1", &self.private_key.is_some())
            .field("v2", &self.token_lookup.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Ordered set of receiver records, shared read-only by every connection.
#[derive(Debug)]
pub struct CredentialRegistry<M> {
    records: Vec<ReceiverRecord<M>>,
}

impl<M> CredentialRegistry<M> {
    pub fn new(records: Vec<ReceiverRecord<M>>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[ReceiverRecord<M>] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct modulus sizes of the v1 records, smallest first. A v1 block
    /// is complete once it reaches one of these. Empty when no record
    /// accepts v1.
    pub fn v1_block_lens(&self) -> Vec<usize> {
        let mut lens: Vec<usize> = self
            .records
            .iter()
            .filter_map(|r| r.private_key.as_ref())
            .map(v1::block_len)
            .collect();
        lens.sort_unstable();
        lens.dedup();
        lens
    }

    /// Try every v1-capable record in order.
    pub fn match_v1(&self, ciphertext: &[u8]) -> Result<(Vote, &ReceiverRecord<M>)> {
        let (vote, index) = self.find_v1(ciphertext)?;
        Ok((vote, &self.records[index]))
    }

    /// Parse once, then verify against every v2-capable record in order.
    pub fn match_v2(&self, bytes: &[u8], challenge: &str) -> Result<(Vote, &ReceiverRecord<M>)> {
        let (vote, index) = self.find_v2(bytes, challenge)?;
        Ok((vote, &self.records[index]))
    }

    /// Like [`match_v1`](Self::match_v1), returning the record's position.
    ///
    /// Only keys whose modulus matches the ciphertext length are tried; a
    /// block no key is sized for is tried against every key.
    #[instrument(skip_all, fields(len = ciphertext.len()))]
    pub(crate) fn find_v1(&self, ciphertext: &[u8]) -> Result<(Vote, usize)> {
        let sized = self
            .records
            .iter()
            .filter_map(|r| r.private_key.as_ref())
            .any(|key| v1::block_len(key) == ciphertext.len());

        for (index, record) in self.records.iter().enumerate() {
            let Some(key) = record.private_key.as_ref() else {
                continue;
            };
            if sized && v1::block_len(key) != ciphertext.len() {
                continue;
            }
            match v1::decode(ciphertext, key) {
                Ok(vote) => return Ok((vote, index)),
                Err(e) => debug!(record = index, error = %e, "v1 record rejected vote"),
            }
        }
        Err(VotifierError::Decode(DecodeError::NoMatchingRecord))
    }

    #[instrument(skip_all, fields(len = bytes.len()))]
    pub(crate) fn find_v2(&self, bytes: &[u8], challenge: &str) -> Result<(Vote, usize)> {
        let message = V2Message::parse(bytes)?;

        for (index, record) in self.records.iter().enumerate() {
            let Some(lookup) = record.token_lookup.as_deref() else {
                continue;
            };
            match message.verify(lookup, challenge) {
                Ok(vote) => return Ok((vote, index)),
                Err(e) => debug!(
                    record = index,
                    service = message.service_name(),
                    error = %e,
                    "v2 record rejected vote"
                ),
            }
        }
        Err(VotifierError::Decode(DecodeError::NoMatchingRecord))
    }
}

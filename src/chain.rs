//! SHA-256 hash chain over behavioral events
//!
//! Each event hashes `previous_hash || timestamp || event_type || entropy_score`
//! so that any retroactive edit breaks every later link.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::identity::SignatureVerifier;
use crate::types::{EventType, NotabotEvent};

/// Size of a SHA-256 digest in bytes
pub const HASH_SIZE: usize = 32;

/// Raw digest bytes
pub type Hash = [u8; HASH_SIZE];

/// Previous-hash sentinel for the first event in a chain
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors raised while verifying a chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("malformed hash at index {index}: {value}")]
    MalformedHash { index: usize, value: String },

    #[error("chain broken at index {index}: expected previous hash {expected}, got {actual}")]
    ChainBroken {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("hash mismatch at index {index}: stored {stored}, computed {computed}")]
    HashMismatch {
        index: usize,
        stored: String,
        computed: String,
    },

    #[error("invalid signature at index {index}")]
    InvalidSignature { index: usize },
}

impl ChainError {
    /// Index of the first event the error invalidates
    pub fn index(&self) -> usize {
        match self {
            ChainError::MalformedHash { index, .. }
            | ChainError::ChainBroken { index, .. }
            | ChainError::HashMismatch { index, .. }
            | ChainError::InvalidSignature { index } => *index,
        }
    }
}

/// Parse a hex digest
pub fn decode_hash(value: &str) -> Option<Hash> {
    let bytes = hex::decode(value).ok()?;
    bytes.try_into().ok()
}

/// Compute the digest linking an event to its predecessor
///
/// Layout: `previous_hash (32) || timestamp_millis (i64 BE) ||
/// len(event_type) (u32 BE) || event_type || entropy_score bits (f64 BE)`
pub fn compute_event_hash(
    previous_hash: &Hash,
    timestamp: DateTime<Utc>,
    event_type: EventType,
    entropy_score: f64,
) -> Hash {
    let name = event_type.as_str().as_bytes();
    let mut hasher = Sha256::new();
    hasher.update(previous_hash);
    hasher.update(timestamp.timestamp_millis().to_be_bytes());
    hasher.update((name.len() as u32).to_be_bytes());
    hasher.update(name);
    hasher.update(entropy_score.to_bits().to_be_bytes());
    hasher.finalize().into()
}

/// Recompute an event's hash from its four linking fields
pub fn recompute(event: &NotabotEvent, index: usize) -> Result<Hash, ChainError> {
    let previous = decode_hash(&event.previous_hash).ok_or_else(|| ChainError::MalformedHash {
        index,
        value: event.previous_hash.clone(),
    })?;
    Ok(compute_event_hash(
        &previous,
        event.timestamp,
        event.event_type,
        event.entropy_score,
    ))
}

/// Outcome of auditing a chain segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAudit {
    /// Number of leading events that verified
    pub valid_prefix: usize,
    /// First failure; it invalidates its event and everything after it
    pub failure: Option<ChainError>,
}

impl ChainAudit {
    pub fn is_valid(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(self) -> Result<usize, ChainError> {
        match self.failure {
            None => Ok(self.valid_prefix),
            Some(e) => Err(e),
        }
    }
}

/// Verify hashes and links of a segment, without signatures
///
/// `anchor` is the hash the first event must point at: [`ZERO_HASH`] for a
/// full chain, or the head of an already-verified prefix.
pub fn verify_links(events: &[NotabotEvent], anchor: &str) -> ChainAudit {
    audit(events, anchor, |_, _| true)
}

/// Verify hashes, links and signatures of a segment
pub fn audit_chain(
    events: &[NotabotEvent],
    anchor: &str,
    public_key: &[u8],
    verifier: &dyn SignatureVerifier,
) -> ChainAudit {
    audit(events, anchor, |hash, event| {
        hex::decode(&event.signature)
            .map(|sig| verifier.verify(hash, &sig, public_key))
            .unwrap_or(false)
    })
}

fn audit<F>(events: &[NotabotEvent], anchor: &str, mut signature_ok: F) -> ChainAudit
where
    F: FnMut(&Hash, &NotabotEvent) -> bool,
{
    let mut expected_previous = anchor.to_string();

    for (index, event) in events.iter().enumerate() {
        let fail = |failure| ChainAudit {
            valid_prefix: index,
            failure: Some(failure),
        };

        if event.previous_hash != expected_previous {
            return fail(ChainError::ChainBroken {
                index,
                expected: expected_previous,
                actual: event.previous_hash.clone(),
            });
        }

        let computed = match recompute(event, index) {
            Ok(hash) => hash,
            Err(e) => return fail(e),
        };
        if hex::encode(computed) != event.hash {
            return fail(ChainError::HashMismatch {
                index,
                stored: event.hash.clone(),
                computed: hex::encode(computed),
            });
        }

        if !signature_ok(&computed, event) {
            return fail(ChainError::InvalidSignature { index });
        }

        expected_previous = event.hash.clone();
    }

    ChainAudit {
        valid_prefix: events.len(),
        failure: None,
    }
}

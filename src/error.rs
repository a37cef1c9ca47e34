//! Error types for the Notabot engine

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::chain::ChainError;

/// Errors that can occur while collecting, chaining or committing
#[derive(Debug, Error)]
pub enum NotabotError {
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Chain integrity error: {0}")]
    Chain(#[from] ChainError),

    #[error("Event timestamp {timestamp} precedes chain tail {tail}")]
    OutOfOrder {
        timestamp: DateTime<Utc>,
        tail: DateTime<Utc>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tracker is not started")]
    NotStarted,

    #[error("A commit is already in flight")]
    CommitInFlight,

    #[error("Commit denied ({reason}); remediation required before committing again")]
    CommitDenied { reason: String },

    #[error("Commit deferred until {retry_at}")]
    CommitDeferred { retry_at: DateTime<Utc> },

    #[error("Nothing to commit: {0}")]
    NothingToCommit(String),

    #[error("No pending commit to retry")]
    NoPendingCommit,

    #[error("Commit ticket does not match the in-flight attempt")]
    TicketMismatch,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid protocol response: {0}")]
    InvalidResponse(String),
}

//! Notabot Engine - On-device behavioral legitimacy engine
//!
//! Notabot passively observes interaction patterns (pointer movement, scroll,
//! focus changes, touch) and turns high-entropy observations into a signed,
//! hash-chained points ledger: collectors → entropy analyzers → event chain →
//! time-gated points → commitment to an external authority.
//!
//! ## Modules
//!
//! - **Client**: [`NotabotTracker`] owns collectors, ledger, persistence and
//!   the commit state machine for one identity
//! - **Authority**: [`Authority`] admits commitments and gates the shared
//!   funding resource per identity

pub mod authority;
pub mod chain;
pub mod collector;
pub mod commit;
pub mod config;
pub mod entropy;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod protocol;
pub mod storage;
pub mod tracker;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use authority::{Authority, CommitmentStore, FundingState, InMemoryCommitmentStore};
pub use chain::{audit_chain, verify_links, ChainAudit, ChainError, ZERO_HASH};
pub use commit::{CommitOutcome, CommitState, CommitTicket, CommitTransport, InProcessTransport};
pub use config::{AdmissionPolicy, TrackerConfig};
pub use error::NotabotError;
pub use identity::{Ed25519Identity, Ed25519Verifier, EventSigner, SignatureVerifier};
pub use ledger::{Credit, PointsLedger};
pub use protocol::{CommitRequest, CommitResponse, DenialReason};
pub use storage::{FileStateStore, MemoryStateStore, PersistedState, StateStore};
pub use tracker::NotabotTracker;
pub use types::{
    Commitment, EventType, FocusKind, FocusSample, NotabotEvent, PendingCommit, PointerSample,
    Score, ScrollSample, TouchSample,
};

/// Engine version recorded by the CLI and FFI
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported alongside the engine version
pub const PRODUCER_NAME: &str = "notabot-engine";

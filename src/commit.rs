//! Client-side commit state machine and transport seam
//!
//! A commit attempt is split into a synchronous begin (build the request and
//! mark the attempt in flight) and a synchronous completion (apply the
//! authority's answer). The only suspension point is the transport call in
//! between, which lets FFI hosts drive the network themselves.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::authority::Authority;
use crate::error::NotabotError;
use crate::protocol::{CommitRequest, CommitResponse, DenialReason};

/// Where the tracker stands with respect to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CommitState {
    #[default]
    Idle,
    /// An attempt is in flight; a second begin fails
    Committing,
    /// Funding rate-limited; the pending snapshot waits for `retry_at`
    PendingDeferred { retry_at: DateTime<Utc> },
    /// Transient failure; the pending snapshot retries with backoff
    PendingRetry { attempts: u32, retry_at: DateTime<Utc> },
    /// Suspicious pattern; nothing retries until remediation is acknowledged
    Denied { reason: DenialReason, detail: String },
}

impl CommitState {
    /// Earliest time a parked snapshot may be re-submitted
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CommitState::PendingDeferred { retry_at } | CommitState::PendingRetry { retry_at, .. } => {
                Some(*retry_at)
            }
            _ => None,
        }
    }

    /// State to resume in after a restart
    ///
    /// An attempt interrupted mid-flight has an unknown outcome; it becomes a
    /// due retry when a snapshot exists.
    pub fn recovered(self, has_pending: bool, now: DateTime<Utc>) -> Self {
        match self {
            CommitState::Committing if has_pending => CommitState::PendingRetry {
                attempts: 1,
                retry_at: now,
            },
            CommitState::Committing => CommitState::Idle,
            other => other,
        }
    }
}

/// An attempt handed out by `begin_commit`, redeemed by `complete_commit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitTicket {
    pub id: Uuid,
    pub request: CommitRequest,
    /// 1 for a first submission, n for the nth try of the same snapshot
    pub attempt: u32,
    /// Re-submission of a parked snapshot rather than the live ledger
    pub is_retry: bool,
    /// When the parked snapshot was first stored
    pub snapshot_stored_at: Option<DateTime<Utc>>,
}

impl CommitTicket {
    pub fn new(request: CommitRequest, attempt: u32, snapshot_stored_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            attempt,
            is_retry: snapshot_stored_at.is_some(),
            snapshot_stored_at,
        }
    }
}

/// What a completed attempt did to local state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Accepted {
        transaction_ref: String,
        duplicate: bool,
        event_count: u64,
    },
    Deferred {
        retry_at: DateTime<Utc>,
        unfunded_points: u64,
    },
    Denied {
        reason: DenialReason,
        detail: String,
    },
    RetryScheduled {
        attempts: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
}

/// Carries commit requests to an authority
#[async_trait]
pub trait CommitTransport: Send + Sync {
    async fn submit(&self, request: &CommitRequest) -> Result<CommitResponse, NotabotError>;
}

/// Transport bound directly to an in-process [`Authority`]
pub struct InProcessTransport {
    authority: Arc<Authority>,
    clock: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl InProcessTransport {
    pub fn new(authority: Arc<Authority>) -> Self {
        Self::with_clock(authority, Utc::now)
    }

    /// Use `clock` for the authority's notion of now
    pub fn with_clock<F>(authority: Arc<Authority>, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        Self {
            authority,
            clock: Box::new(clock),
        }
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }
}

#[async_trait]
impl CommitTransport for InProcessTransport {
    async fn submit(&self, request: &CommitRequest) -> Result<CommitResponse, NotabotError> {
        Ok(self.authority.admit(request, (self.clock)()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interrupted_commit_recovery() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap();

        assert_eq!(
            CommitState::Committing.recovered(true, now),
            CommitState::PendingRetry {
                attempts: 1,
                retry_at: now
            }
        );
        assert_eq!(CommitState::Committing.recovered(false, now), CommitState::Idle);

        let deferred = CommitState::PendingDeferred { retry_at: now };
        assert_eq!(deferred.clone().recovered(true, now), deferred);
    }

    #[test]
    fn test_state_wire_format() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap();
        let state = CommitState::PendingRetry {
            attempts: 3,
            retry_at: now,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"state\":\"pending_retry\""));

        let parsed: CommitState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
        assert_eq!(parsed.retry_at(), Some(now));
        assert_eq!(CommitState::Idle.retry_at(), None);
    }
}

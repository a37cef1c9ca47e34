//! Commit request/response wire types
//!
//! Responses map onto HTTP-style status codes: 200 accepted, 402 funding
//! deferred, 403 denied, 503 authority resource exhaustion.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::NotabotError;
use crate::types::{Commitment, NotabotEvent};

/// Commit submission sent to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub commitment: Commitment,
    /// Chain segment since the last accepted commitment
    pub event_chain: Vec<NotabotEvent>,
    pub identity_address: String,
    /// Hex public key the segment's signatures verify under
    pub public_key: String,
    pub request_funding: bool,
}

/// Machine-readable denial reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Inter-event timing too regular to be human
    UniformTiming,
    /// Funding requests far above the daily ceiling
    ExcessiveFrequency,
    /// Segment failed hash, link or signature verification
    InvalidChain,
    /// Public key does not belong to the claimed identity
    IdentityMismatch,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::UniformTiming => "uniform_timing",
            DenialReason::ExcessiveFrequency => "excessive_frequency",
            DenialReason::InvalidChain => "invalid_chain",
            DenialReason::IdentityMismatch => "identity_mismatch",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authority decision on a commit request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitResponse {
    /// Commitment durably recorded
    Accepted {
        transaction_ref: String,
        /// The commitment was already covered by an earlier record
        #[serde(default)]
        duplicate: bool,
    },
    /// Funding rate-limited; retry after the wait
    Deferred {
        wait_seconds: i64,
        /// Points in this commitment not yet durably recorded
        unfunded_points: u64,
    },
    /// Suspicious pattern; do not retry without remediation
    Denied { reason: DenialReason, detail: String },
    /// Authority out of resources; retryable
    Unavailable { detail: String },
}

impl CommitResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            CommitResponse::Accepted { .. } => 200,
            CommitResponse::Deferred { .. } => 402,
            CommitResponse::Denied { .. } => 403,
            CommitResponse::Unavailable { .. } => 503,
        }
    }

    /// Remaining wait for a deferral, in whole-or-fractional minutes
    pub fn wait_minutes(&self) -> Option<f64> {
        match self {
            CommitResponse::Deferred { wait_seconds, .. } => Some(*wait_seconds as f64 / 60.0),
            _ => None,
        }
    }

    pub fn wait(&self) -> Option<Duration> {
        match self {
            CommitResponse::Deferred { wait_seconds, .. } => Some(Duration::seconds(*wait_seconds)),
            _ => None,
        }
    }

    /// Interpret a transport reply
    ///
    /// A body that parses must agree with its status code. Server errors with
    /// an unreadable body are treated as retryable unavailability.
    pub fn from_http(status: u16, body: &str) -> Result<Self, NotabotError> {
        match serde_json::from_str::<CommitResponse>(body) {
            Ok(response) if response.status_code() == status => Ok(response),
            Ok(response) => Err(NotabotError::InvalidResponse(format!(
                "status {} does not match body status {}",
                status,
                response.status_code()
            ))),
            Err(_) if (500..600).contains(&status) => Ok(CommitResponse::Unavailable {
                detail: format!("authority returned {}", status),
            }),
            Err(e) => Err(NotabotError::InvalidResponse(format!(
                "unreadable body for status {}: {}",
                status, e
            ))),
        }
    }

    pub fn to_json(&self) -> Result<String, NotabotError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_codes() {
        let accepted = CommitResponse::Accepted {
            transaction_ref: "tx-1".to_string(),
            duplicate: false,
        };
        let deferred = CommitResponse::Deferred {
            wait_seconds: 1800,
            unfunded_points: 40,
        };
        let denied = CommitResponse::Denied {
            reason: DenialReason::UniformTiming,
            detail: "too regular".to_string(),
        };
        let unavailable = CommitResponse::Unavailable {
            detail: "store full".to_string(),
        };

        assert_eq!(accepted.status_code(), 200);
        assert_eq!(deferred.status_code(), 402);
        assert_eq!(denied.status_code(), 403);
        assert_eq!(unavailable.status_code(), 503);
        assert_eq!(deferred.wait_minutes(), Some(30.0));
    }

    #[test]
    fn test_wire_format() {
        let denied = CommitResponse::Denied {
            reason: DenialReason::ExcessiveFrequency,
            detail: "42 fundings/day".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&denied.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], "denied");
        assert_eq!(value["reason"], "excessive_frequency");
    }

    #[test]
    fn test_from_http() {
        let body = r#"{ "status": "deferred", "wait_seconds": 600, "unfunded_points": 12 }"#;
        assert_eq!(
            CommitResponse::from_http(402, body).unwrap(),
            CommitResponse::Deferred {
                wait_seconds: 600,
                unfunded_points: 12
            }
        );

        // Mismatched status is a protocol violation
        assert!(CommitResponse::from_http(200, body).is_err());

        // Gateway errors without a protocol body are retryable
        assert!(matches!(
            CommitResponse::from_http(502, "<html>bad gateway</html>"),
            Ok(CommitResponse::Unavailable { .. })
        ));

        assert!(CommitResponse::from_http(400, "nope").is_err());
    }
}

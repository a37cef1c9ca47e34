//! Authority-side admission policy
//!
//! Decides whether a client's commitment becomes durable and whether the
//! shared funding resource pays for it. Every check-then-update sequence for
//! an identity runs while holding that identity's map entry, so two
//! near-simultaneous requests cannot both observe "not yet funded".

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chain::{audit_chain, ZERO_HASH};
use crate::config::AdmissionPolicy;
use crate::error::NotabotError;
use crate::identity::SignatureVerifier;
use crate::protocol::{CommitRequest, CommitResponse, DenialReason};
use crate::types::{Commitment, NotabotEvent};

/// Per-identity funding history. Never exposed beyond protocol responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundingState {
    pub first_funded_at: Option<DateTime<Utc>>,
    pub last_funded_at: Option<DateTime<Utc>>,
    pub funding_count: u64,
    /// Most recent funding times, bounded by the policy's history cap
    pub funding_timestamps: VecDeque<DateTime<Utc>>,
}

impl FundingState {
    fn record_funding(&mut self, now: DateTime<Utc>, history_cap: usize) {
        self.first_funded_at.get_or_insert(now);
        self.last_funded_at = Some(now);
        self.funding_count += 1;
        self.funding_timestamps.push_back(now);
        while self.funding_timestamps.len() > history_cap {
            self.funding_timestamps.pop_front();
        }
    }
}

/// A commitment as held by the durable store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedCommitment {
    pub commitment: Commitment,
    pub transaction_ref: String,
}

/// Durable commitment storage (on-chain contract or database)
pub trait CommitmentStore: Send + Sync {
    /// Durably record a commitment, returning a transaction reference
    fn record(&self, identity: &str, commitment: &Commitment) -> Result<String, NotabotError>;

    fn read(&self, identity: &str) -> Option<RecordedCommitment>;
}

/// In-memory store with an optional identity capacity
#[derive(Debug, Default)]
pub struct InMemoryCommitmentStore {
    records: DashMap<String, RecordedCommitment>,
    capacity: Option<usize>,
}

impl InMemoryCommitmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new identities once `capacity` are stored
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            capacity: Some(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CommitmentStore for InMemoryCommitmentStore {
    fn record(&self, identity: &str, commitment: &Commitment) -> Result<String, NotabotError> {
        if let Some(capacity) = self.capacity {
            if !self.records.contains_key(identity) && self.records.len() >= capacity {
                return Err(NotabotError::Persistence(format!(
                    "commitment store full ({} identities)",
                    capacity
                )));
            }
        }

        let transaction_ref = Uuid::new_v4().to_string();
        self.records.insert(
            identity.to_string(),
            RecordedCommitment {
                commitment: commitment.clone(),
                transaction_ref: transaction_ref.clone(),
            },
        );
        Ok(transaction_ref)
    }

    fn read(&self, identity: &str) -> Option<RecordedCommitment> {
        self.records.get(identity).map(|r| r.value().clone())
    }
}

/// Admission authority in front of a commitment store
pub struct Authority {
    policy: AdmissionPolicy,
    store: Arc<dyn CommitmentStore>,
    verifier: Arc<dyn SignatureVerifier>,
    funding: DashMap<String, FundingState>,
}

impl Authority {
    pub fn new(
        policy: AdmissionPolicy,
        store: Arc<dyn CommitmentStore>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            policy,
            store,
            verifier,
            funding: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Snapshot of an identity's funding history
    pub fn funding_state(&self, identity: &str) -> Option<FundingState> {
        self.funding.get(identity).map(|s| s.value().clone())
    }

    /// Number of identities with funding history
    pub fn tracked_identities(&self) -> usize {
        self.funding.len()
    }

    /// Decide on a commit request at `now`
    pub fn admit(&self, request: &CommitRequest, now: DateTime<Utc>) -> CommitResponse {
        let identity = request.identity_address.as_str();

        let public_key = match hex::decode(&request.public_key) {
            Ok(key) => key,
            Err(_) => {
                return deny(identity, DenialReason::IdentityMismatch, "public key is not hex".to_string());
            }
        };
        if let Some(address) = self.verifier.address_of(&public_key) {
            if address != identity {
                return deny(
                    identity,
                    DenialReason::IdentityMismatch,
                    format!("public key belongs to {}", address),
                );
            }
        }

        let response = {
            // Held until the decision is made and recorded
            let mut entry = self.funding.entry(identity.to_string()).or_default();
            self.decide(entry.value_mut(), request, &public_key, now)
        };

        // Identities that were never funded keep no state
        self.funding.remove_if(identity, |_, state| state.funding_count == 0);
        response
    }

    fn decide(
        &self,
        state: &mut FundingState,
        request: &CommitRequest,
        public_key: &[u8],
        now: DateTime<Utc>,
    ) -> CommitResponse {
        let identity = request.identity_address.as_str();
        let commitment = &request.commitment;
        let recorded = self.store.read(identity);

        if let Some(recorded) = &recorded {
            if recorded.commitment.chain_head == commitment.chain_head {
                debug!(identity, event_count = commitment.event_count, "commitment already recorded");
                return CommitResponse::Accepted {
                    transaction_ref: recorded.transaction_ref.clone(),
                    duplicate: true,
                };
            }
            if commitment.event_count <= recorded.commitment.event_count {
                return deny(
                    identity,
                    DenialReason::InvalidChain,
                    format!(
                        "head at event {} conflicts with the recorded chain of {} events",
                        commitment.event_count, recorded.commitment.event_count
                    ),
                );
            }
        }

        if let Err(detail) = self.check_segment(request, recorded.as_ref(), public_key) {
            return deny(identity, DenialReason::InvalidChain, detail);
        }

        if request.request_funding {
            if let Some(last) = state.last_funded_at {
                let elapsed = now - last;
                let cooldown = self.policy.funding_cooldown();
                if elapsed < cooldown {
                    let wait_seconds = (cooldown - elapsed).num_seconds().max(1);
                    let recorded_points = recorded.as_ref().map_or(0, |r| r.commitment.total_points);
                    debug!(identity, wait_seconds, "funding deferred by cooldown");
                    return CommitResponse::Deferred {
                        wait_seconds,
                        unfunded_points: commitment.total_points.saturating_sub(recorded_points),
                    };
                }
            }

            if let Some(first) = state.first_funded_at {
                let days = ((now - first).num_seconds() as f64 / 86_400.0).max(1.0);
                let per_day = state.funding_count as f64 / days;
                if per_day > self.policy.max_fundings_per_day {
                    return deny(
                        identity,
                        DenialReason::ExcessiveFrequency,
                        format!(
                            "{:.1} fundings/day exceeds ceiling of {:.1}",
                            per_day, self.policy.max_fundings_per_day
                        ),
                    );
                }
            }
        }

        if let Some((mean, stddev)) = interval_stats(&request.event_chain) {
            let intervals = request.event_chain.len() - 1;
            if intervals >= self.policy.min_uniformity_intervals
                && stddev < mean * self.policy.uniformity_threshold
            {
                return deny(
                    identity,
                    DenialReason::UniformTiming,
                    format!(
                        "interval stddev {:.1}ms below {:.0}% of mean {:.1}ms",
                        stddev,
                        self.policy.uniformity_threshold * 100.0,
                        mean
                    ),
                );
            }
        }

        let transaction_ref = match self.store.record(identity, commitment) {
            Ok(reference) => reference,
            Err(e) => {
                warn!(identity, error = %e, "commitment store unavailable");
                return CommitResponse::Unavailable {
                    detail: e.to_string(),
                };
            }
        };

        if request.request_funding {
            state.record_funding(now, self.policy.funding_history_cap);
        }

        info!(
            identity,
            event_count = commitment.event_count,
            total_points = commitment.total_points,
            funded = request.request_funding,
            "commitment recorded"
        );
        CommitResponse::Accepted {
            transaction_ref,
            duplicate: false,
        }
    }

    /// The segment must extend the recorded head up to the committed head
    fn check_segment(
        &self,
        request: &CommitRequest,
        recorded: Option<&RecordedCommitment>,
        public_key: &[u8],
    ) -> Result<(), String> {
        let commitment = &request.commitment;
        let segment = &request.event_chain;

        let (recorded_head, recorded_count) = match recorded {
            Some(r) => (r.commitment.chain_head.as_str(), r.commitment.event_count),
            None => (ZERO_HASH, 0),
        };

        let Some(last) = segment.last() else {
            return Err("empty chain segment".to_string());
        };
        if last.hash != commitment.chain_head {
            return Err("segment does not end at the committed chain head".to_string());
        }

        // Position of the segment's first event in the full chain
        let Some(first_index) = commitment.event_count.checked_sub(segment.len() as u64) else {
            return Err(format!(
                "segment of {} events is longer than the committed {}",
                segment.len(),
                commitment.event_count
            ));
        };
        if first_index > recorded_count {
            return Err(format!(
                "segment starts at event {} but only {} are recorded",
                first_index, recorded_count
            ));
        }

        // A segment may re-send recorded events as long as it passes through
        // the recorded head
        let anchor = if first_index == recorded_count {
            recorded_head
        } else if first_index == 0 {
            ZERO_HASH
        } else {
            segment[0].previous_hash.as_str()
        };

        audit_chain(segment, anchor, public_key, self.verifier.as_ref())
            .into_result()
            .map_err(|e| e.to_string())?;

        if first_index < recorded_count {
            let overlap = (recorded_count - first_index - 1) as usize;
            if segment[overlap].hash != recorded_head {
                return Err("segment does not pass through the recorded chain head".to_string());
            }
        }
        Ok(())
    }
}

fn deny(identity: &str, reason: DenialReason, detail: String) -> CommitResponse {
    warn!(identity, reason = reason.as_str(), detail = %detail, "commit denied");
    CommitResponse::Denied { reason, detail }
}

/// Mean and population stddev of inter-event intervals, in milliseconds
fn interval_stats(events: &[NotabotEvent]) -> Option<(f64, f64)> {
    if events.len() < 3 {
        return None;
    }
    let intervals: Vec<f64> = events
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64)
        .collect();
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

//! Event chain and time-gated points ledger
//!
//! Appending is the atomic unit of state change: hash, sign, push, credit.
//! Point accrual is capped against real elapsed time since the session anchor,
//! so producing qualifying events faster than real time earns nothing extra.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::chain::{compute_event_hash, decode_hash, ChainError, ZERO_HASH};
use crate::error::NotabotError;
use crate::identity::EventSigner;
use crate::types::{Commitment, EventType, NotabotEvent, Score};

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    /// Points the event was worth before gating
    pub earned: u64,
    /// Points actually credited after gating
    pub credited: u64,
}

impl Credit {
    pub fn was_gated(&self) -> bool {
        self.credited < self.earned
    }
}

/// Hash-linked event chain plus the points it has accrued
#[derive(Debug, Clone, PartialEq)]
pub struct PointsLedger {
    chain: Vec<NotabotEvent>,
    current_points: u64,
    session_start: DateTime<Utc>,
    points_per_event: u64,
    max_points_per_minute: f64,
}

impl PointsLedger {
    /// Start an empty ledger anchored at `session_start`
    pub fn new(
        session_start: DateTime<Utc>,
        points_per_event: u64,
        max_points_per_minute: f64,
    ) -> Self {
        Self {
            chain: Vec::new(),
            current_points: 0,
            session_start,
            points_per_event,
            max_points_per_minute,
        }
    }

    /// Rebuild from persisted parts
    pub fn restore(
        chain: Vec<NotabotEvent>,
        current_points: u64,
        session_start: DateTime<Utc>,
        points_per_event: u64,
        max_points_per_minute: f64,
    ) -> Self {
        Self {
            chain,
            current_points,
            session_start,
            points_per_event,
            max_points_per_minute,
        }
    }

    /// Highest point total the session may hold at `now`
    ///
    /// Formula: `floor(elapsed_minutes * max_points_per_minute)`
    pub fn max_allowed(&self, now: DateTime<Utc>) -> u64 {
        let elapsed_ms = (now - self.session_start).num_milliseconds().max(0) as f64;
        let elapsed_minutes = elapsed_ms / 60_000.0;
        (elapsed_minutes * self.max_points_per_minute).floor() as u64
    }

    /// Points an event of the given entropy is worth before gating
    pub fn points_for(&self, entropy_score: f64) -> u64 {
        (entropy_score.clamp(0.0, 1.0) * self.points_per_event as f64).floor() as u64
    }

    /// Append a scored observation observed at `now`
    ///
    /// The signature is obtained before anything is mutated; a signing failure
    /// leaves the ledger untouched. Gated events are still appended.
    pub fn append(
        &mut self,
        event_type: EventType,
        entropy_score: f64,
        now: DateTime<Utc>,
        signer: &dyn EventSigner,
    ) -> Result<Credit, NotabotError> {
        if let Some(tail) = self.chain.last() {
            if now < tail.timestamp {
                return Err(NotabotError::OutOfOrder {
                    timestamp: now,
                    tail: tail.timestamp,
                });
            }
        }

        let entropy_score = entropy_score.clamp(0.0, 1.0);
        let previous_hash = self.head_hash().to_string();
        let previous = decode_hash(&previous_hash).ok_or_else(|| ChainError::MalformedHash {
            index: self.chain.len(),
            value: previous_hash.clone(),
        })?;
        let hash = compute_event_hash(&previous, now, event_type, entropy_score);

        let signature = signer.sign(&hash).map_err(|e| {
            warn!(
                event_type = event_type.as_str(),
                error = %e,
                "signing failed, dropping observation"
            );
            e
        })?;

        self.chain.push(NotabotEvent {
            timestamp: now,
            event_type,
            entropy_score,
            previous_hash,
            hash: hex::encode(hash),
            signature: hex::encode(signature),
        });

        let earned = self.points_for(entropy_score);
        let max_allowed = self.max_allowed(now);
        let credited = if self.current_points >= max_allowed {
            0
        } else {
            earned.min(max_allowed - self.current_points)
        };
        self.current_points += credited;

        if credited < earned {
            debug!(earned, credited, max_allowed, "point accrual gated by elapsed time");
        }

        Ok(Credit { earned, credited })
    }

    /// Hash of the newest event, or the zero sentinel
    pub fn head_hash(&self) -> &str {
        self.chain.last().map(|e| e.hash.as_str()).unwrap_or(ZERO_HASH)
    }

    /// Commitment over the whole chain as it stands
    pub fn commitment(&self, now: DateTime<Utc>) -> Option<Commitment> {
        let head = self.chain.last()?;
        Some(Commitment {
            total_points: self.current_points,
            chain_head: head.hash.clone(),
            event_count: self.chain.len() as u64,
            last_update: now,
        })
    }

    pub fn score(&self) -> Score {
        Score {
            points: self.current_points,
            event_count: self.chain.len() as u64,
            last_update: self.chain.last().map(|e| e.timestamp),
        }
    }

    pub fn chain(&self) -> &[NotabotEvent] {
        &self.chain
    }

    /// Events after the first `from` events
    pub fn segment_from(&self, from: usize) -> &[NotabotEvent] {
        &self.chain[from.min(self.chain.len())..]
    }

    pub fn current_points(&self) -> u64 {
        self.current_points
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    /// Re-anchor the time-gating clock. Only an explicit new-session policy
    /// should call this; restarts never do.
    pub fn reset_session_clock(&mut self, now: DateTime<Utc>) {
        self.session_start = now;
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{audit_chain, verify_links};
    use crate::identity::Ed25519Identity;
    use chrono::{Duration, TimeZone};

    struct FailingSigner;

    impl EventSigner for FailingSigner {
        fn sign(&self, _hash: &crate::chain::Hash) -> Result<Vec<u8>, NotabotError> {
            Err(NotabotError::SigningFailed("wallet locked".to_string()))
        }

        fn public_key(&self) -> Vec<u8> {
            vec![0; 32]
        }

        fn address(&self) -> String {
            "0xlocked".to_string()
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_chain_integrity_after_appends() {
        let identity = Ed25519Identity::from_seed([1u8; 32]);
        let mut ledger = PointsLedger::new(start(), 10, 10.0);

        for i in 0..20 {
            let now = start() + Duration::seconds(30 + i * 7);
            ledger
                .append(EventType::MouseEntropy, 0.6 + (i % 4) as f64 * 0.1, now, &identity)
                .unwrap();
        }

        assert_eq!(ledger.chain()[0].previous_hash, ZERO_HASH);
        for pair in ledger.chain().windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].hash);
        }
        assert!(verify_links(ledger.chain(), ZERO_HASH).is_valid());
        let audit = audit_chain(ledger.chain(), ZERO_HASH, &identity.public_key(), &identity);
        assert!(audit.is_valid());
    }

    #[test]
    fn test_composite_scenario_credits_six_points() {
        let identity = Ed25519Identity::from_seed([1u8; 32]);
        let mut ledger = PointsLedger::new(start(), 10, 10.0);

        let composite = crate::entropy::composite_score(0.8, 0.6, 0.5);
        assert!(composite >= 0.6);

        let credit = ledger
            .append(EventType::MouseEntropy, composite, start() + Duration::minutes(5), &identity)
            .unwrap();
        assert_eq!(credit.earned, 6);
        assert_eq!(credit.credited, 6);
        assert_eq!(ledger.current_points(), 6);
    }

    #[test]
    fn test_time_gating_first_minute() {
        let identity = Ed25519Identity::from_seed([1u8; 32]);
        let mut ledger = PointsLedger::new(start(), 10, 2.0);
        let now = start() + Duration::minutes(1);

        let credits: Vec<Credit> = (0..3)
            .map(|_| ledger.append(EventType::TouchPath, 0.7, now, &identity).unwrap())
            .collect();

        assert_eq!(credits[0], Credit { earned: 7, credited: 2 });
        assert_eq!(credits[1], Credit { earned: 7, credited: 0 });
        assert_eq!(credits[2], Credit { earned: 7, credited: 0 });
        assert_eq!(ledger.current_points(), 2);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_time_gating_bound_holds_under_flood() {
        let identity = Ed25519Identity::from_seed([1u8; 32]);
        let mut ledger = PointsLedger::new(start(), 10, 3.0);

        for i in 0..600 {
            // 600 perfect events over 5 minutes
            let now = start() + Duration::milliseconds(i * 500);
            ledger.append(EventType::MouseEntropy, 1.0, now, &identity).unwrap();
            assert!(ledger.current_points() <= ledger.max_allowed(now));
        }

        let end = start() + Duration::milliseconds(599 * 500);
        assert_eq!(ledger.max_allowed(end), 14);
        assert!(ledger.current_points() <= 14);
        assert_eq!(ledger.len(), 600);
    }

    #[test]
    fn test_nothing_credited_at_session_start() {
        let identity = Ed25519Identity::from_seed([1u8; 32]);
        let mut ledger = PointsLedger::new(start(), 10, 10.0);
        let credit = ledger.append(EventType::FocusPattern, 0.9, start(), &identity).unwrap();
        assert_eq!(credit.credited, 0);
        assert!(credit.was_gated());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_signing_failure_leaves_ledger_untouched() {
        let mut ledger = PointsLedger::new(start(), 10, 10.0);
        let result = ledger.append(
            EventType::MouseEntropy,
            0.9,
            start() + Duration::minutes(2),
            &FailingSigner,
        );

        assert!(matches!(result, Err(NotabotError::SigningFailed(_))));
        assert!(ledger.is_empty());
        assert_eq!(ledger.current_points(), 0);
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let identity = Ed25519Identity::from_seed([1u8; 32]);
        let mut ledger = PointsLedger::new(start(), 10, 10.0);
        ledger
            .append(EventType::MouseEntropy, 0.7, start() + Duration::minutes(2), &identity)
            .unwrap();

        let result = ledger.append(
            EventType::MouseEntropy,
            0.7,
            start() + Duration::minutes(1),
            &identity,
        );
        assert!(matches!(result, Err(NotabotError::OutOfOrder { .. })));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_commitment_points_at_chain_head() {
        let identity = Ed25519Identity::from_seed([1u8; 32]);
        let mut ledger = PointsLedger::new(start(), 10, 10.0);
        assert!(ledger.commitment(start()).is_none());

        for i in 1..=3 {
            ledger
                .append(EventType::ScrollPattern, 0.8, start() + Duration::minutes(i), &identity)
                .unwrap();
        }

        let now = start() + Duration::minutes(4);
        let commitment = ledger.commitment(now).unwrap();
        assert_eq!(commitment.event_count, 3);
        assert_eq!(commitment.chain_head, ledger.chain()[2].hash);
        assert_eq!(commitment.total_points, 24);
        assert_eq!(ledger.segment_from(1).len(), 2);
        assert_eq!(ledger.segment_from(10).len(), 0);
    }
}

//! Session tracker
//!
//! Owns the collectors, the ledger and the commit state machine for one
//! identity on one device. Single-owner: every mutation goes through
//! `&mut self`, and every state change is persisted before returning.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chain::{verify_links, ZERO_HASH};
use crate::collector::{Ingest, SampleBuffer};
use crate::commit::{CommitOutcome, CommitState, CommitTicket, CommitTransport};
use crate::config::TrackerConfig;
use crate::entropy;
use crate::error::NotabotError;
use crate::identity::EventSigner;
use crate::ledger::{Credit, PointsLedger};
use crate::protocol::{CommitRequest, CommitResponse};
use crate::storage::{PersistedState, StateStore, STATE_VERSION};
use crate::types::{
    Commitment, EventType, FocusSample, NotabotEvent, PendingCommit, PointerSample, Score,
    ScrollSample, TouchSample,
};

/// Minimum spacing between session-duration observations
pub const SESSION_EVENT_INTERVAL_SECS: i64 = 60;

/// Behavioral legitimacy tracker for one session
pub struct NotabotTracker {
    config: TrackerConfig,
    signer: Arc<dyn EventSigner>,
    store: Box<dyn StateStore>,
    ledger: Option<PointsLedger>,
    pointer: SampleBuffer<PointerSample>,
    scroll: SampleBuffer<ScrollSample>,
    focus: SampleBuffer<FocusSample>,
    touch: SampleBuffer<TouchSample>,
    running: bool,
    commit_state: CommitState,
    in_flight: Option<Uuid>,
    pending: Option<PendingCommit>,
    last_accepted: Option<Commitment>,
    /// Chain length covered by the last live commit attempt
    attempted_through: u64,
    last_session_event: Option<DateTime<Utc>>,
}

impl NotabotTracker {
    pub fn new(
        config: TrackerConfig,
        signer: Arc<dyn EventSigner>,
        store: Box<dyn StateStore>,
    ) -> Result<Self, NotabotError> {
        config.validate()?;

        let min_interval = config.min_sample_interval();
        Ok(Self {
            pointer: SampleBuffer::new(config.buffer_capacity, config.retained_tail, min_interval),
            scroll: SampleBuffer::new(config.buffer_capacity, config.retained_tail, min_interval),
            focus: SampleBuffer::new(
                config.focus_buffer_capacity,
                config.focus_retained_tail,
                Duration::zero(),
            ),
            touch: SampleBuffer::new(config.buffer_capacity, config.retained_tail, min_interval),
            config,
            signer,
            store,
            ledger: None,
            running: false,
            commit_state: CommitState::Idle,
            in_flight: None,
            pending: None,
            last_accepted: None,
            attempted_through: 0,
            last_session_event: None,
        })
    }

    /// Start or resume the session
    ///
    /// Persisted state for the same identity is restored, including the
    /// original `session_start`. Otherwise a new session is anchored at `now`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), NotabotError> {
        if self.ledger.is_some() {
            self.running = true;
            return Ok(());
        }

        let restored = match self.store.load() {
            Ok(state) => state.and_then(|s| self.usable_state(s)),
            Err(e) => {
                warn!(error = %e, "could not load persisted state, starting a new session");
                None
            }
        };

        match restored {
            Some(state) => {
                info!(
                    events = state.chain.len(),
                    points = state.current_points,
                    session_start = %state.session_start,
                    "restored session"
                );
                self.commit_state = state
                    .commit_state
                    .recovered(state.pending_commit.is_some(), now);
                self.attempted_through = state
                    .pending_commit
                    .as_ref()
                    .map(|p| p.commitment.event_count)
                    .or(state.last_accepted.as_ref().map(|c| c.event_count))
                    .unwrap_or(0);
                self.pending = state.pending_commit;
                self.last_accepted = state.last_accepted;
                self.last_session_event = state.last_session_event;
                self.ledger = Some(PointsLedger::restore(
                    state.chain,
                    state.current_points,
                    state.session_start,
                    self.config.points_per_event,
                    self.config.max_points_per_minute,
                ));
            }
            None => {
                info!(session_start = %now, "started new session");
                self.commit_state = CommitState::Idle;
                self.pending = None;
                self.last_accepted = None;
                self.attempted_through = 0;
                self.last_session_event = None;
                self.ledger = Some(PointsLedger::new(
                    now,
                    self.config.points_per_event,
                    self.config.max_points_per_minute,
                ));
            }
        }

        self.running = true;
        self.persist();
        Ok(())
    }

    /// Persisted state is reused only for the same identity and an intact chain
    fn usable_state(&self, state: PersistedState) -> Option<PersistedState> {
        let address = self.signer.address();
        if state.identity_address != address {
            warn!(
                persisted = %state.identity_address,
                current = %address,
                "persisted state belongs to another identity, starting a new session"
            );
            return None;
        }
        if let Err(e) = verify_links(&state.chain, ZERO_HASH).into_result() {
            warn!(error = %e, "persisted chain failed verification, starting a new session");
            return None;
        }
        Some(state)
    }

    /// Detach ingestion and the session timer
    ///
    /// An in-flight commit may still complete; its outcome is persisted.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.clear_buffers();
        self.persist();
        info!("session stopped");
    }

    /// Stop and release the session; a later `start` reloads from storage
    pub fn teardown(&mut self) {
        self.stop();
        self.ledger = None;
        self.in_flight = None;
        self.pending = None;
        self.last_accepted = None;
        self.commit_state = CommitState::Idle;
        self.attempted_through = 0;
        self.last_session_event = None;
    }

    /// Re-anchor time gating at `now`. Restarts never do this implicitly.
    pub fn reset_session_clock(&mut self, now: DateTime<Utc>) -> Result<(), NotabotError> {
        let ledger = self.ledger.as_mut().ok_or(NotabotError::NotStarted)?;
        ledger.reset_session_clock(now);
        info!(session_start = %now, "session clock reset");
        self.persist();
        Ok(())
    }

    fn clear_buffers(&mut self) {
        self.pointer.clear();
        self.scroll.clear();
        self.focus.clear();
        self.touch.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    pub fn ingest_pointer(&mut self, sample: PointerSample) -> Result<Vec<Credit>, NotabotError> {
        if !self.accepting() {
            return Ok(Vec::new());
        }
        match self.pointer.ingest(sample) {
            Ingest::WindowReady(window) => {
                let score = entropy::pointer_score(&window);
                debug!(
                    curvature = score.curvature,
                    velocity_variance = score.velocity_variance,
                    timing_entropy = score.timing_entropy,
                    "pointer window scored"
                );
                self.observe(&[(EventType::MouseEntropy, score.composite)], sample.timestamp)
            }
            _ => Ok(Vec::new()),
        }
    }

    pub fn ingest_scroll(&mut self, sample: ScrollSample) -> Result<Vec<Credit>, NotabotError> {
        if !self.accepting() {
            return Ok(Vec::new());
        }
        match self.scroll.ingest(sample) {
            Ingest::WindowReady(window) => {
                let score = entropy::scroll_score(&window);
                self.observe(&[(EventType::ScrollPattern, score)], sample.timestamp)
            }
            _ => Ok(Vec::new()),
        }
    }

    pub fn ingest_focus(&mut self, sample: FocusSample) -> Result<Vec<Credit>, NotabotError> {
        if !self.accepting() {
            return Ok(Vec::new());
        }
        match self.focus.ingest(sample) {
            Ingest::WindowReady(window) => {
                let score = entropy::focus_score(&window, self.config.focus_window());
                self.observe(&[(EventType::FocusPattern, score)], sample.timestamp)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// A touch window can yield path, pressure and multitouch observations
    pub fn ingest_touch(&mut self, sample: TouchSample) -> Result<Vec<Credit>, NotabotError> {
        if !self.accepting() {
            return Ok(Vec::new());
        }
        match self.touch.ingest(sample) {
            Ingest::WindowReady(window) => {
                let scores = entropy::touch_scores(&window);
                let mut observations = vec![(EventType::TouchPath, scores.path.composite)];
                if let Some(pressure) = scores.pressure {
                    observations.push((EventType::TouchPressure, pressure));
                }
                if let Some(multitouch) = scores.multitouch {
                    observations.push((EventType::MultitouchGesture, multitouch));
                }
                self.observe(&observations, sample.timestamp)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Session timer; emits at most one session-duration observation a minute
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<Credit>, NotabotError> {
        if !self.accepting() {
            return Ok(Vec::new());
        }
        if let Some(last) = self.last_session_event {
            if now - last < Duration::seconds(SESSION_EVENT_INTERVAL_SECS) {
                return Ok(Vec::new());
            }
        }
        let session_start = self
            .ledger
            .as_ref()
            .map(|l| l.session_start())
            .ok_or(NotabotError::NotStarted)?;

        let score =
            entropy::session_duration_score(now - session_start, self.config.session_ceiling_minutes);
        self.last_session_event = Some(now);
        self.observe(&[(EventType::SessionDuration, score)], now)
    }

    /// Record a scored observation from a host-side analyzer
    pub fn record_observation(
        &mut self,
        event_type: EventType,
        entropy_score: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<Credit>, NotabotError> {
        if !self.accepting() {
            return Ok(None);
        }
        Ok(self.observe(&[(event_type, entropy_score)], at)?.pop())
    }

    fn accepting(&self) -> bool {
        if !self.running {
            debug!("tracker not running, ignoring input");
        }
        self.running
    }

    /// Append every observation at or above the threshold
    fn observe(
        &mut self,
        observations: &[(EventType, f64)],
        at: DateTime<Utc>,
    ) -> Result<Vec<Credit>, NotabotError> {
        let threshold = self.config.entropy_threshold;
        let ledger = self.ledger.as_mut().ok_or(NotabotError::NotStarted)?;

        let mut credits = Vec::new();
        let mut failure = None;
        for &(event_type, score) in observations {
            if !score.is_finite() || score < threshold {
                debug!(
                    event_type = event_type.as_str(),
                    score, threshold, "observation below threshold"
                );
                continue;
            }

            match ledger.append(event_type, score, at, self.signer.as_ref()) {
                Ok(credit) => {
                    info!(
                        event_type = event_type.as_str(),
                        score,
                        credited = credit.credited,
                        points = ledger.current_points(),
                        events = ledger.len(),
                        "event appended"
                    );
                    credits.push(credit);
                }
                Err(NotabotError::OutOfOrder { timestamp, tail }) => {
                    debug!(%timestamp, %tail, "observation precedes chain tail, dropped");
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if !credits.is_empty() {
            self.persist();
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(credits),
        }
    }

    // ------------------------------------------------------------------
    // Commit protocol
    // ------------------------------------------------------------------

    /// Whether a commit attempt should be made at `now`
    pub fn commit_due(&self, now: DateTime<Utc>) -> bool {
        match &self.commit_state {
            CommitState::Idle => {
                let len = self.ledger.as_ref().map_or(0, |l| l.len() as u64);
                len.saturating_sub(self.attempted_through) >= self.config.commit_interval
            }
            CommitState::PendingDeferred { retry_at } | CommitState::PendingRetry { retry_at, .. } => {
                now >= *retry_at
            }
            CommitState::Committing | CommitState::Denied { .. } => false,
        }
    }

    /// Build the next request and mark it in flight
    ///
    /// A parked snapshot always goes first; live events are only submitted
    /// once nothing is pending.
    pub fn begin_commit(&mut self, now: DateTime<Utc>) -> Result<CommitTicket, NotabotError> {
        self.check_submittable(now)?;
        if self.pending.is_some() {
            return self.begin_retry(now);
        }

        let ledger = self.ledger.as_ref().ok_or(NotabotError::NotStarted)?;
        let accepted = self.last_accepted.as_ref().map_or(0, |c| c.event_count);
        let commitment = ledger
            .commitment(now)
            .ok_or_else(|| NotabotError::NothingToCommit("chain is empty".to_string()))?;
        if commitment.event_count <= accepted {
            return Err(NotabotError::NothingToCommit(
                "no events since the last accepted commitment".to_string(),
            ));
        }

        let request = CommitRequest {
            event_chain: ledger.segment_from(accepted as usize).to_vec(),
            identity_address: self.signer.address(),
            public_key: hex::encode(self.signer.public_key()),
            request_funding: true,
            commitment,
        };
        self.attempted_through = request.commitment.event_count;
        Ok(self.dispatch(CommitTicket::new(request, 1, None)))
    }

    /// Re-submit exactly the parked snapshot
    pub fn begin_retry(&mut self, now: DateTime<Utc>) -> Result<CommitTicket, NotabotError> {
        self.check_submittable(now)?;
        let pending = self.pending.as_ref().ok_or(NotabotError::NoPendingCommit)?;

        let attempt = match &self.commit_state {
            CommitState::PendingRetry { attempts, .. } => attempts + 1,
            _ => 1,
        };
        let request = CommitRequest {
            commitment: pending.commitment.clone(),
            event_chain: pending.events.clone(),
            identity_address: self.signer.address(),
            public_key: hex::encode(self.signer.public_key()),
            request_funding: true,
        };
        let ticket = CommitTicket::new(request, attempt, Some(pending.stored_at));
        Ok(self.dispatch(ticket))
    }

    fn check_submittable(&self, now: DateTime<Utc>) -> Result<(), NotabotError> {
        match &self.commit_state {
            CommitState::Committing => Err(NotabotError::CommitInFlight),
            CommitState::Denied { reason, .. } => Err(NotabotError::CommitDenied {
                reason: reason.to_string(),
            }),
            CommitState::PendingDeferred { retry_at } | CommitState::PendingRetry { retry_at, .. }
                if now < *retry_at =>
            {
                Err(NotabotError::CommitDeferred { retry_at: *retry_at })
            }
            _ => Ok(()),
        }
    }

    fn dispatch(&mut self, ticket: CommitTicket) -> CommitTicket {
        self.commit_state = CommitState::Committing;
        self.in_flight = Some(ticket.id);
        info!(
            event_count = ticket.request.commitment.event_count,
            segment = ticket.request.event_chain.len(),
            attempt = ticket.attempt,
            retry = ticket.is_retry,
            "commit started"
        );
        self.persist();
        ticket
    }

    /// Apply the authority's answer (or the transport failure) for `ticket`
    pub fn complete_commit(
        &mut self,
        ticket: CommitTicket,
        result: Result<CommitResponse, NotabotError>,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, NotabotError> {
        if self.in_flight != Some(ticket.id) {
            return Err(NotabotError::TicketMismatch);
        }
        self.in_flight = None;

        let outcome = match result {
            Ok(CommitResponse::Accepted {
                transaction_ref,
                duplicate,
            }) => {
                let commitment = ticket.request.commitment;
                let event_count = commitment.event_count;
                let newer = self
                    .last_accepted
                    .as_ref()
                    .map_or(true, |c| c.event_count < event_count);
                if newer {
                    self.last_accepted = Some(commitment);
                }
                self.pending = None;
                self.commit_state = CommitState::Idle;
                info!(%transaction_ref, duplicate, event_count, "commit accepted");
                CommitOutcome::Accepted {
                    transaction_ref,
                    duplicate,
                    event_count,
                }
            }
            Ok(CommitResponse::Deferred {
                wait_seconds,
                unfunded_points,
            }) => {
                let retry_at = now + Duration::seconds(wait_seconds.max(0));
                self.park(&ticket, now);
                self.commit_state = CommitState::PendingDeferred { retry_at };
                info!(%retry_at, unfunded_points, "commit deferred");
                CommitOutcome::Deferred {
                    retry_at,
                    unfunded_points,
                }
            }
            Ok(CommitResponse::Denied { reason, detail }) => {
                self.pending = None;
                self.commit_state = CommitState::Denied {
                    reason,
                    detail: detail.clone(),
                };
                warn!(reason = reason.as_str(), %detail, "commit denied");
                CommitOutcome::Denied { reason, detail }
            }
            Ok(CommitResponse::Unavailable { detail }) => self.schedule_retry(&ticket, detail, now),
            Err(e) => self.schedule_retry(&ticket, e.to_string(), now),
        };

        self.persist();
        Ok(outcome)
    }

    fn park(&mut self, ticket: &CommitTicket, now: DateTime<Utc>) {
        self.pending = Some(PendingCommit {
            commitment: ticket.request.commitment.clone(),
            events: ticket.request.event_chain.clone(),
            stored_at: ticket.snapshot_stored_at.unwrap_or(now),
        });
    }

    fn schedule_retry(&mut self, ticket: &CommitTicket, error: String, now: DateTime<Utc>) -> CommitOutcome {
        let attempts = ticket.attempt;
        let retry_at = now + self.config.retry_backoff(attempts);
        self.park(ticket, now);
        self.commit_state = CommitState::PendingRetry { attempts, retry_at };
        warn!(attempts, %retry_at, %error, "commit failed, retry scheduled");
        CommitOutcome::RetryScheduled {
            attempts,
            retry_at,
            error,
        }
    }

    /// Begin, submit and complete in one call
    pub async fn commit(
        &mut self,
        transport: &dyn CommitTransport,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, NotabotError> {
        let ticket = self.begin_commit(now)?;
        let result = transport.submit(&ticket.request).await;
        self.complete_commit(ticket, result, now)
    }

    /// Re-submit the parked snapshot; live events are never merged into it
    pub async fn retry_pending_commit(
        &mut self,
        transport: &dyn CommitTransport,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, NotabotError> {
        let ticket = self.begin_retry(now)?;
        let result = transport.submit(&ticket.request).await;
        self.complete_commit(ticket, result, now)
    }

    /// Commit whatever is outstanding, if anything
    pub async fn flush(
        &mut self,
        transport: &dyn CommitTransport,
        now: DateTime<Utc>,
    ) -> Result<Option<CommitOutcome>, NotabotError> {
        if !self.has_uncommitted() {
            return Ok(None);
        }
        self.commit(transport, now).await.map(Some)
    }

    fn has_uncommitted(&self) -> bool {
        let accepted = self.last_accepted.as_ref().map_or(0, |c| c.event_count);
        let len = self.ledger.as_ref().map_or(0, |l| l.len() as u64);
        self.pending.is_some() || len > accepted
    }

    /// Clear a denial after external remediation. Returns false if not denied.
    pub fn acknowledge_denial(&mut self) -> bool {
        if !matches!(self.commit_state, CommitState::Denied { .. }) {
            return false;
        }
        self.commit_state = CommitState::Idle;
        info!("denial acknowledged");
        self.persist();
        true
    }

    // ------------------------------------------------------------------
    // Read API
    // ------------------------------------------------------------------

    pub fn score(&self) -> Score {
        self.ledger.as_ref().map(|l| l.score()).unwrap_or(Score {
            points: 0,
            event_count: 0,
            last_update: None,
        })
    }

    pub fn event_chain(&self) -> &[NotabotEvent] {
        self.ledger.as_ref().map(|l| l.chain()).unwrap_or(&[])
    }

    pub fn commit_state(&self) -> &CommitState {
        &self.commit_state
    }

    pub fn pending_commit(&self) -> Option<&PendingCommit> {
        self.pending.as_ref()
    }

    pub fn last_accepted(&self) -> Option<&Commitment> {
        self.last_accepted.as_ref()
    }

    pub fn session_start(&self) -> Option<DateTime<Utc>> {
        self.ledger.as_ref().map(|l| l.session_start())
    }

    /// State as it would be persisted
    pub fn persisted_state(&self) -> Option<PersistedState> {
        let ledger = self.ledger.as_ref()?;
        Some(PersistedState {
            version: STATE_VERSION,
            identity_address: self.signer.address(),
            public_key: hex::encode(self.signer.public_key()),
            session_start: ledger.session_start(),
            last_session_event: self.last_session_event,
            chain: ledger.chain().to_vec(),
            current_points: ledger.current_points(),
            last_accepted: self.last_accepted.clone(),
            pending_commit: self.pending.clone(),
            commit_state: self.commit_state.clone(),
        })
    }

    fn persist(&self) {
        let Some(state) = self.persisted_state() else {
            return;
        };
        if let Err(e) = self.store.save(&state) {
            warn!(error = %e, "failed to persist tracker state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{Authority, InMemoryCommitmentStore};
    use crate::commit::InProcessTransport;
    use crate::config::AdmissionPolicy;
    use crate::identity::{Ed25519Identity, Ed25519Verifier};
    use crate::protocol::DenialReason;
    use crate::storage::MemoryStateStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use crate::types::FocusKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const HUMAN_GAPS_MS: [i64; 5] = [800, 2300, 500, 3700, 1200];

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    fn identity() -> Arc<Ed25519Identity> {
        Arc::new(Ed25519Identity::from_seed([21u8; 32]))
    }

    fn tracker_with(config: TrackerConfig, store: Arc<MemoryStateStore>) -> NotabotTracker {
        NotabotTracker::new(config, identity(), Box::new(store)).unwrap()
    }

    /// Append `count` qualifying observations with human-like spacing
    fn record_human(tracker: &mut NotabotTracker, from: DateTime<Utc>, count: usize) -> DateTime<Utc> {
        let mut at = from;
        for i in 0..count {
            at += Duration::milliseconds(HUMAN_GAPS_MS[i % HUMAN_GAPS_MS.len()]);
            tracker
                .record_observation(EventType::MouseEntropy, 0.8, at)
                .unwrap();
        }
        at
    }

    /// Transport that replays canned answers
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<CommitResponse, NotabotError>>>,
        seen: Mutex<Vec<CommitRequest>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<CommitResponse, NotabotError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommitTransport for ScriptedTransport {
        async fn submit(&self, request: &CommitRequest) -> Result<CommitResponse, NotabotError> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(NotabotError::Transport("no scripted reply".to_string())))
        }
    }

    fn settable_transport(authority: Arc<Authority>) -> (InProcessTransport, Arc<Mutex<DateTime<Utc>>>) {
        let clock = Arc::new(Mutex::new(t0()));
        let handle = clock.clone();
        let transport = InProcessTransport::with_clock(authority, move || *handle.lock().unwrap());
        (transport, clock)
    }

    /// Store whose writes always fail
    struct FailingStore;

    impl StateStore for FailingStore {
        fn load(&self) -> Result<Option<PersistedState>, NotabotError> {
            Ok(None)
        }

        fn save(&self, _state: &PersistedState) -> Result<(), NotabotError> {
            Err(NotabotError::Persistence("disk full".to_string()))
        }
    }

    /// Memory store that counts writes
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStateStore,
        saves: AtomicUsize,
    }

    impl StateStore for CountingStore {
        fn load(&self) -> Result<Option<PersistedState>, NotabotError> {
            self.inner.load()
        }

        fn save(&self, state: &PersistedState) -> Result<(), NotabotError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(state)
        }
    }

    fn authority() -> Arc<Authority> {
        Arc::new(Authority::new(
            AdmissionPolicy::default(),
            Arc::new(InMemoryCommitmentStore::new()),
            Arc::new(Ed25519Verifier),
        ))
    }

    #[test]
    fn test_session_restored_with_original_anchor() {
        let store = Arc::new(MemoryStateStore::new());
        let mut tracker = tracker_with(TrackerConfig::default(), store.clone());
        tracker.start(t0()).unwrap();
        record_human(&mut tracker, t0() + Duration::minutes(2), 3);
        let score = tracker.score();
        tracker.stop();

        let mut resumed = tracker_with(TrackerConfig::default(), store);
        resumed.start(t0() + Duration::hours(3)).unwrap();

        assert_eq!(resumed.session_start(), Some(t0()));
        assert_eq!(resumed.score(), score);
        assert_eq!(resumed.event_chain().len(), 3);
    }

    #[test]
    fn test_foreign_state_not_restored() {
        let store = Arc::new(MemoryStateStore::new());
        let mut tracker = tracker_with(TrackerConfig::default(), store.clone());
        tracker.start(t0()).unwrap();
        record_human(&mut tracker, t0() + Duration::minutes(2), 2);

        let other = Arc::new(Ed25519Identity::from_seed([99u8; 32]));
        let mut foreign =
            NotabotTracker::new(TrackerConfig::default(), other, Box::new(store)).unwrap();
        foreign.start(t0() + Duration::hours(1)).unwrap();
        assert!(foreign.event_chain().is_empty());
        assert_eq!(foreign.session_start(), Some(t0() + Duration::hours(1)));
    }

    #[test]
    fn test_pointer_window_scored_and_thresholded() {
        let config = TrackerConfig {
            buffer_capacity: 12,
            retained_tail: 2,
            ..TrackerConfig::default()
        };

        // Straight constant-rate movement scores near zero and is discarded
        let mut robotic = tracker_with(config.clone(), Arc::new(MemoryStateStore::new()));
        robotic.start(t0()).unwrap();
        for i in 0..12 {
            let sample = PointerSample {
                x: i as f64 * 10.0,
                y: 0.0,
                timestamp: t0() + Duration::milliseconds(100 * i),
            };
            assert!(robotic.ingest_pointer(sample).unwrap().is_empty());
        }
        assert!(robotic.event_chain().is_empty());

        // With the threshold at zero every closed window is recorded
        let permissive = TrackerConfig {
            entropy_threshold: 0.0,
            ..config
        };
        let mut tracker = tracker_with(permissive, Arc::new(MemoryStateStore::new()));
        tracker.start(t0()).unwrap();
        let mut appended = 0;
        for i in 0..12 {
            let sample = PointerSample {
                x: (i as f64 * 1.7).sin() * 80.0,
                y: (i * i) as f64,
                timestamp: t0() + Duration::milliseconds(100 * i + (i * 37) % 90),
            };
            appended += tracker.ingest_pointer(sample).unwrap().len();
        }
        assert_eq!(appended, 1);
        assert_eq!(tracker.event_chain()[0].event_type, EventType::MouseEntropy);
    }

    #[test]
    fn test_input_ignored_after_stop() {
        let mut tracker = tracker_with(TrackerConfig::default(), Arc::new(MemoryStateStore::new()));
        tracker.start(t0()).unwrap();
        tracker.stop();

        assert_eq!(
            tracker
                .record_observation(EventType::ScrollPattern, 0.9, t0() + Duration::minutes(1))
                .unwrap(),
            None
        );
        assert!(tracker.tick(t0() + Duration::minutes(20)).unwrap().is_empty());
        assert!(tracker.event_chain().is_empty());
    }

    #[test]
    fn test_tick_emits_session_duration() {
        let mut tracker = tracker_with(TrackerConfig::default(), Arc::new(MemoryStateStore::new()));
        tracker.start(t0()).unwrap();

        // Two minutes in scores 0.2, below threshold
        assert!(tracker.tick(t0() + Duration::minutes(2)).unwrap().is_empty());
        let credits = tracker.tick(t0() + Duration::minutes(8)).unwrap();
        assert_eq!(credits.len(), 1);
        // Too soon after the previous tick
        assert!(tracker.tick(t0() + Duration::seconds(8 * 60 + 30)).unwrap().is_empty());

        assert_eq!(tracker.event_chain()[0].event_type, EventType::SessionDuration);
    }

    #[test]
    fn test_commit_due_after_interval() {
        let config = TrackerConfig {
            commit_interval: 5,
            ..TrackerConfig::default()
        };
        let mut tracker = tracker_with(config, Arc::new(MemoryStateStore::new()));
        tracker.start(t0()).unwrap();

        let at = record_human(&mut tracker, t0() + Duration::minutes(1), 4);
        assert!(!tracker.commit_due(at));
        let at = record_human(&mut tracker, at, 1);
        assert!(tracker.commit_due(at));

        tracker.begin_commit(at).unwrap();
        assert!(!tracker.commit_due(at));
    }

    #[tokio::test]
    async fn test_commit_accepted_end_to_end() {
        let authority = authority();
        let transport = InProcessTransport::with_clock(authority.clone(), t0);
        let store = Arc::new(MemoryStateStore::new());
        let mut tracker = tracker_with(TrackerConfig::default(), store.clone());
        tracker.start(t0() - Duration::hours(1)).unwrap();

        let at = record_human(&mut tracker, t0(), 12);
        let outcome = tracker.commit(&transport, at).await.unwrap();
        assert!(matches!(
            outcome,
            CommitOutcome::Accepted {
                duplicate: false,
                event_count: 12,
                ..
            }
        ));
        assert_eq!(tracker.commit_state(), &CommitState::Idle);
        assert_eq!(tracker.last_accepted().unwrap().event_count, 12);

        // Nothing new to commit
        assert!(matches!(
            tracker.begin_commit(at),
            Err(NotabotError::NothingToCommit(_))
        ));
        assert_eq!(tracker.flush(&transport, at).await.unwrap(), None);

        let persisted = store.snapshot().unwrap();
        assert_eq!(persisted.last_accepted.unwrap().event_count, 12);
        assert_eq!(persisted.commit_state, CommitState::Idle);
    }

    #[tokio::test]
    async fn test_deferred_retry_submits_only_snapshot() {
        let authority = authority();
        let (transport, clock) = settable_transport(authority.clone());
        let mut tracker = tracker_with(TrackerConfig::default(), Arc::new(MemoryStateStore::new()));
        tracker.start(t0() - Duration::hours(1)).unwrap();

        let at = record_human(&mut tracker, t0(), 10);
        tracker.commit(&transport, at).await.unwrap();

        // Half an hour later the funding cooldown defers the next commit
        let later = t0() + Duration::minutes(30);
        *clock.lock().unwrap() = later;
        let at = record_human(&mut tracker, later, 8);
        let outcome = tracker.commit(&transport, at).await.unwrap();
        let CommitOutcome::Deferred { retry_at, .. } = outcome else {
            panic!("expected deferral, got {:?}", outcome);
        };
        assert!((retry_at - at - Duration::minutes(30)).num_seconds().abs() <= 30);
        assert_eq!(tracker.pending_commit().unwrap().commitment.event_count, 18);

        // Live events keep accruing while the snapshot waits
        let at = record_human(&mut tracker, at, 6);
        assert!(matches!(
            tracker.begin_commit(at),
            Err(NotabotError::CommitDeferred { .. })
        ));
        assert!(tracker.commit_due(retry_at));

        *clock.lock().unwrap() = retry_at;
        let live_before = tracker.score();
        let outcome = tracker.retry_pending_commit(&transport, retry_at).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Accepted { event_count: 18, .. }));

        assert_eq!(tracker.last_accepted().unwrap().event_count, 18);
        assert!(tracker.pending_commit().is_none());
        assert_eq!(tracker.score(), live_before);
        assert_eq!(tracker.event_chain().len(), 24);
    }

    #[tokio::test]
    async fn test_transient_failures_back_off() {
        let transport = ScriptedTransport::new(vec![
            Err(NotabotError::Transport("connection reset".to_string())),
            Ok(CommitResponse::Unavailable {
                detail: "store full".to_string(),
            }),
            Ok(CommitResponse::Accepted {
                transaction_ref: "tx-9".to_string(),
                duplicate: false,
            }),
        ]);
        let mut tracker = tracker_with(TrackerConfig::default(), Arc::new(MemoryStateStore::new()));
        tracker.start(t0()).unwrap();
        let at = record_human(&mut tracker, t0() + Duration::minutes(5), 6);

        let first = tracker.commit(&transport, at).await.unwrap();
        assert_eq!(
            first,
            CommitOutcome::RetryScheduled {
                attempts: 1,
                retry_at: at + Duration::seconds(30),
                error: "Transport error: connection reset".to_string(),
            }
        );

        let retry_at = at + Duration::seconds(30);
        let second = tracker.commit(&transport, retry_at).await.unwrap();
        assert!(matches!(
            second,
            CommitOutcome::RetryScheduled { attempts: 2, retry_at: r, .. } if r == retry_at + Duration::seconds(60)
        ));

        let third = tracker
            .retry_pending_commit(&transport, retry_at + Duration::seconds(60))
            .await
            .unwrap();
        assert!(matches!(third, CommitOutcome::Accepted { event_count: 6, .. }));

        // Every attempt carried the same snapshot
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| r.commitment == seen[0].commitment));
    }

    #[tokio::test]
    async fn test_denial_requires_acknowledgement() {
        let transport = ScriptedTransport::new(vec![Ok(CommitResponse::Denied {
            reason: DenialReason::UniformTiming,
            detail: "too regular".to_string(),
        })]);
        let mut tracker = tracker_with(TrackerConfig::default(), Arc::new(MemoryStateStore::new()));
        tracker.start(t0()).unwrap();
        let at = record_human(&mut tracker, t0() + Duration::minutes(5), 6);

        let outcome = tracker.commit(&transport, at).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Denied { .. }));
        assert!(!tracker.commit_due(at + Duration::days(1)));
        assert!(matches!(
            tracker.begin_commit(at + Duration::days(1)),
            Err(NotabotError::CommitDenied { .. })
        ));

        assert!(tracker.acknowledge_denial());
        assert!(!tracker.acknowledge_denial());
        assert!(tracker.begin_commit(at + Duration::days(1)).is_ok());
    }

    #[test]
    fn test_in_flight_guard_and_ticket_check() {
        let mut tracker = tracker_with(TrackerConfig::default(), Arc::new(MemoryStateStore::new()));
        tracker.start(t0()).unwrap();
        let at = record_human(&mut tracker, t0() + Duration::minutes(5), 3);

        let ticket = tracker.begin_commit(at).unwrap();
        assert!(matches!(tracker.begin_commit(at), Err(NotabotError::CommitInFlight)));

        let mut forged = ticket.clone();
        forged.id = Uuid::new_v4();
        assert!(matches!(
            tracker.complete_commit(forged, Err(NotabotError::Transport("x".into())), at),
            Err(NotabotError::TicketMismatch)
        ));

        let accepted = Ok(CommitResponse::Accepted {
            transaction_ref: "tx-1".to_string(),
            duplicate: false,
        });
        assert!(tracker.complete_commit(ticket, accepted, at).is_ok());
    }

    #[test]
    fn test_outcome_persisted_after_stop() {
        let store = Arc::new(MemoryStateStore::new());
        let mut tracker = tracker_with(TrackerConfig::default(), store.clone());
        tracker.start(t0()).unwrap();
        let at = record_human(&mut tracker, t0() + Duration::minutes(5), 4);

        let ticket = tracker.begin_commit(at).unwrap();
        assert_eq!(store.snapshot().unwrap().commit_state, CommitState::Committing);
        tracker.stop();

        let reply = Ok(CommitResponse::Deferred {
            wait_seconds: 600,
            unfunded_points: 3,
        });
        tracker.complete_commit(ticket, reply, at).unwrap();

        let persisted = store.snapshot().unwrap();
        assert_eq!(
            persisted.commit_state,
            CommitState::PendingDeferred {
                retry_at: at + Duration::minutes(10)
            }
        );
        assert_eq!(persisted.pending_commit.unwrap().commitment.event_count, 4);
    }

    #[test]
    fn test_interrupted_commit_recovered_on_restart() {
        let store = Arc::new(MemoryStateStore::new());
        let mut tracker = tracker_with(TrackerConfig::default(), store.clone());
        tracker.start(t0()).unwrap();
        let at = record_human(&mut tracker, t0() + Duration::minutes(5), 4);

        // First attempt fails transiently, retry is interrupted mid-flight
        let ticket = tracker.begin_commit(at).unwrap();
        tracker
            .complete_commit(ticket, Err(NotabotError::Transport("timeout".into())), at)
            .unwrap();
        let retry_at = at + Duration::seconds(30);
        tracker.begin_retry(retry_at).unwrap();
        drop(tracker);

        let mut resumed = tracker_with(TrackerConfig::default(), store);
        let restart = retry_at + Duration::minutes(1);
        resumed.start(restart).unwrap();
        assert_eq!(
            resumed.commit_state(),
            &CommitState::PendingRetry {
                attempts: 1,
                retry_at: restart
            }
        );
        assert!(resumed.commit_due(restart));
        assert_eq!(resumed.pending_commit().unwrap().commitment.event_count, 4);
    }

    #[test]
    fn test_focus_window_opening_on_blur_qualifies() {
        let mut tracker = tracker_with(TrackerConfig::default(), Arc::new(MemoryStateStore::new()));
        tracker.start(t0()).unwrap();

        let mut credits = Vec::new();
        for i in 0..12 {
            let kind = if i % 2 == 0 { FocusKind::Blur } else { FocusKind::Focus };
            let sample = FocusSample {
                kind,
                timestamp: t0() + Duration::seconds(10 * (i + 1)),
            };
            credits.extend(tracker.ingest_focus(sample).unwrap());
        }

        // Five focus→blur cycles reach the cap
        assert_eq!(credits.len(), 1);
        let event = &tracker.event_chain()[0];
        assert_eq!(event.event_type, EventType::FocusPattern);
        assert_eq!(event.entropy_score, 1.0);
    }

    #[test]
    fn test_session_spacing_survives_restart() {
        let store = Arc::new(MemoryStateStore::new());
        let mut tracker = tracker_with(TrackerConfig::default(), store.clone());
        tracker.start(t0()).unwrap();
        assert_eq!(tracker.tick(t0() + Duration::minutes(8)).unwrap().len(), 1);
        tracker.stop();
        drop(tracker);

        let mut resumed = tracker_with(TrackerConfig::default(), store);
        resumed.start(t0() + Duration::seconds(8 * 60 + 10)).unwrap();
        assert!(resumed.tick(t0() + Duration::seconds(8 * 60 + 30)).unwrap().is_empty());
        assert_eq!(resumed.tick(t0() + Duration::minutes(9)).unwrap().len(), 1);
        assert_eq!(resumed.event_chain().len(), 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_fatal() {
        let transport = InProcessTransport::with_clock(authority(), t0);
        let mut tracker =
            NotabotTracker::new(TrackerConfig::default(), identity(), Box::new(FailingStore)).unwrap();
        tracker.start(t0() - Duration::hours(1)).unwrap();

        let at = record_human(&mut tracker, t0(), 8);
        let score = tracker.score();
        assert_eq!(score.event_count, 8);
        assert!(score.points > 0);

        let outcome = tracker.commit(&transport, at).await.unwrap();
        assert!(matches!(
            outcome,
            CommitOutcome::Accepted {
                duplicate: false,
                event_count: 8,
                ..
            }
        ));
        assert_eq!(tracker.commit_state(), &CommitState::Idle);
        assert_eq!(tracker.last_accepted().unwrap().event_count, 8);
        assert_eq!(tracker.score(), score);
    }

    #[test]
    fn test_teardown_saves_once() {
        let store = Arc::new(CountingStore::default());
        let mut tracker =
            NotabotTracker::new(TrackerConfig::default(), identity(), Box::new(store.clone())).unwrap();
        tracker.start(t0()).unwrap();
        let after_start = store.saves.load(Ordering::SeqCst);

        tracker.teardown();
        assert_eq!(store.saves.load(Ordering::SeqCst), after_start + 1);
        assert!(tracker.persisted_state().is_none());

        // Already stopped; nothing left to write
        tracker.teardown();
        assert_eq!(store.saves.load(Ordering::SeqCst), after_start + 1);
    }
}

//! Core data types
//!
//! Raw samples flow in from the host's event loop, scored observations are
//! chained as [`NotabotEvent`]s, and [`Commitment`]s summarize the chain for
//! an external authority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Behavioral event types recorded in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MouseEntropy,
    ScrollPattern,
    FocusPattern,
    TouchPressure,
    TouchPath,
    MultitouchGesture,
    SessionDuration,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MouseEntropy => "mouse_entropy",
            EventType::ScrollPattern => "scroll_pattern",
            EventType::FocusPattern => "focus_pattern",
            EventType::TouchPressure => "touch_pressure",
            EventType::TouchPath => "touch_path",
            EventType::MultitouchGesture => "multitouch_gesture",
            EventType::SessionDuration => "session_duration",
        }
    }
}

/// One scored behavioral observation, linked into the chain by hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotabotEvent {
    /// Capture time (device-local wall clock)
    pub timestamp: DateTime<Utc>,
    /// Observation channel
    pub event_type: EventType,
    /// Entropy score in [0, 1]
    pub entropy_score: f64,
    /// Hex hash of the prior event, or the zero hash for the first event
    pub previous_hash: String,
    /// Hex SHA-256 over the four linking fields
    pub hash: String,
    /// Hex signature over the raw hash bytes
    pub signature: String,
}

/// Summary checkpoint submitted to the authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    /// Points accrued over the whole chain
    pub total_points: u64,
    /// Hash of the last event covered
    pub chain_head: String,
    /// Number of events covered (from the start of the chain)
    pub event_count: u64,
    /// When the commitment was assembled
    pub last_update: DateTime<Utc>,
}

/// A commitment that could not be finalized, with the segment it covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommit {
    pub commitment: Commitment,
    /// Chain segment from the last accepted commitment up to `chain_head`
    pub events: Vec<NotabotEvent>,
    /// When the attempt was parked
    pub stored_at: DateTime<Utc>,
}

/// Score read API result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub points: u64,
    pub event_count: u64,
    /// Timestamp of the newest event, if any
    pub last_update: Option<DateTime<Utc>>,
}

/// Pointer (mouse) movement sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerSample {
    pub x: f64,
    pub y: f64,
    pub timestamp: DateTime<Utc>,
}

/// Scroll position sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollSample {
    /// Scroll offset in pixels along the scrolled axis
    pub position: f64,
    pub timestamp: DateTime<Utc>,
}

/// Window focus transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusKind {
    Focus,
    Blur,
}

/// Focus/blur sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusSample {
    pub kind: FocusKind,
    pub timestamp: DateTime<Utc>,
}

/// Touch sample (primary contact position plus contact metadata)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchSample {
    pub x: f64,
    pub y: f64,
    /// Normalized contact pressure, when the device reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    /// Number of simultaneous contacts
    #[serde(default = "default_touches")]
    pub touches: u8,
    pub timestamp: DateTime<Utc>,
}

fn default_touches() -> u8 {
    1
}

/// Common view over raw samples used by the collectors
pub trait Sample: Copy {
    fn timestamp(&self) -> DateTime<Utc>;

    /// Whether the sample carries usable values
    fn is_well_formed(&self) -> bool {
        true
    }
}

impl Sample for PointerSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn is_well_formed(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Sample for ScrollSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn is_well_formed(&self) -> bool {
        self.position.is_finite()
    }
}

impl Sample for FocusSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Sample for TouchSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn is_well_formed(&self) -> bool {
        let pressure_ok = match self.pressure {
            Some(p) => p.is_finite() && p >= 0.0,
            None => true,
        };
        self.x.is_finite() && self.y.is_finite() && pressure_ok && self.touches > 0
    }
}

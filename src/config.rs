//! Tunable configuration for the tracker and the authority
//!
//! Every heuristic threshold lives here so deployments can adjust them
//! without code changes.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::NotabotError;

/// Default per-channel buffer capacity
pub const DEFAULT_BUFFER_CAPACITY: usize = 50;

/// Default number of samples kept after a window is analyzed
pub const DEFAULT_RETAINED_TAIL: usize = 10;

/// Default points per fully-entropic event
pub const DEFAULT_POINTS_PER_EVENT: u64 = 10;

/// Client-side tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Samples buffered per pointer/scroll/touch channel before analysis
    pub buffer_capacity: usize,
    /// Samples buffered on the focus channel before analysis
    pub focus_buffer_capacity: usize,
    /// Samples kept after a window is analyzed
    pub retained_tail: usize,
    /// Focus samples kept after a window is analyzed
    pub focus_retained_tail: usize,
    /// Samples closer than this to the previous one are discarded
    pub min_sample_interval_ms: i64,
    /// Minimum score for an observation to be chained
    pub entropy_threshold: f64,
    /// Points for an event with entropy 1.0
    pub points_per_event: u64,
    /// Ceiling on point accrual rate against real elapsed time
    pub max_points_per_minute: f64,
    /// Appended events between automatic commit attempts
    pub commit_interval: u64,
    /// Session length at which the duration score saturates
    pub session_ceiling_minutes: f64,
    /// Lookback for counting focus/blur cycles
    pub focus_window_secs: i64,
    /// First backoff delay after a transient commit failure
    pub retry_backoff_base_secs: i64,
    /// Upper bound on the transient-failure backoff
    pub retry_backoff_cap_secs: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            focus_buffer_capacity: 12,
            retained_tail: DEFAULT_RETAINED_TAIL,
            focus_retained_tail: 2,
            min_sample_interval_ms: 10,
            entropy_threshold: 0.6,
            points_per_event: DEFAULT_POINTS_PER_EVENT,
            max_points_per_minute: 10.0,
            commit_interval: 50,
            session_ceiling_minutes: 10.0,
            focus_window_secs: 300,
            retry_backoff_base_secs: 30,
            retry_backoff_cap_secs: 30 * 60,
        }
    }
}

impl TrackerConfig {
    /// Load a configuration from JSON, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self, NotabotError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the tracker cannot run with
    pub fn validate(&self) -> Result<(), NotabotError> {
        if self.buffer_capacity < 3 {
            return Err(NotabotError::InvalidConfig(
                "buffer_capacity must be at least 3".to_string(),
            ));
        }
        if self.focus_buffer_capacity < 2 {
            return Err(NotabotError::InvalidConfig(
                "focus_buffer_capacity must be at least 2".to_string(),
            ));
        }
        if self.retained_tail >= self.buffer_capacity {
            return Err(NotabotError::InvalidConfig(
                "retained_tail must be smaller than buffer_capacity".to_string(),
            ));
        }
        if self.focus_retained_tail >= self.focus_buffer_capacity {
            return Err(NotabotError::InvalidConfig(
                "focus_retained_tail must be smaller than focus_buffer_capacity".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.entropy_threshold) {
            return Err(NotabotError::InvalidConfig(
                "entropy_threshold must be within [0, 1]".to_string(),
            ));
        }
        if !self.max_points_per_minute.is_finite() || self.max_points_per_minute < 0.0 {
            return Err(NotabotError::InvalidConfig(
                "max_points_per_minute must be a non-negative number".to_string(),
            ));
        }
        if self.commit_interval == 0 {
            return Err(NotabotError::InvalidConfig(
                "commit_interval must be positive".to_string(),
            ));
        }
        if self.session_ceiling_minutes <= 0.0 {
            return Err(NotabotError::InvalidConfig(
                "session_ceiling_minutes must be positive".to_string(),
            ));
        }
        if self.retry_backoff_base_secs <= 0
            || self.retry_backoff_cap_secs < self.retry_backoff_base_secs
        {
            return Err(NotabotError::InvalidConfig(
                "retry backoff must satisfy 0 < base <= cap".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_sample_interval(&self) -> Duration {
        Duration::milliseconds(self.min_sample_interval_ms)
    }

    pub fn focus_window(&self) -> Duration {
        Duration::seconds(self.focus_window_secs)
    }

    /// Backoff before the next retry after `attempts` consecutive transient failures
    pub fn retry_backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(20);
        let secs = self
            .retry_backoff_base_secs
            .saturating_mul(1_i64 << shift)
            .min(self.retry_backoff_cap_secs);
        Duration::seconds(secs)
    }
}

/// Authority-side admission policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionPolicy {
    /// Minimum time between two funded commits for one identity
    pub funding_cooldown_secs: i64,
    /// Average fundings per day above which an identity is denied
    pub max_fundings_per_day: f64,
    /// Interval stddev below `avg * threshold` is treated as scripted timing
    pub uniformity_threshold: f64,
    /// Intervals required before the uniformity check applies
    pub min_uniformity_intervals: usize,
    /// Funding timestamps retained per identity
    pub funding_history_cap: usize,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            funding_cooldown_secs: 3600,
            max_fundings_per_day: 30.0,
            uniformity_threshold: 0.1,
            min_uniformity_intervals: 5,
            funding_history_cap: 100,
        }
    }
}

impl AdmissionPolicy {
    pub fn from_json(json: &str) -> Result<Self, NotabotError> {
        let policy: Self = serde_json::from_str(json)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), NotabotError> {
        if self.funding_cooldown_secs < 0 {
            return Err(NotabotError::InvalidConfig(
                "funding_cooldown_secs must not be negative".to_string(),
            ));
        }
        if self.max_fundings_per_day <= 0.0 {
            return Err(NotabotError::InvalidConfig(
                "max_fundings_per_day must be positive".to_string(),
            ));
        }
        if self.uniformity_threshold < 0.0 {
            return Err(NotabotError::InvalidConfig(
                "uniformity_threshold must not be negative".to_string(),
            ));
        }
        if self.min_uniformity_intervals < 2 {
            return Err(NotabotError::InvalidConfig(
                "min_uniformity_intervals must be at least 2".to_string(),
            ));
        }
        if self.funding_history_cap == 0 {
            return Err(NotabotError::InvalidConfig(
                "funding_history_cap must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn funding_cooldown(&self) -> Duration {
        Duration::seconds(self.funding_cooldown_secs)
    }
}

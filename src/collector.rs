//! Signal collection
//!
//! Each channel owns a bounded ring buffer of timestamped samples. Collectors
//! only capture data; judgment happens in [`crate::entropy`].

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::debug;

use crate::types::Sample;

/// Why a sample was not buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Non-finite or otherwise unusable values
    Malformed,
    /// Timestamp earlier than the last accepted sample
    OutOfOrder,
    /// Arrived faster than the minimum inter-sample interval
    TooFast,
}

/// Result of ingesting one sample
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest<S> {
    /// Sample buffered; window not yet full
    Buffered,
    /// Sample dropped before buffering
    Rejected(RejectReason),
    /// Buffer reached capacity; the full window is handed back for analysis
    WindowReady(Vec<S>),
}

/// Bounded, time-ordered sample buffer for one channel
#[derive(Debug, Clone)]
pub struct SampleBuffer<S> {
    samples: VecDeque<S>,
    capacity: usize,
    retained_tail: usize,
    min_interval: Duration,
}

impl<S: Sample> SampleBuffer<S> {
    /// Create a buffer that hands back a window every `capacity` samples
    /// and keeps the newest `retained_tail` samples for continuity.
    pub fn new(capacity: usize, retained_tail: usize, min_interval: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            retained_tail: retained_tail.min(capacity.saturating_sub(1)),
            min_interval,
        }
    }

    /// Offer a sample to the buffer
    pub fn ingest(&mut self, sample: S) -> Ingest<S> {
        if !sample.is_well_formed() {
            debug!(channel_len = self.samples.len(), "dropping malformed sample");
            return Ingest::Rejected(RejectReason::Malformed);
        }

        if let Some(last) = self.samples.back() {
            let gap = sample.timestamp() - last.timestamp();
            if gap < Duration::zero() {
                debug!(gap_ms = gap.num_milliseconds(), "dropping out-of-order sample");
                return Ingest::Rejected(RejectReason::OutOfOrder);
            }
            if gap < self.min_interval {
                return Ingest::Rejected(RejectReason::TooFast);
            }
        }

        self.samples.push_back(sample);

        if self.samples.len() < self.capacity {
            return Ingest::Buffered;
        }

        let window: Vec<S> = self.samples.iter().copied().collect();
        while self.samples.len() > self.retained_tail {
            self.samples.pop_front();
        }
        Ingest::WindowReady(window)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp of the newest buffered sample
    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.timestamp())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

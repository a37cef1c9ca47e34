//! Entropy analyzers
//!
//! Pure functions that reduce a window of raw samples to a score in [0, 1].
//! Higher scores mean more naturally irregular input. Scripted input (straight
//! lines, constant speed, metronomic timing) scores near zero.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{FocusKind, FocusSample, PointerSample, ScrollSample, TouchSample};

/// Width of the inter-sample timing buckets
pub const TIMING_BIN_MS: f64 = 50.0;

/// Multiplier applied to deviation/path-length before clamping
const CURVATURE_SCALE: f64 = 5.0;

/// Composite weights for pointer-like channels
const CURVATURE_WEIGHT: f64 = 0.4;
const VELOCITY_WEIGHT: f64 = 0.3;
const TIMING_WEIGHT: f64 = 0.3;

/// Scroll bonus per direction reversal, and its ceiling
const REVERSAL_BONUS: f64 = 0.1;
const MAX_REVERSAL_BONUS: f64 = 0.3;

/// Focus score contributed by each focus→blur cycle
const FOCUS_SCORE_PER_CYCLE: f64 = 0.2;

/// Minimum focus→blur cycles before the focus channel scores at all
const MIN_FOCUS_CYCLES: u32 = 2;

/// Minimum multi-contact samples for a multitouch score
const MIN_MULTITOUCH_SAMPLES: usize = 5;

/// A position at a point in time, in milliseconds relative to an arbitrary origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathPoint {
    pub x: f64,
    pub y: f64,
    pub t_ms: f64,
}

impl PathPoint {
    fn at(x: f64, y: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            x,
            y,
            t_ms: timestamp.timestamp_millis() as f64,
        }
    }

    fn distance(&self, other: &PathPoint) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl From<&PointerSample> for PathPoint {
    fn from(s: &PointerSample) -> Self {
        PathPoint::at(s.x, s.y, s.timestamp)
    }
}

impl From<&TouchSample> for PathPoint {
    fn from(s: &TouchSample) -> Self {
        PathPoint::at(s.x, s.y, s.timestamp)
    }
}

/// Per-component breakdown of a pointer-like score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathScore {
    pub curvature: f64,
    pub velocity_variance: f64,
    pub timing_entropy: f64,
    pub composite: f64,
}

/// Scores derived from one touch window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchScores {
    pub path: PathScore,
    /// Present when enough samples report pressure
    pub pressure: Option<f64>,
    /// Present when enough samples had two or more contacts
    pub multitouch: Option<f64>,
}

/// Path curvature
///
/// For every interior sample, measure how far it sits from the point linearly
/// interpolated between its neighbours by elapsed-time ratio. The summed
/// deviation is normalized by total path length, scaled and clamped.
pub fn path_curvature(points: &[PathPoint]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }

    let path_length: f64 = points.windows(2).map(|p| p[0].distance(&p[1])).sum();
    if path_length <= 0.0 {
        return 0.0;
    }

    let deviation: f64 = points
        .windows(3)
        .map(|w| {
            let (prev, cur, next) = (&w[0], &w[1], &w[2]);
            let span = next.t_ms - prev.t_ms;
            let ratio = if span > 0.0 {
                (cur.t_ms - prev.t_ms) / span
            } else {
                0.5
            };
            let expected = PathPoint {
                x: prev.x + ratio * (next.x - prev.x),
                y: prev.y + ratio * (next.y - prev.y),
                t_ms: cur.t_ms,
            };
            cur.distance(&expected)
        })
        .sum();

    (deviation / path_length * CURVATURE_SCALE).clamp(0.0, 1.0)
}

/// Velocity variance
///
/// Coefficient of variation (population stddev / mean) of per-step speed.
/// Steps with no elapsed time are skipped.
pub fn velocity_variance(points: &[PathPoint]) -> f64 {
    let speeds: Vec<f64> = points
        .windows(2)
        .filter_map(|p| {
            let dt = p[1].t_ms - p[0].t_ms;
            (dt > 0.0).then(|| p[0].distance(&p[1]) / dt)
        })
        .collect();

    coefficient_of_variation(&speeds)
}

/// Timing entropy
///
/// Inter-sample intervals are bucketed into fixed-width bins; the Shannon
/// entropy of the bucket distribution is normalized by the maximum entropy
/// for the number of distinct bins observed.
pub fn timing_entropy(timestamps: &[DateTime<Utc>]) -> f64 {
    let mut bins: HashMap<i64, usize> = HashMap::new();
    let mut total = 0usize;

    for pair in timestamps.windows(2) {
        let dt = (pair[1] - pair[0]).num_milliseconds() as f64;
        if dt < 0.0 {
            continue;
        }
        *bins.entry((dt / TIMING_BIN_MS).floor() as i64).or_insert(0) += 1;
        total += 1;
    }

    if bins.len() <= 1 {
        return 0.0;
    }

    let n = total as f64;
    let entropy: f64 = bins
        .values()
        .map(|&count| {
            let p = count as f64 / n;
            -p * p.log2()
        })
        .sum();

    (entropy / (bins.len() as f64).log2()).clamp(0.0, 1.0)
}

/// Weighted pointer composite
///
/// Formula:
/// ```text
/// composite = 0.4 * curvature + 0.3 * velocity_variance + 0.3 * timing_entropy
/// ```
pub fn composite_score(curvature: f64, velocity_variance: f64, timing_entropy: f64) -> f64 {
    let score = CURVATURE_WEIGHT * curvature
        + VELOCITY_WEIGHT * velocity_variance
        + TIMING_WEIGHT * timing_entropy;
    score.clamp(0.0, 1.0)
}

fn path_score(points: &[PathPoint], timestamps: &[DateTime<Utc>]) -> PathScore {
    let curvature = path_curvature(points);
    let velocity_variance = velocity_variance(points);
    let timing_entropy = timing_entropy(timestamps);
    PathScore {
        curvature,
        velocity_variance,
        timing_entropy,
        composite: composite_score(curvature, velocity_variance, timing_entropy),
    }
}

/// Score a pointer movement window
pub fn pointer_score(samples: &[PointerSample]) -> PathScore {
    let points: Vec<PathPoint> = samples.iter().map(PathPoint::from).collect();
    let timestamps: Vec<DateTime<Utc>> = samples.iter().map(|s| s.timestamp).collect();
    path_score(&points, &timestamps)
}

/// Score a scroll window
///
/// One-dimensional velocity variance plus a bonus for direction reversals,
/// which are costly to fake cheaply.
pub fn scroll_score(samples: &[ScrollSample]) -> f64 {
    let points: Vec<PathPoint> = samples
        .iter()
        .map(|s| PathPoint::at(0.0, s.position, s.timestamp))
        .collect();
    let base = velocity_variance(&points);

    let bonus = (count_reversals(samples) as f64 * REVERSAL_BONUS).min(MAX_REVERSAL_BONUS);
    (base + bonus).clamp(0.0, 1.0)
}

/// Count changes of scroll direction, ignoring stationary steps
fn count_reversals(samples: &[ScrollSample]) -> u32 {
    let mut reversals = 0;
    let mut last_sign = 0.0;
    for pair in samples.windows(2) {
        let delta = pair[1].position - pair[0].position;
        if delta == 0.0 {
            continue;
        }
        let sign = delta.signum();
        if last_sign != 0.0 && sign != last_sign {
            reversals += 1;
        }
        last_sign = sign;
    }
    reversals
}

/// Score focus/blur behavior
///
/// Counts alternating focus→blur cycles within `window` of the newest sample.
/// Fewer than two cycles scores zero.
pub fn focus_score(samples: &[FocusSample], window: Duration) -> f64 {
    let Some(newest) = samples.iter().map(|s| s.timestamp).max() else {
        return 0.0;
    };
    let cutoff = newest - window;

    let cycles = samples
        .iter()
        .filter(|s| s.timestamp >= cutoff)
        .collect::<Vec<_>>()
        .windows(2)
        .filter(|w| w[0].kind == FocusKind::Focus && w[1].kind == FocusKind::Blur)
        .count() as u32;

    if cycles < MIN_FOCUS_CYCLES {
        return 0.0;
    }
    (cycles as f64 * FOCUS_SCORE_PER_CYCLE).min(1.0)
}

/// Score session duration
///
/// Grows linearly with elapsed wall-clock minutes up to `ceiling_minutes`.
pub fn session_duration_score(elapsed: Duration, ceiling_minutes: f64) -> f64 {
    if ceiling_minutes <= 0.0 {
        return 0.0;
    }
    let minutes = elapsed.num_milliseconds() as f64 / 60_000.0;
    (minutes / ceiling_minutes).clamp(0.0, 1.0)
}

/// Score a touch window across its path, pressure and multitouch aspects
pub fn touch_scores(samples: &[TouchSample]) -> TouchScores {
    let points: Vec<PathPoint> = samples.iter().map(PathPoint::from).collect();
    let timestamps: Vec<DateTime<Utc>> = samples.iter().map(|s| s.timestamp).collect();
    let path = path_score(&points, &timestamps);

    let pressures: Vec<f64> = samples.iter().filter_map(|s| s.pressure).collect();
    let pressure = (pressures.len() >= 3 && pressures.len() * 2 >= samples.len())
        .then(|| coefficient_of_variation(&pressures));

    let multi: Vec<&TouchSample> = samples.iter().filter(|s| s.touches >= 2).collect();
    let multitouch = (multi.len() >= MIN_MULTITOUCH_SAMPLES).then(|| {
        let points: Vec<PathPoint> = multi.iter().map(|s| PathPoint::from(*s)).collect();
        let timestamps: Vec<DateTime<Utc>> = multi.iter().map(|s| s.timestamp).collect();
        ((velocity_variance(&points) + timing_entropy(&timestamps)) / 2.0).clamp(0.0, 1.0)
    });

    TouchScores {
        path,
        pressure,
        multitouch,
    }
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (variance.sqrt() / mean).clamp(0.0, 1.0)
}

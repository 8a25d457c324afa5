//! Time windows over the trip history.
//!
//! [`TimeWindow`] is the full observed range that drives the range slider;
//! [`WindowBounds`] is a closed interval requested by the operator. All values
//! at this boundary are Unix-epoch milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChargingSession, Trip};

const MARK_COUNT: i64 = 5;
/// Spans longer than this get month labels instead of day labels.
const MONTH_LABEL_THRESHOLD_MS: i64 = 365 * 24 * 3_600_000 / 2;
const STEP_DIVISOR: f64 = 100.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("no trips to derive window bounds from")]
    EmptyTripSet,
    #[error("window bounds are inverted: first trip at {min} ms is after last trip at {max} ms")]
    InvertedBounds { min: i64, max: i64 },
}

/// Anything with a start timestamp that can be windowed.
pub trait Timestamped {
    fn start_millis(&self) -> i64;
}

impl Timestamped for Trip {
    fn start_millis(&self) -> i64 {
        Trip::start_millis(self)
    }
}

impl Timestamped for ChargingSession {
    fn start_millis(&self) -> i64 {
        ChargingSession::start_millis(self)
    }
}

/// Closed interval `[lo, hi]` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub lo: i64,
    pub hi: i64,
}

impl WindowBounds {
    pub fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }

    #[inline]
    pub fn contains(&self, millis: i64) -> bool {
        self.lo <= millis && millis <= self.hi
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMark {
    pub at: i64,
    pub label: String,
}

/// Slider range derived from the earliest and latest trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub min: i64,
    pub max: i64,
    pub step: f64,
    pub marks: Vec<TickMark>,
}

impl TimeWindow {
    /// Derive the window from a trip collection sorted by `start_at`.
    ///
    /// Bounds are taken from the first and last trip, so an unsorted
    /// collection whose first trip is later than its last is rejected.
    pub fn from_trips(trips: &[Trip], tz: &Tz) -> Result<Self, WindowError> {
        let (first, last) = match (trips.first(), trips.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(WindowError::EmptyTripSet),
        };
        Self::from_bounds(first.start_at, last.start_at, tz)
    }

    pub fn from_bounds(
        min_date: DateTime<Utc>,
        max_date: DateTime<Utc>,
        tz: &Tz,
    ) -> Result<Self, WindowError> {
        let min = min_date.timestamp_millis();
        let max = max_date.timestamp_millis();
        if min > max {
            return Err(WindowError::InvertedBounds { min, max });
        }

        // A single instant still needs a usable slider step.
        let step = ((max - min) as f64 / STEP_DIVISOR).max(1.0);

        Ok(Self {
            min,
            max,
            step,
            marks: marks_between(min, max, tz),
        })
    }

    pub fn full_range(&self) -> WindowBounds {
        WindowBounds::new(self.min, self.max)
    }
}

/// Evenly spaced labelled marks from `min`, plus one at `max`.
pub fn marks_between(min: i64, max: i64, tz: &Tz) -> Vec<TickMark> {
    let span = max - min;
    let format = if span > MONTH_LABEL_THRESHOLD_MS {
        "%b %Y"
    } else {
        "%Y-%m-%d"
    };

    let mut marks = Vec::with_capacity(MARK_COUNT as usize + 1);
    let delta = span / MARK_COUNT;
    if delta > 0 {
        for i in 0..MARK_COUNT {
            let at = min + i * delta;
            marks.push(TickMark {
                at,
                label: label_for(at, tz, format),
            });
        }
    }
    marks.push(TickMark {
        at: max,
        label: label_for(max, tz, format),
    });
    marks
}

fn label_for(millis: i64, tz: &Tz, format: &str) -> String {
    match tz.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.format(format).to_string(),
        None => millis.to_string(),
    }
}

/// Keep the items whose start falls in `bounds`, inclusive at both ends,
/// in their original order.
pub fn filter_by_window<T: Timestamped + Clone>(items: &[T], bounds: WindowBounds) -> Vec<T> {
    items
        .iter()
        .filter(|item| bounds.contains(item.start_millis()))
        .cloned()
        .collect()
}

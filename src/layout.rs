//! Full dashboard view and its memoization.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregate::{Summary, aggregate};
use crate::source::ControlTab;
use crate::table::{TableSnapshot, charging_table, trips_table};
use crate::types::{ChargingSession, Trip};
use crate::window::{TickMark, TimeWindow};

pub const NO_DATA_MESSAGE: &str = "No data to show, there is probably no trips recorded yet";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("no valid time window")]
    NoWindow,
    #[error("no trips to aggregate")]
    NoTrips,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliderView {
    pub min: i64,
    pub max: i64,
    pub step: f64,
    pub marks: Vec<TickMark>,
    pub value: [i64; 2],
}

impl From<&TimeWindow> for SliderView {
    fn from(window: &TimeWindow) -> Self {
        Self {
            min: window.min,
            max: window.max,
            step: window.step,
            marks: window.marks.clone(),
            value: [window.min, window.max],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub title: String,
    pub slider: SliderView,
    pub summary: Summary,
    pub consumption_text: String,
    pub trips_table: TableSnapshot,
    pub charging_table: TableSnapshot,
    pub control_tabs: Vec<ControlTab>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorView {
    pub title: String,
    pub message: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum View {
    Dashboard(DashboardView),
    Error(ErrorView),
}

impl View {
    pub fn error(title: &str, reason: impl std::fmt::Display) -> Self {
        View::Error(ErrorView {
            title: title.to_string(),
            message: NO_DATA_MESSAGE.to_string(),
            reason: reason.to_string(),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, View::Error(_))
    }
}

/// Build the full view over the whole dataset.
pub fn build_view(
    trips: &[Trip],
    sessions: &[ChargingSession],
    window: Option<&TimeWindow>,
    title: &str,
    control_tabs: Vec<ControlTab>,
) -> Result<View, LayoutError> {
    if trips.is_empty() {
        return Err(LayoutError::NoTrips);
    }
    let window = window.ok_or(LayoutError::NoWindow)?;

    let summary = aggregate(trips, sessions);
    let consumption_text = summary.consumption_text();

    Ok(View::Dashboard(DashboardView {
        title: title.to_string(),
        slider: SliderView::from(window),
        summary,
        consumption_text,
        trips_table: trips_table(trips),
        charging_table: charging_table(sessions),
        control_tabs,
    }))
}

/// Single memoized view plus its validity flag.
///
/// A failed build is cached as an error view and counts as valid, so callers
/// keep getting the same placeholder until [`LayoutCache::invalidate`].
#[derive(Debug)]
pub struct LayoutCache {
    valid: bool,
    value: Arc<View>,
    builds: u64,
}

impl Default for LayoutCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutCache {
    pub fn new() -> Self {
        Self {
            valid: false,
            value: Arc::new(View::error("", "layout not built yet")),
            builds: 0,
        }
    }

    /// Return the cached view, building it with `build` on a miss.
    pub fn get_or_build<F>(&mut self, title: &str, build: F) -> Arc<View>
    where
        F: FnOnce() -> Result<View, LayoutError>,
    {
        if self.valid {
            return self.value.clone();
        }

        self.builds += 1;
        let view = match build() {
            Ok(view) => view,
            Err(e) => {
                warn!("Layout build failed, caching error view");
                debug!(error = %e, "Layout build failure detail");
                View::error(title, e)
            }
        };
        self.value = Arc::new(view);
        self.valid = true;
        self.value.clone()
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Number of builds attempted since creation
    pub fn builds(&self) -> u64 {
        self.builds
    }
}

//! Refresh controller and the operations exposed to the presentation layer.
//!
//! `Dashboard` is the single owner of the canonical trips, charging sessions
//! and time window. Readers take an `Arc<Dataset>` snapshot, and a refresh
//! swaps in a whole new dataset, so a half-applied refresh is never visible.

use std::fmt;
use std::sync::Arc;

use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::aggregate::{Summary, aggregate};
use crate::config::Config;
use crate::diff::{ApplyReport, ChangeSet, DiffError, apply_changes, diff};
use crate::layout::{LayoutCache, View, build_view};
use crate::source::{VehicleRegistry, VehicleSource};
use crate::store::ChargingStore;
use crate::table::{CHARGING_ROW_ID, TableSnapshot, charging_table, trips_table};
use crate::types::{ChargingSession, Trip, Vehicle, VehicleId};
use crate::utils::resolve_timezone;
use crate::window::{TimeWindow, WindowBounds, filter_by_window};

/// Canonical data of one refresh generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub vin: Option<VehicleId>,
    pub trips: Vec<Trip>,
    pub sessions: Vec<ChargingSession>,
    pub window: Option<TimeWindow>,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum NoDataReason {
    NoVehicles,
    NoTrips,
    UnknownVehicle(String),
    Upstream(String),
}

impl fmt::Display for NoDataReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoDataReason::NoVehicles => f.write_str("no vehicle registered yet"),
            NoDataReason::NoTrips => f.write_str("no trips recorded yet"),
            NoDataReason::UnknownVehicle(vin) => write!(f, "vehicle {vin} is not known upstream"),
            NoDataReason::Upstream(e) => write!(f, "upstream unavailable: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshResult {
    #[serde(rename_all = "camelCase")]
    Updated {
        trips: usize,
        sessions: usize,
        window_valid: bool,
        generation: u64,
    },
    NoData(NoDataReason),
}

/// Upstream data gathered by one refresh, not yet installed.
struct Pulled {
    vehicles: Vec<Vehicle>,
    vin: VehicleId,
    trips: Vec<Trip>,
    sessions: Vec<ChargingSession>,
}

/// Transient view for one slider position. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredView {
    pub bounds: WindowBounds,
    pub window: Option<TimeWindow>,
    pub summary: Summary,
    pub consumption_text: String,
    pub trips_table: TableSnapshot,
    pub charging_table: TableSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableEdit {
    pub changes: ChangeSet,
    pub report: ApplyReport,
}

#[derive(Debug, Clone)]
pub struct DashboardSettings {
    pub title: String,
    /// Vehicle to show; `None` picks the first one listed upstream
    pub vin: Option<String>,
    pub timezone: Tz,
    pub abrp_enabled: Vec<String>,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            title: "My car info".to_string(),
            vin: None,
            timezone: Tz::UTC,
            abrp_enabled: Vec::new(),
        }
    }
}

impl From<&Config> for DashboardSettings {
    fn from(config: &Config) -> Self {
        let vin = config.dashboard.vin.trim();
        Self {
            title: config.dashboard.title.clone(),
            vin: (!vin.is_empty()).then(|| vin.to_string()),
            timezone: resolve_timezone(&config.dashboard.timezone),
            abrp_enabled: config.abrp.enabled_vins.clone(),
        }
    }
}

pub struct Dashboard {
    source: Arc<dyn VehicleSource>,
    store: Arc<dyn ChargingStore>,
    settings: DashboardSettings,
    dataset: RwLock<Arc<Dataset>>,
    // Lock order: layout, then dataset, then the vehicle registry.
    layout: Mutex<LayoutCache>,
    vehicles: VehicleRegistry,
    refresh_gate: tokio::sync::Mutex<()>,
    updates: watch::Sender<Option<RefreshResult>>,
}

impl Dashboard {
    pub fn new(
        source: Arc<dyn VehicleSource>,
        store: Arc<dyn ChargingStore>,
        settings: DashboardSettings,
    ) -> Self {
        let (updates, _) = watch::channel(None);
        Self {
            source,
            store,
            settings,
            dataset: RwLock::new(Arc::new(Dataset::default())),
            layout: Mutex::new(LayoutCache::new()),
            vehicles: VehicleRegistry::new(),
            refresh_gate: tokio::sync::Mutex::new(()),
            updates,
        }
    }

    pub fn settings(&self) -> &DashboardSettings {
        &self.settings
    }

    /// Current canonical data
    pub fn dataset(&self) -> Arc<Dataset> {
        self.dataset.read().clone()
    }

    pub fn vehicles(&self) -> &VehicleRegistry {
        &self.vehicles
    }

    /// Receive every refresh result as it is published.
    pub fn subscribe(&self) -> watch::Receiver<Option<RefreshResult>> {
        self.updates.subscribe()
    }

    /// Pull fresh data and swap it in.
    ///
    /// Startup and push notifications both go through here. When upstream has
    /// nothing to offer the previous dataset and layout are left untouched.
    pub async fn refresh(&self) -> RefreshResult {
        let _gate = self.refresh_gate.lock().await;

        let result = match self.pull().await {
            Ok(pulled) => self.install(pulled),
            Err(reason) => {
                match &reason {
                    NoDataReason::Upstream(e) => error!("Refresh failed: {e}"),
                    other => info!("No data yet: {other}"),
                }
                RefreshResult::NoData(reason)
            }
        };

        self.updates.send_replace(Some(result.clone()));
        result
    }

    async fn pull(&self) -> Result<Pulled, NoDataReason> {
        let vehicles = self
            .source
            .list_vehicles()
            .await
            .map_err(|e| NoDataReason::Upstream(format!("{e:#}")))?;
        let vin = self.select_vehicle(&vehicles)?;
        let mut trips_by_vin = self
            .source
            .get_trips(std::slice::from_ref(&vin))
            .await
            .map_err(|e| NoDataReason::Upstream(format!("{e:#}")))?;
        let trips = trips_by_vin.remove(&vin).unwrap_or_default();
        if trips.is_empty() {
            return Err(NoDataReason::NoTrips);
        }

        let sessions = self
            .source
            .get_charging_sessions(None)
            .await
            .map_err(|e| NoDataReason::Upstream(format!("{e:#}")))?
            .into_iter()
            .filter(|session| session.vin == vin)
            .collect();

        Ok(Pulled {
            vehicles,
            vin,
            trips,
            sessions,
        })
    }

    fn select_vehicle(&self, vehicles: &[Vehicle]) -> Result<VehicleId, NoDataReason> {
        match &self.settings.vin {
            Some(wanted) => vehicles
                .iter()
                .find(|v| v.vin.as_str() == wanted)
                .map(|v| v.vin.clone())
                .ok_or_else(|| NoDataReason::UnknownVehicle(wanted.clone())),
            None => vehicles
                .first()
                .map(|v| v.vin.clone())
                .ok_or(NoDataReason::NoVehicles),
        }
    }

    fn install(&self, pulled: Pulled) -> RefreshResult {
        let Pulled {
            vehicles,
            vin,
            trips,
            sessions,
        } = pulled;
        let window = match TimeWindow::from_trips(&trips, &self.settings.timezone) {
            Ok(window) => Some(window),
            Err(e) => {
                error!(%vin, "Cannot compute time window: {e}");
                None
            }
        };

        let mut layout = self.layout.lock();
        let mut dataset = self.dataset.write();
        let generation = dataset.generation + 1;
        let next = Dataset {
            vin: Some(vin),
            trips,
            sessions,
            window,
            generation,
        };
        let result = RefreshResult::Updated {
            trips: next.trips.len(),
            sessions: next.sessions.len(),
            window_valid: next.window.is_some(),
            generation,
        };
        *dataset = Arc::new(next);
        self.vehicles.replace(&vehicles, &self.settings.abrp_enabled);
        layout.invalidate();
        drop(dataset);
        drop(layout);

        info!(?result, vehicles = self.vehicles.len(), "Dashboard data refreshed");
        result
    }

    /// Trips and sessions inside `bounds`, aggregated. Does not touch the
    /// layout cache.
    pub fn filter_by_window(&self, bounds: WindowBounds) -> FilteredView {
        let data = self.dataset();
        let trips = filter_by_window(&data.trips, bounds);
        let sessions = filter_by_window(&data.sessions, bounds);
        let summary = aggregate(&trips, &sessions);

        FilteredView {
            bounds,
            window: data.window.clone(),
            consumption_text: summary.consumption_text(),
            summary,
            trips_table: trips_table(&trips),
            charging_table: charging_table(&sessions),
        }
    }

    /// Cached full view, rebuilt only after a refresh invalidated it.
    pub fn get_layout(&self) -> Arc<View> {
        let mut cache = self.layout.lock();
        if !cache.is_valid() {
            debug!(previous_builds = cache.builds(), "Building new layout");
        }
        cache.get_or_build(&self.settings.title, || {
            let data = self.dataset.read().clone();
            build_view(
                &data.trips,
                &data.sessions,
                data.window.as_ref(),
                &self.settings.title,
                self.vehicles.control_tabs(),
            )
        })
    }

    /// Diff two snapshots of the charging table and persist the price edits.
    pub fn apply_table_edit(
        &self,
        previous: &TableSnapshot,
        current: &TableSnapshot,
    ) -> Result<TableEdit, DiffError> {
        let changes = diff(previous, current, CHARGING_ROW_ID)?;
        let report = apply_changes(&changes, self.store.as_ref());
        debug!(changes = changes.len(), ?report, "Applied table edit");
        Ok(TableEdit { changes, report })
    }

    /// Flip the ABRP switch of one vehicle.
    pub fn set_abrp(&self, vin: &str, enabled: bool) -> anyhow::Result<Vec<String>> {
        self.vehicles.set_abrp(vin, enabled)?;
        let label = self
            .vehicles
            .get(vin)
            .map(|handler| handler.vehicle.display_label().to_string())
            .unwrap_or_default();
        info!(vin, label = %label, enabled, "ABRP switch changed");
        Ok(self.vehicles.abrp_enabled_vins())
    }
}

/// Route store notifications into refreshes.
///
/// The store callback only enqueues; a background task drains the queue and
/// calls [`Dashboard::refresh`]. Notifications that arrive while a refresh is
/// pending are coalesced into it.
pub fn spawn_push_refresh(dashboard: Arc<Dashboard>) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    dashboard
        .store
        .register_refresh_callback(Arc::new(move || {
            let _ = tx.send(());
        }));

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            while rx.try_recv().is_ok() {}
            let result = dashboard.refresh().await;
            debug!(?result, "Push refresh finished");
        }
    })
}

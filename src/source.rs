use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{ChargingSession, Trip, Vehicle, VehicleId};
use crate::window::WindowBounds;

/// Upstream provider of vehicles, trips and charging sessions.
#[async_trait]
pub trait VehicleSource: Send + Sync {
    /// Vehicles known to the account, in upstream order
    async fn list_vehicles(&self) -> Result<Vec<Vehicle>>;

    /// Trips per vehicle, each list ordered by `start_at`
    async fn get_trips(&self, vins: &[VehicleId]) -> Result<BTreeMap<VehicleId, Vec<Trip>>>;

    /// Charging sessions, optionally restricted to a window
    async fn get_charging_sessions(
        &self,
        window: Option<WindowBounds>,
    ) -> Result<Vec<ChargingSession>>;
}

/// Per-vehicle control handler, looked up by VIN.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleHandler {
    pub vehicle: Vehicle,
    pub abrp_enabled: bool,
}

/// One control tab of the layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlTab {
    pub vin: VehicleId,
    pub label: String,
    pub abrp_enabled: bool,
}

/// Registry mapping VIN to its control handler, replaced on each refresh
/// that installs data.
///
/// [`VehicleRegistry::replace`] holds the lock exclusively: toggles and
/// readers see either the old map or the new one.
#[derive(Default)]
pub struct VehicleRegistry {
    handlers: RwLock<DashMap<VehicleId, VehicleHandler>>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(DashMap::new()),
        }
    }

    /// Replace the registered vehicles. A VIN already registered keeps its
    /// toggle state; new VINs take theirs from `abrp_enabled`.
    pub fn replace(&self, vehicles: &[Vehicle], abrp_enabled: &[String]) {
        let mut handlers = self.handlers.write();
        let next: DashMap<VehicleId, VehicleHandler> = vehicles
            .iter()
            .map(|vehicle| {
                let enabled = handlers
                    .get(&vehicle.vin)
                    .map(|previous| previous.abrp_enabled)
                    .unwrap_or_else(|| abrp_enabled.iter().any(|v| v == vehicle.vin.as_str()));
                (
                    vehicle.vin.clone(),
                    VehicleHandler {
                        vehicle: vehicle.clone(),
                        abrp_enabled: enabled,
                    },
                )
            })
            .collect();
        *handlers = next;
    }

    pub fn get(&self, vin: &str) -> Option<VehicleHandler> {
        self.handlers.read().get(vin).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Toggle the ABRP switch of one vehicle.
    pub fn set_abrp(&self, vin: &str, enabled: bool) -> Result<()> {
        let handlers = self.handlers.read();
        let Some(mut handler) = handlers.get_mut(vin) else {
            anyhow::bail!("Unknown vehicle {vin}");
        };
        handler.abrp_enabled = enabled;
        Ok(())
    }

    /// VINs whose ABRP switch is on, sorted
    pub fn abrp_enabled_vins(&self) -> Vec<String> {
        let mut vins: Vec<String> = self
            .handlers
            .read()
            .iter()
            .filter(|entry| entry.abrp_enabled)
            .map(|entry| entry.key().to_string())
            .collect();
        vins.sort();
        vins
    }

    /// Control tabs sorted by VIN
    pub fn control_tabs(&self) -> Vec<ControlTab> {
        let mut tabs: Vec<ControlTab> = self
            .handlers
            .read()
            .iter()
            .map(|entry| ControlTab {
                vin: entry.key().clone(),
                label: entry.vehicle.display_label().to_string(),
                abrp_enabled: entry.abrp_enabled,
            })
            .collect();
        tabs.sort_by(|a, b| a.vin.cmp(&b.vin));
        tabs
    }
}

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Vehicle identification number, used as the key for everything per-vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new(vin: impl Into<String>) -> Self {
        Self(vin.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for VehicleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VehicleId {
    fn from(vin: &str) -> Self {
        Self::new(vin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub vin: VehicleId,
    pub label: Option<String>,
}

impl Vehicle {
    /// Label shown to the operator, falling back to the VIN.
    pub fn display_label(&self) -> &str {
        match self.label.as_deref() {
            Some(label) if !label.trim().is_empty() => label,
            _ => self.vin.as_str(),
        }
    }
}

/// One recorded journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub vin: VehicleId,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub distance_km: f64,
    /// Energy drawn from the battery during the trip
    pub consumption_kwh: f64,
    pub mean_temp_c: Option<f64>,
}

impl Trip {
    pub fn start_millis(&self) -> i64 {
        self.start_at.timestamp_millis()
    }

    pub fn duration_hours(&self) -> f64 {
        (self.end_at - self.start_at).num_milliseconds() as f64 / 3_600_000.0
    }

    /// kWh per 100 km. `None` when the trip has no usable distance.
    pub fn consumption_per_100km(&self) -> Option<f64> {
        if !self.distance_km.is_finite() || self.distance_km <= 0.0 {
            return None;
        }
        let value = self.consumption_kwh / self.distance_km * 100.0;
        value.is_finite().then_some(value)
    }

    /// Average speed in km/h. `None` for zero-length or inverted trips.
    pub fn speed_average(&self) -> Option<f64> {
        let hours = self.duration_hours();
        if hours <= 0.0 || !self.distance_km.is_finite() {
            return None;
        }
        Some(self.distance_km / hours)
    }
}

/// One recorded charge. `start_at` identifies the session in the store and in
/// the editable charging table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSession {
    pub vin: VehicleId,
    pub start_at: DateTime<Utc>,
    pub stop_at: Option<DateTime<Utc>>,
    pub start_level: Option<f64>,
    pub end_level: Option<f64>,
    /// Energy delivered, in kWh
    pub energy_kwh: Option<f64>,
    /// Operator-editable total price of the session
    pub price: Option<f64>,
}

impl ChargingSession {
    pub fn start_millis(&self) -> i64 {
        self.start_at.timestamp_millis()
    }

    pub fn price_per_kwh(&self) -> Option<f64> {
        match (self.price, self.energy_kwh) {
            (Some(price), Some(energy)) if energy > 0.0 => Some(price / energy),
            _ => None,
        }
    }
}

//! Editable-table snapshots and the projections that feed them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ChargingSession, Trip};

/// Row identifier of the charging table: the session start time.
pub const CHARGING_ROW_ID: &str = "start_at";

pub const CHARGING_COLUMNS: &[&str] = &[
    "start_at",
    "stop_at",
    "start_level",
    "end_level",
    "energy_kwh",
    "price",
    "price_per_kwh",
];

pub const TRIP_COLUMNS: &[&str] = &[
    "start_at",
    "end_at",
    "distance_km",
    "consumption_kwh",
    "consumption_per_100km",
    "speed_average",
    "mean_temp_c",
];

/// A single table cell. JSON `null` and a missing key both mean "no value".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            CellValue::Text(s) => s.trim().parse().ok(),
            CellValue::Bool(_) => None,
        }
    }

    /// NaN is how some table widgets spell an empty numeric cell.
    pub fn is_no_value(&self) -> bool {
        matches!(self, CellValue::Float(v) if v.is_nan())
    }

    /// Equality with numeric widening, so `10` and `10.0` are the same cell.
    pub fn same_as(&self, other: &CellValue) -> bool {
        match (self, other) {
            (CellValue::Int(a), CellValue::Float(b)) | (CellValue::Float(b), CellValue::Int(a)) => {
                *a as f64 == *b
            }
            _ => self == other,
        }
    }

    /// Hashable form used to index rows by identifier.
    pub fn row_key(&self) -> RowKey {
        match self {
            CellValue::Bool(v) => RowKey::Bool(*v),
            CellValue::Int(v) => RowKey::Int(*v),
            CellValue::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                RowKey::Int(*v as i64)
            }
            CellValue::Float(v) => RowKey::Float(v.to_bits()),
            CellValue::Text(s) => RowKey::Text(s.clone()),
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Text(String),
}

pub type TableRow = BTreeMap<String, Option<CellValue>>;

/// Look up a cell, folding missing keys, `null` and NaN into `None`.
pub fn cell<'a>(row: &'a TableRow, column: &str) -> Option<&'a CellValue> {
    row.get(column)
        .and_then(Option::as_ref)
        .filter(|value| !value.is_no_value())
}

/// Full state of an editable table at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
}

impl TableSnapshot {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn push_row<I, K>(&mut self, cells: I)
    where
        I: IntoIterator<Item = (K, Option<CellValue>)>,
        K: Into<String>,
    {
        self.rows
            .push(cells.into_iter().map(|(k, v)| (k.into(), v)).collect());
    }
}

fn float(value: Option<f64>) -> Option<CellValue> {
    value.filter(|v| v.is_finite()).map(CellValue::Float)
}

/// Editable charging table. Timestamps are epoch milliseconds.
pub fn charging_table(sessions: &[ChargingSession]) -> TableSnapshot {
    let mut table = TableSnapshot::new(CHARGING_COLUMNS);
    for session in sessions {
        table.push_row([
            ("start_at", Some(CellValue::Int(session.start_millis()))),
            (
                "stop_at",
                session.stop_at.map(|t| CellValue::Int(t.timestamp_millis())),
            ),
            ("start_level", float(session.start_level)),
            ("end_level", float(session.end_level)),
            ("energy_kwh", float(session.energy_kwh)),
            ("price", float(session.price)),
            ("price_per_kwh", float(session.price_per_kwh())),
        ]);
    }
    table
}

pub fn trips_table(trips: &[Trip]) -> TableSnapshot {
    let mut table = TableSnapshot::new(TRIP_COLUMNS);
    for trip in trips {
        table.push_row([
            ("start_at", Some(CellValue::Int(trip.start_millis()))),
            ("end_at", Some(CellValue::Int(trip.end_at.timestamp_millis()))),
            ("distance_km", float(Some(trip.distance_km))),
            ("consumption_kwh", float(Some(trip.consumption_kwh))),
            ("consumption_per_100km", float(trip.consumption_per_100km())),
            ("speed_average", float(trip.speed_average())),
            ("mean_temp_c", float(trip.mean_temp_c)),
        ]);
    }
    table
}

//! SQLite-backed vehicle source and charging store.
//!
//! Timestamps are stored as RFC 3339 text with millisecond precision in UTC,
//! so lexical order matches chronological order and a charging session's
//! `start_at` can be matched exactly when an operator edits its price.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::source::VehicleSource;
use crate::store::{ChargingStore, RefreshCallback, RefreshCallbacks};
use crate::types::{ChargingSession, Trip, Vehicle, VehicleId};
use crate::utils::{parse_timestamp, warn_once};
use crate::window::{WindowBounds, filter_by_window};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vehicles (
    vin   TEXT PRIMARY KEY,
    label TEXT
);
CREATE TABLE IF NOT EXISTS trips (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    vin             TEXT NOT NULL,
    start_at        TEXT NOT NULL,
    end_at          TEXT NOT NULL,
    distance_km     REAL NOT NULL,
    consumption_kwh REAL NOT NULL,
    mean_temp       REAL
);
CREATE INDEX IF NOT EXISTS trips_vin_start ON trips (vin, start_at);
CREATE TABLE IF NOT EXISTS battery (
    start_at    TEXT PRIMARY KEY,
    stop_at     TEXT,
    vin         TEXT NOT NULL,
    start_level REAL,
    end_level   REAL,
    kw          REAL,
    price       REAL
);
";

/// Format a timestamp the way it is stored.
pub fn db_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Default location of the dashboard database.
pub fn default_db_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("Could not determine data directory")?;
    Ok(data_dir.join("tripboard").join("info.db"))
}

pub struct Database {
    path: PathBuf,
    conn: Mutex<Connection>,
    callbacks: RefreshCallbacks,
}

impl Database {
    /// Open (and create if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        // The collector may be writing at the same time
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            callbacks: RefreshCallbacks::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tell every registered listener that new data is available.
    pub fn notify_new_data(&self) -> usize {
        self.callbacks.notify_all()
    }

    /// Price the sessions that have none at `price_per_kwh` × delivered energy.
    pub fn set_default_price(&self, price_per_kwh: f64) -> Result<usize> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE battery SET price = round(kw * ?1, 2)
                 WHERE price IS NULL AND kw IS NOT NULL",
                params![price_per_kwh],
            )
            .context("Failed to set default charging price")?;
        debug!(updated, price_per_kwh, "Applied default charging price");
        Ok(updated)
    }

    fn query_vehicles(&self) -> Result<Vec<Vehicle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT vin, label FROM vehicles ORDER BY rowid")?;
        let vehicles = stmt
            .query_map([], |row| {
                Ok(Vehicle {
                    vin: VehicleId::new(row.get::<_, String>(0)?),
                    label: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(vehicles)
    }

    fn query_trips(&self, vin: &VehicleId) -> Result<Vec<Trip>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT start_at, end_at, distance_km, consumption_kwh, mean_temp
             FROM trips WHERE vin = ?1 ORDER BY start_at, id",
        )?;
        let rows = stmt
            .query_map(params![vin.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut trips = Vec::with_capacity(rows.len());
        for (start_at, end_at, distance_km, consumption_kwh, mean_temp_c) in rows {
            let (Some(start_at), Some(end_at)) = (parse_timestamp(&start_at), parse_timestamp(&end_at))
            else {
                warn_once(format!("Skipping trip of {vin} with unreadable timestamps: {start_at}"));
                continue;
            };
            trips.push(Trip {
                vin: vin.clone(),
                start_at,
                end_at,
                distance_km,
                consumption_kwh,
                mean_temp_c,
            });
        }
        // Text order differs from time order across timestamp formats
        trips.sort_by_key(|trip| trip.start_at);
        Ok(trips)
    }

    fn query_charging_sessions(&self) -> Result<Vec<ChargingSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT start_at, stop_at, vin, start_level, end_level, kw, price
             FROM battery ORDER BY start_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut sessions = Vec::with_capacity(rows.len());
        for (start_at, stop_at, vin, start_level, end_level, energy_kwh, price) in rows {
            let Some(parsed_start) = parse_timestamp(&start_at) else {
                warn_once(format!("Skipping charging session with unreadable start: {start_at}"));
                continue;
            };
            sessions.push(ChargingSession {
                vin: VehicleId::new(vin),
                start_at: parsed_start,
                stop_at: stop_at.as_deref().and_then(parse_timestamp),
                start_level,
                end_level,
                energy_kwh,
                price,
            });
        }
        sessions.sort_by_key(|session| session.start_at);
        Ok(sessions)
    }

    /// Find how a session start is spelled in the table. Rows written by
    /// other tools may use a different textual format for the same instant.
    fn stored_start_key(&self, conn: &Connection, start_at: &DateTime<Utc>) -> Result<Option<String>> {
        let canonical = db_timestamp(start_at);
        let exact: Option<String> = conn
            .query_row(
                "SELECT start_at FROM battery WHERE start_at = ?1",
                params![canonical],
                |row| row.get(0),
            )
            .optional()?;
        if exact.is_some() {
            return Ok(exact);
        }

        let mut stmt = conn.prepare("SELECT start_at FROM battery")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys
            .into_iter()
            .find(|key| parse_timestamp(key).as_ref() == Some(start_at)))
    }
}

#[async_trait]
impl VehicleSource for Database {
    async fn list_vehicles(&self) -> Result<Vec<Vehicle>> {
        self.query_vehicles().context("Failed to list vehicles")
    }

    async fn get_trips(&self, vins: &[VehicleId]) -> Result<BTreeMap<VehicleId, Vec<Trip>>> {
        let mut trips_by_vin = BTreeMap::new();
        for vin in vins {
            let trips = self
                .query_trips(vin)
                .with_context(|| format!("Failed to read trips of {vin}"))?;
            if !trips.is_empty() {
                trips_by_vin.insert(vin.clone(), trips);
            }
        }
        Ok(trips_by_vin)
    }

    async fn get_charging_sessions(
        &self,
        window: Option<WindowBounds>,
    ) -> Result<Vec<ChargingSession>> {
        let sessions = self
            .query_charging_sessions()
            .context("Failed to read charging sessions")?;
        Ok(match window {
            Some(bounds) => filter_by_window(&sessions, bounds),
            None => sessions,
        })
    }
}

impl ChargingStore for Database {
    fn update_price_by_start_time(
        &self,
        start_at: DateTime<Utc>,
        price: Option<f64>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let Some(key) = self.stored_start_key(&conn, &start_at)? else {
            return Ok(false);
        };
        let updated = conn
            .execute(
                "UPDATE battery SET price = ?1 WHERE start_at = ?2",
                params![price, key],
            )
            .context("Failed to update charging price")?;
        Ok(updated > 0)
    }

    fn register_refresh_callback(&self, callback: RefreshCallback) {
        self.callbacks.register(callback);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, day, hour, 0, 0).unwrap()
    }

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("nested").join("info.db")).expect("open");
        (dir, db)
    }

    fn insert_vehicle(db: &Database, vin: &str, label: Option<&str>) {
        db.conn
            .lock()
            .execute(
                "INSERT INTO vehicles (vin, label) VALUES (?1, ?2)",
                params![vin, label],
            )
            .expect("insert vehicle");
    }

    fn insert_trip(db: &Database, vin: &str, start: &str, distance_km: f64, kwh: f64) {
        db.conn
            .lock()
            .execute(
                "INSERT INTO trips (vin, start_at, end_at, distance_km, consumption_kwh, mean_temp)
                 VALUES (?1, ?2, ?2, ?3, ?4, NULL)",
                params![vin, start, distance_km, kwh],
            )
            .expect("insert trip");
    }

    fn insert_charge(db: &Database, vin: &str, start: &str, kw: Option<f64>, price: Option<f64>) {
        db.conn
            .lock()
            .execute(
                "INSERT INTO battery (start_at, stop_at, vin, start_level, end_level, kw, price)
                 VALUES (?1, NULL, ?2, 20, 80, ?3, ?4)",
                params![start, vin, kw, price],
            )
            .expect("insert charge");
    }

    fn price_of(db: &Database, start: &str) -> Option<f64> {
        db.conn
            .lock()
            .query_row(
                "SELECT price FROM battery WHERE start_at = ?1",
                params![start],
                |row| row.get(0),
            )
            .expect("select price")
    }

    #[tokio::test]
    async fn lists_vehicles_in_insertion_order() {
        let (_dir, db) = open_temp();
        insert_vehicle(&db, "VIN2", Some("Second"));
        insert_vehicle(&db, "VIN1", None);

        let vehicles = db.list_vehicles().await.expect("vehicles");
        let vins: Vec<&str> = vehicles.iter().map(|v| v.vin.as_str()).collect();
        assert_eq!(vins, vec!["VIN2", "VIN1"]);
        assert_eq!(vehicles[0].label.as_deref(), Some("Second"));
    }

    #[tokio::test]
    async fn trips_are_grouped_and_sorted() {
        let (_dir, db) = open_temp();
        insert_trip(&db, "VIN1", &db_timestamp(&at(2, 8)), 10.0, 1.5);
        insert_trip(&db, "VIN1", &db_timestamp(&at(1, 8)), 20.0, 3.0);
        insert_trip(&db, "VIN2", &db_timestamp(&at(1, 9)), 5.0, 0.8);

        let trips = db
            .get_trips(&[VehicleId::new("VIN1"), VehicleId::new("VIN3")])
            .await
            .expect("trips");
        assert_eq!(trips.len(), 1);
        let vin1 = &trips[&VehicleId::new("VIN1")];
        assert_eq!(vin1.len(), 2);
        assert_eq!(vin1[0].start_at, at(1, 8));
        assert_eq!(vin1[1].start_at, at(2, 8));
    }

    #[tokio::test]
    async fn trips_in_mixed_timestamp_formats_sort_by_time() {
        let (_dir, db) = open_temp();
        insert_trip(&db, "VIN1", &db_timestamp(&at(1, 8)), 10.0, 1.5);
        insert_trip(&db, "VIN1", "2025-04-01 20:00:00", 20.0, 3.0);
        insert_trip(&db, "VIN1", &at(1, 12).timestamp_millis().to_string(), 5.0, 0.8);

        let trips = db.get_trips(&[VehicleId::new("VIN1")]).await.expect("trips");
        let starts: Vec<DateTime<Utc>> = trips[&VehicleId::new("VIN1")]
            .iter()
            .map(|trip| trip.start_at)
            .collect();
        assert_eq!(starts, vec![at(1, 8), at(1, 12), at(1, 20)]);

        let window = crate::window::TimeWindow::from_trips(
            &trips[&VehicleId::new("VIN1")],
            &chrono_tz::UTC,
        );
        assert!(window.is_ok());
    }

    #[tokio::test]
    async fn charging_sessions_in_mixed_timestamp_formats_sort_by_time() {
        let (_dir, db) = open_temp();
        insert_charge(&db, "VIN1", "2025-04-03 07:00:00", Some(10.0), None);
        insert_charge(&db, "VIN1", &db_timestamp(&at(2, 20)), Some(20.0), None);

        let sessions = db.get_charging_sessions(None).await.expect("sessions");
        let starts: Vec<DateTime<Utc>> = sessions.iter().map(|s| s.start_at).collect();
        assert_eq!(starts, vec![at(2, 20), at(3, 7)]);
    }

    #[tokio::test]
    async fn unreadable_trip_rows_are_skipped() {
        let (_dir, db) = open_temp();
        insert_trip(&db, "VIN1", "not a date", 10.0, 1.5);
        insert_trip(&db, "VIN1", &db_timestamp(&at(1, 8)), 20.0, 3.0);

        let trips = db.get_trips(&[VehicleId::new("VIN1")]).await.expect("trips");
        assert_eq!(trips[&VehicleId::new("VIN1")].len(), 1);
    }

    #[tokio::test]
    async fn charging_sessions_respect_window() {
        let (_dir, db) = open_temp();
        insert_charge(&db, "VIN1", &db_timestamp(&at(1, 20)), Some(20.0), None);
        insert_charge(&db, "VIN1", &db_timestamp(&at(3, 20)), Some(30.0), Some(4.5));

        let all = db.get_charging_sessions(None).await.expect("sessions");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].price, Some(4.5));

        let bounds = WindowBounds::new(at(1, 20).timestamp_millis(), at(2, 0).timestamp_millis());
        let windowed = db.get_charging_sessions(Some(bounds)).await.expect("sessions");
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].start_at, at(1, 20));
    }

    #[test]
    fn update_price_matches_start_time() {
        let (_dir, db) = open_temp();
        let start = db_timestamp(&at(1, 20));
        insert_charge(&db, "VIN1", &start, Some(20.0), Some(3.0));

        assert!(db.update_price_by_start_time(at(1, 20), Some(4.2)).expect("update"));
        assert_eq!(price_of(&db, &start), Some(4.2));

        assert!(db.update_price_by_start_time(at(1, 20), None).expect("clear"));
        assert_eq!(price_of(&db, &start), None);
    }

    #[test]
    fn update_price_of_unknown_session_reports_not_found() {
        let (_dir, db) = open_temp();
        insert_charge(&db, "VIN1", &db_timestamp(&at(1, 20)), Some(20.0), None);
        assert!(!db.update_price_by_start_time(at(1, 21), Some(1.0)).expect("update"));
    }

    #[test]
    fn update_price_matches_foreign_timestamp_format() {
        let (_dir, db) = open_temp();
        let foreign = "2025-04-01 20:00:00";
        insert_charge(&db, "VIN1", foreign, Some(20.0), None);

        assert!(db.update_price_by_start_time(at(1, 20), Some(5.0)).expect("update"));
        assert_eq!(price_of(&db, foreign), Some(5.0));
    }

    #[test]
    fn default_price_fills_only_unpriced_sessions() {
        let (_dir, db) = open_temp();
        let unpriced = db_timestamp(&at(1, 20));
        let priced = db_timestamp(&at(2, 20));
        let no_energy = db_timestamp(&at(3, 20));
        insert_charge(&db, "VIN1", &unpriced, Some(20.0), None);
        insert_charge(&db, "VIN1", &priced, Some(20.0), Some(9.99));
        insert_charge(&db, "VIN1", &no_energy, None, None);

        assert_eq!(db.set_default_price(0.15).expect("default price"), 1);
        assert_eq!(price_of(&db, &unpriced), Some(3.0));
        assert_eq!(price_of(&db, &priced), Some(9.99));
        assert_eq!(price_of(&db, &no_energy), None);
    }

    #[test]
    fn notify_new_data_fires_registered_callbacks() {
        let (_dir, db) = open_temp();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        db.register_refresh_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(db.notify_new_data(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("info.db");
        {
            let db = Database::open(&path).expect("open");
            insert_vehicle(&db, "VIN1", None);
        }
        let db = Database::open(&path).expect("reopen");
        assert_eq!(db.query_vehicles().expect("vehicles").len(), 1);
        assert_eq!(db.path(), path.as_path());
    }
}

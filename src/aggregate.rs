//! Summary metrics and chart-ready series for a set of trips and charges.
//!
//! Everything here is a pure function of its inputs. Memoization belongs to
//! the layout cache, not to this module.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{ChargingSession, Trip};
use crate::utils::serialize_finite;

const SPEED_BUCKET_KMH: f64 = 10.0;
const TEMPERATURE_BUCKET_C: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub at: i64,
    pub value: f64,
}

/// Mean consumption over the half-open range `[from, to)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub from: f64,
    pub to: f64,
    pub mean_consumption: f64,
    pub trips: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisBounds {
    pub first_start: i64,
    pub last_start: i64,
    pub min_consumption: Option<f64>,
    pub max_consumption: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingTotals {
    pub sessions: usize,
    pub energy_kwh: f64,
    pub cost: f64,
    /// Sessions without a price are excluded from `cost` and counted here.
    pub unpriced_sessions: usize,
    pub mean_price_per_kwh: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub trip_count: usize,
    pub total_distance_km: f64,
    pub total_consumption_kwh: f64,
    /// kWh/100km averaged over trips; NaN when no trip has a usable distance.
    #[serde(serialize_with = "serialize_finite")]
    pub mean_consumption: f64,
    pub axis: Option<AxisBounds>,
    pub consumption_over_time: Vec<SeriesPoint>,
    pub consumption_by_speed: Vec<Bucket>,
    pub consumption_by_temperature: Vec<Bucket>,
    pub charging: ChargingTotals,
}

impl Summary {
    pub fn has_consumption(&self) -> bool {
        self.mean_consumption.is_finite()
    }

    pub fn consumption_text(&self) -> String {
        if self.has_consumption() {
            format!("Average consumption: {:.1} kWh/100km", self.mean_consumption)
        } else {
            "Average consumption: no data".to_string()
        }
    }
}

pub fn aggregate(trips: &[Trip], sessions: &[ChargingSession]) -> Summary {
    let consumption_over_time: Vec<SeriesPoint> = trips
        .iter()
        .filter_map(|trip| {
            trip.consumption_per_100km().map(|value| SeriesPoint {
                at: trip.start_millis(),
                value,
            })
        })
        .collect();

    let mean_consumption = mean(consumption_over_time.iter().map(|p| p.value));

    Summary {
        trip_count: trips.len(),
        total_distance_km: trips.iter().map(|t| t.distance_km).sum(),
        total_consumption_kwh: trips.iter().map(|t| t.consumption_kwh).sum(),
        mean_consumption,
        axis: axis_bounds(trips, &consumption_over_time),
        consumption_by_speed: bucketize(trips, SPEED_BUCKET_KMH, Trip::speed_average),
        consumption_by_temperature: bucketize(trips, TEMPERATURE_BUCKET_C, |t| t.mean_temp_c),
        consumption_over_time,
        charging: charging_totals(sessions),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

fn axis_bounds(trips: &[Trip], consumption: &[SeriesPoint]) -> Option<AxisBounds> {
    let first_start = trips.iter().map(Trip::start_millis).min()?;
    let last_start = trips.iter().map(Trip::start_millis).max()?;

    let min_consumption = consumption.iter().map(|p| p.value).reduce(f64::min);
    let max_consumption = consumption.iter().map(|p| p.value).reduce(f64::max);

    Some(AxisBounds {
        first_start,
        last_start,
        min_consumption,
        max_consumption,
    })
}

/// Group trips by `key` into fixed-width buckets and average their consumption.
fn bucketize(trips: &[Trip], width: f64, key: impl Fn(&Trip) -> Option<f64>) -> Vec<Bucket> {
    let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();

    for trip in trips {
        let (Some(k), Some(consumption)) = (key(trip), trip.consumption_per_100km()) else {
            continue;
        };
        if !k.is_finite() {
            continue;
        }
        let slot = buckets.entry((k / width).floor() as i64).or_insert((0.0, 0));
        slot.0 += consumption;
        slot.1 += 1;
    }

    buckets
        .into_iter()
        .map(|(index, (sum, count))| Bucket {
            from: index as f64 * width,
            to: index.saturating_add(1) as f64 * width,
            mean_consumption: sum / count as f64,
            trips: count,
        })
        .collect()
}

fn charging_totals(sessions: &[ChargingSession]) -> ChargingTotals {
    let mut totals = ChargingTotals {
        sessions: sessions.len(),
        ..ChargingTotals::default()
    };
    let mut priced_energy = 0.0;

    for session in sessions {
        let energy = session.energy_kwh.unwrap_or(0.0);
        totals.energy_kwh += energy;
        match session.price {
            Some(price) => {
                totals.cost += price;
                priced_energy += energy;
            }
            None => totals.unpriced_sessions += 1,
        }
    }

    if priced_energy > 0.0 {
        totals.mean_price_per_kwh = Some(totals.cost / priced_energy);
    }
    totals
}

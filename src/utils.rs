use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use num_format::{Locale, ToFormattedString};
use serde::Serializer;

static WARNED_MESSAGES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// Log a warning only the first time a given message is seen.
pub fn warn_once(message: impl Into<String>) {
    let message = message.into();
    let cache = WARNED_MESSAGES.get_or_init(|| Mutex::new(HashSet::new()));

    if let Ok(mut warned) = cache.lock()
        && warned.insert(message.clone())
    {
        tracing::warn!("{message}");
    }
}

/// Format a count with thousands separators.
pub fn format_number(n: impl Into<u64>) -> String {
    n.into().to_formatted_string(&Locale::en)
}

/// Resolve the zone used for human-readable labels. An empty or unknown name
/// falls back to the system zone, then UTC.
pub fn resolve_timezone(name: &str) -> Tz {
    let name = name.trim();
    if !name.is_empty() {
        match name.parse::<Tz>() {
            Ok(tz) => return tz,
            Err(_) => warn_once(format!("Unknown timezone {name:?}, using system zone")),
        }
    }

    iana_time_zone::get_timezone()
        .ok()
        .and_then(|system| system.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC)
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// Parse a timestamp given either as Unix-epoch milliseconds or as RFC 3339.
/// Naive `YYYY-MM-DD HH:MM:SS` values are read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(millis) = value.parse::<i64>() {
        return from_millis(millis);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// CLI flavour of [`parse_timestamp`] with an error message.
pub fn parse_time_arg(value: &str) -> Result<i64> {
    parse_timestamp(value)
        .map(|dt| dt.timestamp_millis())
        .with_context(|| format!("Invalid time {value:?}: expected epoch millis or RFC 3339"))
}

/// Serialize a float as `null` when it is NaN or infinite.
pub fn serialize_finite<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_some(value)
    } else {
        serializer.serialize_none()
    }
}

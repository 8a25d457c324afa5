//! Reconciles edits made in a table against the persistence layer.
//!
//! [`diff`] compares two snapshots of the same table cell by cell, keyed by a
//! row-identifier column. [`apply_changes`] then persists the changes that
//! touch writable columns and ignores the rest.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use phf::phf_set;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::store::ChargingStore;
use crate::table::{CellValue, RowKey, TableRow, TableSnapshot, cell};
use crate::utils::{from_millis, parse_timestamp};

/// Columns an operator edit is allowed to persist.
static WRITABLE_COLUMNS: phf::Set<&'static str> = phf_set! {
    "price",
};

pub fn is_writable(column: &str) -> bool {
    WRITABLE_COLUMNS.contains(column)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Previous,
    Current,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Previous => f.write_str("previous"),
            Side::Current => f.write_str("current"),
        }
    }
}

/// Contract violations in the diff inputs. These are caller bugs and are
/// never recovered from inside the reconciler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffError {
    #[error("{side} snapshot has no row-identifier column {column:?}")]
    MissingRowIdColumn { column: String, side: Side },
    #[error("row {index} of the {side} snapshot has no value in {column:?}")]
    RowWithoutId {
        column: String,
        side: Side,
        index: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub row_id: CellValue,
    pub column_name: String,
    pub previous_value: Option<CellValue>,
    pub current_value: Option<CellValue>,
}

pub type ChangeSet = Vec<ChangeRecord>;

/// Compare `current` against `previous`, returning one record per changed cell.
///
/// Only rows whose identifier appears in both snapshots and columns declared
/// by both snapshots are compared. Two empty cells are equal; an empty cell
/// against a filled one is a change.
pub fn diff(
    previous: &TableSnapshot,
    current: &TableSnapshot,
    row_id_column: &str,
) -> Result<ChangeSet, DiffError> {
    let previous_index = index_rows(previous, row_id_column, Side::Previous)?;
    // Validate the current side up front so a bad row fails the whole call.
    let current_ids = row_ids(current, row_id_column, Side::Current)?;

    let columns: Vec<&str> = current
        .columns
        .iter()
        .map(String::as_str)
        .filter(|c| *c != row_id_column && previous.has_column(c))
        .collect();

    let mut changes = ChangeSet::new();
    for (row, row_id) in current.rows.iter().zip(current_ids) {
        let Some(previous_row) = previous_index.get(&row_id.row_key()) else {
            continue;
        };

        for column in &columns {
            let before = cell(previous_row, column);
            let after = cell(row, column);
            let differs = match (before, after) {
                (None, None) => false,
                (Some(a), Some(b)) => !a.same_as(b),
                _ => true,
            };
            if differs {
                changes.push(ChangeRecord {
                    row_id: row_id.clone(),
                    column_name: column.to_string(),
                    previous_value: before.cloned(),
                    current_value: after.cloned(),
                });
            }
        }
    }

    Ok(changes)
}

fn row_ids<'a>(
    snapshot: &'a TableSnapshot,
    row_id_column: &str,
    side: Side,
) -> Result<Vec<&'a CellValue>, DiffError> {
    if !snapshot.has_column(row_id_column) {
        return Err(DiffError::MissingRowIdColumn {
            column: row_id_column.to_string(),
            side,
        });
    }

    snapshot
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            cell(row, row_id_column).ok_or_else(|| DiffError::RowWithoutId {
                column: row_id_column.to_string(),
                side,
                index,
            })
        })
        .collect()
}

/// Index rows by identifier. A duplicated identifier keeps its last row.
fn index_rows<'a>(
    snapshot: &'a TableSnapshot,
    row_id_column: &str,
    side: Side,
) -> Result<HashMap<RowKey, &'a TableRow>, DiffError> {
    let ids = row_ids(snapshot, row_id_column, side)?;
    Ok(ids
        .into_iter()
        .zip(&snapshot.rows)
        .map(|(id, row)| (id.row_key(), row))
        .collect())
}

/// Outcome of persisting a change set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied: usize,
    pub not_found: usize,
    pub failed: usize,
    pub ignored: usize,
}

/// Persist every change to a writable column. Records the store cannot find
/// or fails to write are logged and skipped; there is no rollback.
pub fn apply_changes(changes: &[ChangeRecord], store: &dyn ChargingStore) -> ApplyReport {
    let mut report = ApplyReport::default();

    for change in changes {
        if !is_writable(&change.column_name) {
            report.ignored += 1;
            continue;
        }

        let Some(start_at) = row_timestamp(&change.row_id) else {
            error!(row_id = ?change.row_id, "Row identifier is not a timestamp");
            report.failed += 1;
            continue;
        };

        let price = match &change.current_value {
            None => None,
            Some(value) => match value.as_f64().filter(|p| p.is_finite()) {
                Some(price) => Some(price),
                None => {
                    error!(%start_at, value = ?value, "Price is not a number");
                    report.failed += 1;
                    continue;
                }
            },
        };

        match store.update_price_by_start_time(start_at, price) {
            Ok(true) => {
                debug!(%start_at, ?price, "Updated charging price");
                report.applied += 1;
            }
            Ok(false) => {
                error!(%start_at, "Can't find line to update in the database");
                report.not_found += 1;
            }
            Err(e) => {
                error!(%start_at, "Failed to update charging price: {e:#}");
                report.failed += 1;
            }
        }
    }

    report
}

/// Charging rows are identified by their start time, either as epoch
/// milliseconds or as a timestamp string.
fn row_timestamp(row_id: &CellValue) -> Option<DateTime<Utc>> {
    match row_id {
        CellValue::Int(millis) => from_millis(*millis),
        CellValue::Float(millis) if millis.is_finite() && millis.fract() == 0.0 => {
            from_millis(*millis as i64)
        }
        CellValue::Text(text) => parse_timestamp(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests;

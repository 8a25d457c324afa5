use super::*;
use crate::store::RefreshCallback;
use parking_lot::Mutex;
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

/// Store that records every update and answers "not found" for chosen rows.
#[derive(Default)]
struct RecordingStore {
    updates: Mutex<Vec<(i64, Option<f64>)>>,
    missing: Vec<i64>,
    failing: Vec<i64>,
}

impl ChargingStore for RecordingStore {
    fn update_price_by_start_time(
        &self,
        start_at: DateTime<Utc>,
        price: Option<f64>,
    ) -> anyhow::Result<bool> {
        let millis = start_at.timestamp_millis();
        self.updates.lock().push((millis, price));
        if self.failing.contains(&millis) {
            anyhow::bail!("disk I/O error");
        }
        Ok(!self.missing.contains(&millis))
    }

    fn register_refresh_callback(&self, _callback: RefreshCallback) {}
}

fn snapshot(rows: &[(i64, Option<f64>)]) -> TableSnapshot {
    let mut table = TableSnapshot::new(&["start_at", "price"]);
    for (start_at, price) in rows {
        table.push_row([
            ("start_at", Some(CellValue::Int(*start_at))),
            ("price", price.map(CellValue::Float)),
        ]);
    }
    table
}

fn change(row_id: i64, column: &str, before: Option<CellValue>, after: Option<CellValue>) -> ChangeRecord {
    ChangeRecord {
        row_id: CellValue::Int(row_id),
        column_name: column.to_string(),
        previous_value: before,
        current_value: after,
    }
}

// ============================================================================
// diff
// ============================================================================

#[test]
fn price_edit_produces_single_change() {
    let a = snapshot(&[(100, Some(10.0))]);
    let b = snapshot(&[(100, Some(12.0))]);

    let changes = diff(&a, &b, "start_at").expect("diff");
    assert_eq!(
        changes,
        vec![change(100, "price", Some(CellValue::Float(10.0)), Some(CellValue::Float(12.0)))]
    );
}

#[test]
fn identical_snapshots_have_no_changes() {
    let a = snapshot(&[(100, Some(10.0)), (200, None), (300, Some(0.0))]);
    assert!(diff(&a, &a.clone(), "start_at").expect("diff").is_empty());
}

#[test]
fn two_empty_cells_are_not_a_change() {
    let a = snapshot(&[(100, None)]);
    let mut b = snapshot(&[(100, None)]);
    // Missing key on one side, explicit null on the other.
    b.rows[0].remove("price");
    assert!(diff(&a, &b, "start_at").expect("diff").is_empty());

    // NaN is also an empty cell.
    b.rows[0].insert("price".into(), Some(CellValue::Float(f64::NAN)));
    assert!(diff(&a, &b, "start_at").expect("diff").is_empty());
}

#[test]
fn clearing_and_filling_a_cell_are_changes() {
    let filled = snapshot(&[(100, Some(5.0))]);
    let cleared = snapshot(&[(100, None)]);

    let changes = diff(&filled, &cleared, "start_at").expect("diff");
    assert_eq!(changes, vec![change(100, "price", Some(CellValue::Float(5.0)), None)]);

    let changes = diff(&cleared, &filled, "start_at").expect("diff");
    assert_eq!(changes, vec![change(100, "price", None, Some(CellValue::Float(5.0)))]);
}

#[test]
fn int_and_float_of_same_value_are_equal() {
    let mut a = TableSnapshot::new(&["start_at", "price"]);
    a.push_row([("start_at", Some(CellValue::Int(100))), ("price", Some(CellValue::Int(10)))]);
    let mut b = TableSnapshot::new(&["start_at", "price"]);
    b.push_row([
        ("start_at", Some(CellValue::Float(100.0))),
        ("price", Some(CellValue::Float(10.0))),
    ]);
    assert!(diff(&a, &b, "start_at").expect("diff").is_empty());
}

#[test]
fn rows_only_on_one_side_are_ignored() {
    let previous = snapshot(&[(100, Some(1.0)), (200, Some(2.0))]);
    // 200 removed, 300 inserted, 100 untouched
    let current = snapshot(&[(300, Some(3.0)), (100, Some(1.0))]);
    assert!(diff(&previous, &current, "start_at").expect("diff").is_empty());
}

#[test]
fn rows_are_matched_by_identifier_not_position() {
    let previous = snapshot(&[(100, Some(1.0)), (200, Some(2.0))]);
    let current = snapshot(&[(200, Some(2.5)), (100, Some(1.0))]);
    let changes = diff(&previous, &current, "start_at").expect("diff");
    assert_eq!(changes, vec![change(200, "price", Some(CellValue::Float(2.0)), Some(CellValue::Float(2.5)))]);
}

#[test]
fn columns_only_on_one_side_are_ignored() {
    let previous = snapshot(&[(100, Some(1.0))]);
    let mut current = TableSnapshot::new(&["start_at", "price", "note"]);
    current.push_row([
        ("start_at", Some(CellValue::Int(100))),
        ("price", Some(CellValue::Float(1.0))),
        ("note", Some(CellValue::from("home"))),
    ]);
    assert!(diff(&previous, &current, "start_at").expect("diff").is_empty());
}

#[test]
fn changes_follow_current_row_and_column_order() {
    let mut previous = TableSnapshot::new(&["start_at", "energy_kwh", "price"]);
    let mut current = previous.clone();
    for (id, energy, price) in [(100, 10.0, 1.0), (200, 20.0, 2.0)] {
        previous.push_row([
            ("start_at", Some(CellValue::Int(id))),
            ("energy_kwh", Some(CellValue::Float(energy))),
            ("price", Some(CellValue::Float(price))),
        ]);
    }
    for (id, energy, price) in [(200, 21.0, 2.0), (100, 11.0, 1.5)] {
        current.push_row([
            ("start_at", Some(CellValue::Int(id))),
            ("energy_kwh", Some(CellValue::Float(energy))),
            ("price", Some(CellValue::Float(price))),
        ]);
    }

    let changes = diff(&previous, &current, "start_at").expect("diff");
    let order: Vec<(CellValue, &str)> = changes
        .iter()
        .map(|c| (c.row_id.clone(), c.column_name.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![
            (CellValue::Int(200), "energy_kwh"),
            (CellValue::Int(100), "energy_kwh"),
            (CellValue::Int(100), "price"),
        ]
    );
}

#[test]
fn missing_row_id_column_fails_fast() {
    let good = snapshot(&[(100, Some(1.0))]);
    let mut bad = TableSnapshot::new(&["price"]);
    bad.push_row([("price", Some(CellValue::Float(1.0)))]);

    assert_eq!(
        diff(&bad, &good, "start_at"),
        Err(DiffError::MissingRowIdColumn {
            column: "start_at".into(),
            side: Side::Previous
        })
    );
    assert_eq!(
        diff(&good, &bad, "start_at"),
        Err(DiffError::MissingRowIdColumn {
            column: "start_at".into(),
            side: Side::Current
        })
    );
}

#[test]
fn empty_snapshots_with_declared_columns_are_valid() {
    let empty = snapshot(&[]);
    assert!(diff(&empty, &snapshot(&[(1, Some(1.0))]), "start_at").expect("diff").is_empty());
}

#[test]
fn row_without_identifier_fails() {
    let good = snapshot(&[(100, Some(1.0))]);
    let mut bad = snapshot(&[(100, Some(1.0)), (200, Some(2.0))]);
    bad.rows[1].insert("start_at".into(), None);

    let err = diff(&good, &bad, "start_at").unwrap_err();
    assert_eq!(
        err,
        DiffError::RowWithoutId {
            column: "start_at".into(),
            side: Side::Current,
            index: 1
        }
    );
    assert!(err.to_string().contains("row 1 of the current snapshot"));
}

// ============================================================================
// apply_changes
// ============================================================================

#[test]
fn apply_updates_store_with_row_id_and_price() {
    let store = RecordingStore::default();
    let changes = diff(
        &snapshot(&[(100, Some(10.0))]),
        &snapshot(&[(100, Some(12.0))]),
        "start_at",
    )
    .expect("diff");

    let report = apply_changes(&changes, &store);
    assert_eq!(report.applied, 1);
    assert_eq!(*store.updates.lock(), vec![(100, Some(12.0))]);
}

#[test]
fn apply_continues_after_not_found() {
    let store = RecordingStore {
        missing: vec![100],
        ..RecordingStore::default()
    };
    let changes = vec![
        change(100, "price", Some(CellValue::Float(1.0)), Some(CellValue::Float(2.0))),
        change(200, "price", Some(CellValue::Float(1.0)), Some(CellValue::Float(3.0))),
    ];

    let report = apply_changes(&changes, &store);
    assert_eq!(
        report,
        ApplyReport {
            applied: 1,
            not_found: 1,
            failed: 0,
            ignored: 0
        }
    );
    assert_eq!(
        *store.updates.lock(),
        vec![(100, Some(2.0)), (200, Some(3.0))]
    );
}

#[test]
fn apply_continues_after_store_error() {
    let store = RecordingStore {
        failing: vec![100],
        ..RecordingStore::default()
    };
    let changes = vec![
        change(100, "price", None, Some(CellValue::Float(2.0))),
        change(200, "price", None, Some(CellValue::Float(3.0))),
    ];

    let report = apply_changes(&changes, &store);
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(store.updates.lock().len(), 2);
}

#[test]
fn apply_ignores_non_writable_columns() {
    let store = RecordingStore::default();
    let changes = vec![
        change(100, "energy_kwh", Some(CellValue::Float(1.0)), Some(CellValue::Float(2.0))),
        change(100, "price_per_kwh", Some(CellValue::Float(1.0)), Some(CellValue::Float(2.0))),
    ];

    let report = apply_changes(&changes, &store);
    assert_eq!(report.ignored, 2);
    assert!(store.updates.lock().is_empty());
}

#[test]
fn apply_clears_price_when_cell_emptied() {
    let store = RecordingStore::default();
    let report = apply_changes(&[change(100, "price", Some(CellValue::Float(4.0)), None)], &store);
    assert_eq!(report.applied, 1);
    assert_eq!(*store.updates.lock(), vec![(100, None)]);
}

#[test]
fn apply_accepts_text_identifiers_and_prices() {
    let store = RecordingStore::default();
    let record = ChangeRecord {
        row_id: CellValue::from("1970-01-01T00:00:01Z"),
        column_name: "price".into(),
        previous_value: None,
        current_value: Some(CellValue::from("7.25")),
    };
    let report = apply_changes(&[record], &store);
    assert_eq!(report.applied, 1);
    assert_eq!(*store.updates.lock(), vec![(1000, Some(7.25))]);
}

#[test]
fn apply_rejects_unparseable_values_without_writing() {
    let store = RecordingStore::default();
    let bad_price = ChangeRecord {
        row_id: CellValue::Int(100),
        column_name: "price".into(),
        previous_value: None,
        current_value: Some(CellValue::from("cheap")),
    };
    let bad_id = ChangeRecord {
        row_id: CellValue::Bool(true),
        column_name: "price".into(),
        previous_value: None,
        current_value: Some(CellValue::Float(1.0)),
    };

    let report = apply_changes(&[bad_price, bad_id], &store);
    assert_eq!(report.failed, 2);
    assert!(store.updates.lock().is_empty());
}

#[test]
fn writable_set_is_price_only() {
    assert!(is_writable("price"));
    assert!(!is_writable("start_at"));
    assert!(!is_writable("energy_kwh"));
}

// ============================================================================
// Properties
// ============================================================================

fn arb_rows() -> impl Strategy<Value = Vec<(i64, Option<f64>)>> {
    proptest::collection::btree_map(0i64..1_000, proptest::option::of(-100.0f64..100.0), 0..20)
        .prop_map(|rows| rows.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_equal_snapshots_diff_empty(rows in arb_rows()) {
        let a = snapshot(&rows);
        prop_assert!(diff(&a, &a.clone(), "start_at").unwrap().is_empty());
    }

    #[test]
    fn prop_single_cell_edit_gives_single_record(
        rows in arb_rows().prop_filter("non-empty", |r| !r.is_empty()),
        pick in any::<prop::sample::Index>(),
        new_price in 200.0f64..300.0,
    ) {
        let previous = snapshot(&rows);
        let mut edited = rows.clone();
        let index = pick.index(edited.len());
        let old_price = edited[index].1;
        edited[index].1 = Some(new_price);
        let current = snapshot(&edited);

        let changes = diff(&previous, &current, "start_at").unwrap();
        prop_assert_eq!(changes.len(), 1);
        prop_assert_eq!(&changes[0].row_id, &CellValue::Int(edited[index].0));
        prop_assert_eq!(changes[0].column_name.as_str(), "price");
        prop_assert_eq!(changes[0].previous_value.clone(), old_price.map(CellValue::Float));
        prop_assert_eq!(changes[0].current_value.clone(), Some(CellValue::Float(new_price)));
    }
}

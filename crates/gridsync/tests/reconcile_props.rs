//! Delivering a change event twice leaves the store as delivering it once.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use gridsync::testing::case_rows;
use gridsync::GridStore;
use gridsync_api::{ChangeEvent, ColumnId, RowId, Value};
use gridsync_core::GridSchema;

const ROWS: [&str; 4] = ["1", "2", "3", "9"];

fn update_event() -> impl Strategy<Value = ChangeEvent> {
    (
        prop::sample::select(ROWS.to_vec()),
        prop::sample::select(vec!["title", "status", "rank"]),
        0i64..5,
    )
        .prop_map(|(row, field, n)| {
            let value = match field {
                "title" => Value::from(format!("Title {}", n)),
                _ => Value::from(n),
            };
            ChangeEvent::update("cases", row).with_field(field, value)
        })
}

fn log_event() -> impl Strategy<Value = ChangeEvent> {
    (
        prop::sample::select(vec!["u1", "u2", "u3"]),
        prop::sample::select(ROWS.to_vec()),
        1u32..28,
    )
        .prop_map(|(entry, row, day)| {
            let created_at = Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap();
            ChangeEvent::insert("case_updates", entry)
                .with_field("case_id", row)
                .with_field("content", format!("note {} on {}", entry, day))
                .with_field("created_at", Value::from_datetime(created_at))
        })
}

fn any_event() -> impl Strategy<Value = ChangeEvent> {
    prop_oneof![
        4 => update_event(),
        3 => log_event(),
        1 => prop::sample::select(ROWS.to_vec()).prop_map(|row| ChangeEvent::delete("cases", row)),
        1 => prop::sample::select(vec!["u1", "u2"]).prop_map(|entry| ChangeEvent::delete("case_updates", entry)),
    ]
}

fn loaded_store() -> GridStore {
    let store = GridStore::new(Arc::new(GridSchema::cases()), 16);
    store.load(case_rows(), vec![]);
    store
}

type RowSnapshot = (String, i64, Vec<(ColumnId, Value)>, Vec<String>);

fn snapshot(store: &GridStore) -> Vec<RowSnapshot> {
    store
        .rows()
        .into_iter()
        .map(|row| {
            let mut fields: Vec<(ColumnId, Value)> = row.fields.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            let mut log: Vec<String> = store
                .log_entries(&row.id)
                .into_iter()
                .map(|e| format!("{}:{}", e.id, e.content))
                .collect();
            log.sort();
            (row.id.to_string(), row.rank, fields, log)
        })
        .collect()
}

proptest! {
    #[test]
    fn test_duplicate_delivery_is_idempotent(events in prop::collection::vec(any_event(), 1..30)) {
        let once = loaded_store();
        let twice = loaded_store();
        for event in &events {
            once.apply_remote_event(event);
            twice.apply_remote_event(event);
            twice.apply_remote_event(event);
        }
        prop_assert_eq!(snapshot(&once), snapshot(&twice));
    }

    #[test]
    fn test_latest_log_ignores_delivery_order(days in prop::collection::vec(1u32..28, 1..6)) {
        let forward = loaded_store();
        let backward = loaded_store();
        let events: Vec<ChangeEvent> = days
            .iter()
            .enumerate()
            .map(|(i, day)| {
                let created_at = Utc.with_ymd_and_hms(2024, 6, *day, 12, 0, 0).unwrap();
                ChangeEvent::insert("case_updates", format!("e{}", i))
                    .with_field("case_id", "2")
                    .with_field("content", format!("note {}", i))
                    .with_field("created_at", Value::from_datetime(created_at))
            })
            .collect();
        for event in &events {
            forward.apply_remote_event(event);
        }
        for event in events.iter().rev() {
            backward.apply_remote_event(event);
        }
        let row = RowId::from("2");
        prop_assert_eq!(
            forward.row(&row).and_then(|r| r.value("last_update").cloned()),
            backward.row(&row).and_then(|r| r.value("last_update").cloned())
        );
    }
}

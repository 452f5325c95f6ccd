//! Property-based test of the store's conflict protocol
//!
//! Random interleavings of local edits, remote updates, remote deletes and
//! out-of-order persistence results are applied to a `GridStore` and to a
//! small reference model. After every step the displayed values and dirty
//! sets must match.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use proptest::prelude::*;
use proptest::sample::Index;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest};

use gridsync::{GridStore, PendingMutation};
use gridsync_api::{ChangeEvent, ColumnId, RowId, RowRecord, Value};
use gridsync_core::GridSchema;

const ROWS: [&str; 3] = ["r0", "r1", "r2"];
const COLUMNS: [&str; 2] = ["title", "category"];
const VALUES: [&str; 4] = ["Pending", "Archived", "Open", "Closed"];

#[derive(Debug, Clone)]
enum GridTransition {
    LocalEdit {
        row: &'static str,
        column: &'static str,
        value: &'static str,
    },
    RemoteUpdate {
        row: &'static str,
        column: &'static str,
        value: &'static str,
    },
    RemoteDelete {
        row: &'static str,
    },
    ResolveSuccess(Index),
    ResolveFailure(Index),
}

#[derive(Debug, Clone)]
struct ModelCell {
    displayed: String,
    /// Value restored if the pending edit fails
    baseline: String,
    pending: Option<u64>,
}

#[derive(Debug, Clone)]
struct Outstanding {
    request_id: u64,
    row: &'static str,
    column: &'static str,
    value: &'static str,
}

#[derive(Debug, Clone)]
struct ReferenceGrid {
    cells: BTreeMap<(&'static str, &'static str), ModelCell>,
    rows: BTreeSet<&'static str>,
    outstanding: Vec<Outstanding>,
    next_request_id: u64,
}

impl ReferenceGrid {
    fn initial() -> Self {
        let mut cells = BTreeMap::new();
        for row in ROWS {
            for column in COLUMNS {
                cells.insert(
                    (row, column),
                    ModelCell {
                        displayed: "init".to_string(),
                        baseline: "init".to_string(),
                        pending: None,
                    },
                );
            }
        }
        Self {
            cells,
            rows: ROWS.into_iter().collect(),
            outstanding: Vec::new(),
            next_request_id: 0,
        }
    }
}

fn cell_strategy() -> impl Strategy<Value = (&'static str, &'static str, &'static str)> {
    (
        prop::sample::select(ROWS.to_vec()),
        prop::sample::select(COLUMNS.to_vec()),
        prop::sample::select(VALUES.to_vec()),
    )
}

impl ReferenceStateMachine for ReferenceGrid {
    type State = Self;
    type Transition = GridTransition;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(ReferenceGrid::initial()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            4 => cell_strategy().prop_map(|(row, column, value)| GridTransition::LocalEdit { row, column, value }),
            3 => cell_strategy().prop_map(|(row, column, value)| GridTransition::RemoteUpdate { row, column, value }),
            1 => prop::sample::select(ROWS.to_vec()).prop_map(|row| GridTransition::RemoteDelete { row }),
            3 => any::<Index>().prop_map(GridTransition::ResolveSuccess),
            2 => any::<Index>().prop_map(GridTransition::ResolveFailure),
        ]
        .boxed()
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            GridTransition::LocalEdit { row, .. } => state.rows.contains(row),
            GridTransition::ResolveSuccess(_) | GridTransition::ResolveFailure(_) => {
                !state.outstanding.is_empty()
            }
            _ => true,
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            GridTransition::LocalEdit { row, column, value } => {
                state.next_request_id += 1;
                let request_id = state.next_request_id;
                if let Some(cell) = state.cells.get_mut(&(*row, *column)) {
                    if cell.pending.is_none() {
                        cell.baseline = cell.displayed.clone();
                    }
                    cell.displayed = value.to_string();
                    cell.pending = Some(request_id);
                }
                state.outstanding.push(Outstanding {
                    request_id,
                    row: *row,
                    column: *column,
                    value: *value,
                });
            }
            GridTransition::RemoteUpdate { row, column, value } => {
                if state.rows.contains(row) {
                    if let Some(cell) = state.cells.get_mut(&(*row, *column)) {
                        if cell.pending.is_some() {
                            cell.baseline = value.to_string();
                        } else {
                            cell.displayed = value.to_string();
                        }
                    }
                }
            }
            GridTransition::RemoteDelete { row } => {
                state.rows.remove(row);
                for column in COLUMNS {
                    if let Some(cell) = state.cells.get_mut(&(*row, column)) {
                        cell.pending = None;
                    }
                }
            }
            GridTransition::ResolveSuccess(index) => {
                let m = state.outstanding.remove(index.index(state.outstanding.len()));
                if state.rows.contains(&m.row) {
                    if let Some(cell) = state.cells.get_mut(&(m.row, m.column)) {
                        match cell.pending {
                            Some(newest) if newest == m.request_id => {
                                cell.pending = None;
                                cell.displayed = m.value.to_string();
                                cell.baseline = m.value.to_string();
                            }
                            Some(_) => cell.baseline = m.value.to_string(),
                            None => {}
                        }
                    }
                }
            }
            GridTransition::ResolveFailure(index) => {
                let m = state.outstanding.remove(index.index(state.outstanding.len()));
                if state.rows.contains(&m.row) {
                    if let Some(cell) = state.cells.get_mut(&(m.row, m.column)) {
                        if cell.pending == Some(m.request_id) {
                            cell.pending = None;
                            cell.displayed = cell.baseline.clone();
                        }
                    }
                }
            }
        }
        state
    }
}

struct StoreUnderTest {
    store: GridStore,
    outstanding: Vec<PendingMutation>,
}

impl StateMachineTest for StoreUnderTest {
    type SystemUnderTest = Self;
    type Reference = ReferenceGrid;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        let store = GridStore::new(Arc::new(GridSchema::cases()), 16);
        let rows = ROWS
            .iter()
            .enumerate()
            .map(|(rank, id)| {
                COLUMNS
                    .iter()
                    .fold(RowRecord::new(*id, rank as i64), |record, column| {
                        record.with_field(*column, "init")
                    })
            })
            .collect();
        store.load(rows, vec![]);
        StoreUnderTest {
            store,
            outstanding: Vec::new(),
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        match transition {
            GridTransition::LocalEdit { row, column, value } => {
                let mutation = state
                    .store
                    .apply_local_edit(&RowId::from(row), &ColumnId::from(column), value.into(), None)
                    .expect("row exists per precondition");
                state.outstanding.push(mutation);
            }
            GridTransition::RemoteUpdate { row, column, value } => {
                state
                    .store
                    .apply_remote_event(&ChangeEvent::update("cases", row).with_field(column, value));
            }
            GridTransition::RemoteDelete { row } => {
                state
                    .store
                    .apply_remote_event(&ChangeEvent::delete("cases", row));
            }
            GridTransition::ResolveSuccess(index) => {
                let m = state.outstanding.remove(index.index(state.outstanding.len()));
                let confirmed = Some(m.new_value.clone());
                state.store.resolve_success(&m, confirmed);
            }
            GridTransition::ResolveFailure(index) => {
                let m = state.outstanding.remove(index.index(state.outstanding.len()));
                state.store.resolve_failure(&m);
            }
        }
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let ids: Vec<String> = state.store.order().iter().map(|id| id.to_string()).collect();
        let expected: Vec<String> = ROWS
            .iter()
            .filter(|r| ref_state.rows.contains(*r))
            .map(|r| r.to_string())
            .collect();
        assert_eq!(ids, expected);

        for row_id in &ref_state.rows {
            let row = state
                .store
                .row(&RowId::from(*row_id))
                .expect("row present in model");
            for column in COLUMNS {
                let cell = &ref_state.cells[&(*row_id, column)];
                assert_eq!(
                    row.value(column),
                    Some(&Value::from(cell.displayed.as_str())),
                    "{}/{}",
                    row_id,
                    column
                );
                assert_eq!(row.is_dirty(column), cell.pending.is_some(), "{}/{}", row_id, column);
            }
        }
    }
}

proptest_state_machine::prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn test_store_matches_reference_model(sequential 1..40 => StoreUnderTest);
}

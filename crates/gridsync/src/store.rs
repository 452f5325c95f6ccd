//! Local grid store
//!
//! The store is the single owner of the rows a mounted grid renders. It is
//! written by two independent sources, the mutation applier (user edits) and
//! the change-feed reconciler (pushed events). Neither takes a lock across an
//! await point; conflicts are settled by the dirty set instead:
//!
//! - a local edit marks `(row, column)` dirty and registers a `PendingMutation`
//! - a remote value for a dirty cell is held back (it only moves the rollback
//!   baseline), remote values for clean cells apply immediately
//! - a delete always wins
//!
//! Display order is always derived from `rank` (ties broken by id), never
//! from insertion order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, info};

use gridsync_api::{
    CatalogId, ChangeEvent, ChangeKind, ColumnId, Fields, GridError, LogEntry, RankUpdate, RowId,
    RowRecord, TraceContext, Value,
};
use gridsync_core::{GridSchema, Result};

/// A row as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: RowId,
    pub rank: i64,
    pub fields: Fields,
    /// Columns with an unconfirmed local edit (the rank field counts while a
    /// reorder is being persisted)
    pub dirty: HashSet<ColumnId>,
}

impl Row {
    fn from_record(record: RowRecord) -> Self {
        Self {
            id: record.id,
            rank: record.rank,
            fields: record.fields,
            dirty: HashSet::new(),
        }
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn is_dirty(&self, column: &str) -> bool {
        self.dirty.contains(column)
    }
}

/// A committed-but-unconfirmed cell edit.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub row_id: RowId,
    pub column: ColumnId,
    /// Last confirmed value, restored on failure
    pub previous_value: Value,
    pub new_value: Value,
    pub request_id: u64,
    pub trace: Option<TraceContext>,
}

/// How a persistence result was taken into account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The mutation was still the newest for its cell and its result was applied
    Resolved,
    /// A newer edit to the same cell exists or already settled; at most the
    /// rollback baseline moved
    Superseded,
    /// The row is gone or the store is closed; nothing changed
    Stale,
}

/// Effect of a pushed change event on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// New row created; `partial` when the payload lacked some columns
    Inserted { partial: bool },
    /// Existing row updated field by field
    Merged { applied: usize, held: usize },
    Removed,
    /// Log table change; `row_id` owns the entry after it
    LogUpdated { row_id: RowId },
    /// Update for a row this store does not know
    UnknownRow,
    Ignored,
}

/// Non-fatal condition surfaced to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum GridNotice {
    PersistenceFailed {
        operation: String,
        row_id: Option<RowId>,
        message: String,
    },
    DataMayBeStale {
        table: String,
    },
    ResyncRequired {
        table: String,
    },
    CatalogUnavailable {
        catalog: CatalogId,
    },
    CatalogRestored {
        catalog: CatalogId,
    },
    RowRefetchRequested {
        row_id: RowId,
    },
}

/// Signal published to observers (the rendering layer).
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    RowsChanged,
    Notice(GridNotice),
}

type CellKey = (RowId, ColumnId);

#[derive(Debug, Default)]
struct StoreState {
    rows: HashMap<RowId, Row>,
    order: Vec<RowId>,
    pending: HashMap<CellKey, PendingMutation>,
    /// Log entries by entry id; the owning row is `LogEntry::row_id`
    log_entries: HashMap<String, LogEntry>,
    /// Rows removed by an authoritative delete; never restored by a rollback
    tombstones: HashSet<RowId>,
    next_request_id: u64,
    closed: bool,
}

impl StoreState {
    fn resort(&mut self) {
        let mut keyed: Vec<(i64, &RowId)> = self.rows.values().map(|r| (r.rank, &r.id)).collect();
        keyed.sort();
        self.order = keyed.into_iter().map(|(_, id)| id.clone()).collect();
    }

    fn latest_log_content(&self, row_id: &RowId) -> Value {
        self.log_entries
            .values()
            .filter(|entry| &entry.row_id == row_id)
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .map(|entry| Value::String(entry.content.clone()))
            .unwrap_or(Value::Null)
    }

    /// Store a log entry under its id. Returns the rows whose latest entry
    /// may have changed: the new owner, and the previous one if the entry
    /// moved.
    fn upsert_log_entry(&mut self, entry: LogEntry) -> Vec<RowId> {
        let owner = entry.row_id.clone();
        let mut touched = vec![owner.clone()];
        if let Some(previous) = self.log_entries.insert(entry.id.clone(), entry) {
            if previous.row_id != owner {
                touched.push(previous.row_id);
            }
        }
        touched
    }

    /// Recompute the latest-log column of a row. Returns whether the
    /// displayed value changed.
    fn refresh_derived(&mut self, row_id: &RowId, column: &ColumnId) -> bool {
        let latest = self.latest_log_content(row_id);
        let Some(row) = self.rows.get_mut(row_id) else {
            return false;
        };
        if row.dirty.contains(column) {
            if let Some(pending) = self.pending.get_mut(&(row_id.clone(), column.clone())) {
                pending.previous_value = latest;
            }
            return false;
        }
        if row.fields.get(column) == Some(&latest) {
            return false;
        }
        row.fields.insert(column.clone(), latest);
        true
    }

    fn next_rank(&self) -> i64 {
        self.rows.values().map(|r| r.rank + 1).max().unwrap_or(0)
    }

    /// Drop pending mutations of a row and return the row with every dirty
    /// field put back to its confirmed baseline.
    fn take_confirmed(&mut self, row_id: &RowId) -> Option<Row> {
        let mut row = self.rows.remove(row_id)?;
        let keys: Vec<CellKey> = self
            .pending
            .keys()
            .filter(|(id, _)| id == row_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(pending) = self.pending.remove(&key) {
                row.fields.insert(key.1, pending.previous_value);
            }
        }
        row.dirty.clear();
        Some(row)
    }
}

/// Client-held ordered rows of one mounted grid.
pub struct GridStore {
    schema: Arc<GridSchema>,
    state: RwLock<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl GridStore {
    pub fn new(schema: Arc<GridSchema>, notification_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            schema,
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    pub fn schema(&self) -> &GridSchema {
        &self.schema
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine: nobody is rendering yet
        let _ = self.events.send(event);
    }

    fn latest_log_column(&self) -> Option<ColumnId> {
        self.schema.latest_log_column().map(|c| c.id.clone())
    }

    /// Subscribe to re-render signals and notices.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Publish a user-visible notice. Suppressed after `close()`.
    pub fn notify(&self, notice: GridNotice) {
        if self.is_closed() {
            return;
        }
        info!("[GridStore] Notice: {:?}", notice);
        self.emit(StoreEvent::Notice(notice));
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Rows in display order.
    pub fn rows(&self) -> Vec<Row> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|id| state.rows.get(id).cloned())
            .collect()
    }

    pub fn row(&self, row_id: &RowId) -> Option<Row> {
        self.read().rows.get(row_id).cloned()
    }

    /// Row ids in display order.
    pub fn order(&self) -> Vec<RowId> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self, row_id: &RowId, column: &ColumnId) -> Option<PendingMutation> {
        self.read()
            .pending
            .get(&(row_id.clone(), column.clone()))
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.read().pending.len()
    }

    /// Log entries known for a row, oldest first.
    pub fn log_entries(&self, row_id: &RowId) -> Vec<LogEntry> {
        let state = self.read();
        let mut entries: Vec<LogEntry> = state
            .log_entries
            .values()
            .filter(|entry| &entry.row_id == row_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        entries
    }

    pub fn next_rank(&self) -> i64 {
        self.read().next_rank()
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    // =========================================================================
    // Snapshot loading
    // =========================================================================

    /// Replace confirmed state with a full snapshot (mount or resync).
    ///
    /// Dirty cells keep their local value; the fetched value becomes their
    /// rollback baseline. Rows still being created locally are kept.
    pub fn load(&self, records: Vec<RowRecord>, log_entries: Vec<LogEntry>) {
        let log_column = self.latest_log_column();
        {
            let mut guard = self.write();
            let state = &mut *guard;
            if state.closed {
                return;
            }

            let mut rows: HashMap<RowId, Row> = HashMap::with_capacity(records.len());
            for record in records {
                let mut row = Row::from_record(record);
                if let Some(existing) = state.rows.get(&row.id) {
                    for column in &existing.dirty {
                        let key = (row.id.clone(), column.clone());
                        if self.schema.is_rank_field(column.as_str()) {
                            row.rank = existing.rank;
                        } else if let Some(pending) = state.pending.get_mut(&key) {
                            pending.previous_value =
                                row.fields.get(column).cloned().unwrap_or(Value::Null);
                            row.fields.insert(column.clone(), pending.new_value.clone());
                        }
                    }
                    row.dirty = existing.dirty.clone();
                }
                rows.insert(row.id.clone(), row);
            }
            for (id, row) in state.rows.drain() {
                if id.is_local() {
                    rows.insert(id, row);
                }
            }
            state.pending.retain(|(row_id, _), _| rows.contains_key(row_id));
            state.rows = rows;

            state.log_entries = log_entries
                .into_iter()
                .map(|entry| (entry.id.clone(), entry))
                .collect();
            if let Some(column) = &log_column {
                let ids: Vec<RowId> = state.rows.keys().cloned().collect();
                for id in ids {
                    state.refresh_derived(&id, column);
                }
            }
            state.tombstones.clear();
            state.resort();
            info!("[GridStore] Loaded {} rows", state.rows.len());
        }
        self.emit(StoreEvent::RowsChanged);
    }

    // =========================================================================
    // Local edits
    // =========================================================================

    /// Apply a user edit immediately and register it as pending.
    ///
    /// Supersedes any pending edit of the same cell; the superseded edit's
    /// baseline is carried over so a later rollback still lands on the last
    /// confirmed value.
    pub fn apply_local_edit(
        &self,
        row_id: &RowId,
        column: &ColumnId,
        value: Value,
        trace: Option<TraceContext>,
    ) -> Result<PendingMutation> {
        let mutation = {
            let mut guard = self.write();
            let state = &mut *guard;
            if state.closed {
                return Err(GridError::Closed);
            }
            let key = (row_id.clone(), column.clone());
            let carried_baseline = state.pending.get(&key).map(|p| p.previous_value.clone());

            let row = state
                .rows
                .get_mut(row_id)
                .ok_or_else(|| GridError::RowNotFound {
                    id: row_id.to_string(),
                })?;
            let current = row.fields.get(column).cloned().unwrap_or(Value::Null);
            row.fields.insert(column.clone(), value.clone());
            row.dirty.insert(column.clone());

            state.next_request_id += 1;
            let mutation = PendingMutation {
                row_id: row_id.clone(),
                column: column.clone(),
                previous_value: carried_baseline.unwrap_or(current),
                new_value: value,
                request_id: state.next_request_id,
                trace,
            };
            if let Some(old) = state.pending.insert(key, mutation.clone()) {
                debug!(
                    "[GridStore] Edit {} supersedes {} on {}/{}",
                    mutation.request_id, old.request_id, row_id, column
                );
            }
            mutation
        };
        self.emit(StoreEvent::RowsChanged);
        Ok(mutation)
    }

    /// Take a successful persistence result into account.
    ///
    /// Only honored when `mutation` is still the newest for its cell. A
    /// superseded success only moves the baseline of the newer edit.
    pub fn resolve_success(&self, mutation: &PendingMutation, confirmed: Option<Value>) -> Resolution {
        let is_log = self.latest_log_column().as_ref() == Some(&mutation.column);
        let resolution = {
            let mut guard = self.write();
            let state = &mut *guard;
            if state.closed {
                return Resolution::Stale;
            }
            let key = (mutation.row_id.clone(), mutation.column.clone());
            match state.pending.get(&key).map(|p| p.request_id) {
                Some(newest) if newest == mutation.request_id => {
                    state.pending.remove(&key);
                    if let Some(row) = state.rows.get_mut(&mutation.row_id) {
                        row.dirty.remove(&mutation.column);
                        if !is_log {
                            if let Some(value) = confirmed {
                                row.fields.insert(mutation.column.clone(), value);
                            }
                        }
                    }
                    if is_log {
                        state.refresh_derived(&mutation.row_id, &mutation.column);
                    }
                    Resolution::Resolved
                }
                Some(_) => {
                    if is_log {
                        state.refresh_derived(&mutation.row_id, &mutation.column);
                    } else if let Some(newer) = state.pending.get_mut(&key) {
                        newer.previous_value =
                            confirmed.unwrap_or_else(|| mutation.new_value.clone());
                    }
                    Resolution::Superseded
                }
                // A newer edit of the cell already settled
                None if state.rows.contains_key(&mutation.row_id) => Resolution::Superseded,
                None => Resolution::Stale,
            }
        };
        debug!(
            "[GridStore] Success of edit {} on {}/{}: {:?}",
            mutation.request_id, mutation.row_id, mutation.column, resolution
        );
        if resolution == Resolution::Resolved {
            self.emit(StoreEvent::RowsChanged);
        }
        resolution
    }

    /// Roll back a failed edit if it is still the newest for its cell.
    pub fn resolve_failure(&self, mutation: &PendingMutation) -> Resolution {
        let is_log = self.latest_log_column().as_ref() == Some(&mutation.column);
        let resolution = {
            let mut guard = self.write();
            let state = &mut *guard;
            if state.closed {
                return Resolution::Stale;
            }
            let key = (mutation.row_id.clone(), mutation.column.clone());
            match state.pending.get(&key).map(|p| p.request_id) {
                Some(newest) if newest == mutation.request_id => {
                    if let Some(pending) = state.pending.remove(&key) {
                        if let Some(row) = state.rows.get_mut(&mutation.row_id) {
                            row.dirty.remove(&mutation.column);
                            row.fields
                                .insert(mutation.column.clone(), pending.previous_value);
                        }
                    }
                    if is_log {
                        state.refresh_derived(&mutation.row_id, &mutation.column);
                    }
                    Resolution::Resolved
                }
                Some(_) => Resolution::Superseded,
                None if state.rows.contains_key(&mutation.row_id) => Resolution::Superseded,
                None => Resolution::Stale,
            }
        };
        if resolution == Resolution::Resolved {
            info!(
                "[GridStore] Rolled back edit {} on {}/{}",
                mutation.request_id, mutation.row_id, mutation.column
            );
            self.emit(StoreEvent::RowsChanged);
        }
        resolution
    }

    /// Record a log entry confirmed by the persistence layer.
    pub fn record_log_entry(&self, entry: LogEntry) {
        let Some(column) = self.latest_log_column() else {
            return;
        };
        let changed = {
            let mut state = self.write();
            if state.closed {
                return;
            }
            let mut changed = false;
            for owner in state.upsert_log_entry(entry) {
                changed |= state.refresh_derived(&owner, &column);
            }
            changed
        };
        if changed {
            self.emit(StoreEvent::RowsChanged);
        }
    }

    // =========================================================================
    // Row lifecycle
    // =========================================================================

    /// Insert a row, or reconcile by id with the row already present.
    ///
    /// Returns `true` when a new row was created.
    pub fn insert_row(&self, record: RowRecord) -> bool {
        let log_column = self.latest_log_column();
        let created = {
            let mut guard = self.write();
            let state = &mut *guard;
            if state.closed {
                return false;
            }
            let created = self.upsert(state, record);
            state.resort();
            if let (Some(id), Some(column)) = (created.as_ref(), log_column.as_ref()) {
                state.refresh_derived(id, column);
            }
            created.is_some()
        };
        self.emit(StoreEvent::RowsChanged);
        created
    }

    /// Swap an optimistic local row for the row the server created.
    ///
    /// If the change feed already delivered the server row, the two are
    /// reconciled by id instead of duplicated.
    pub fn replace_local_row(&self, local_id: &RowId, record: RowRecord) {
        let log_column = self.latest_log_column();
        {
            let mut guard = self.write();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            state.rows.remove(local_id);
            state.pending.retain(|(row_id, _), _| row_id != local_id);
            if state.tombstones.contains(&record.id) {
                debug!(
                    "[GridStore] Server row {} was deleted before its insert returned",
                    record.id
                );
            } else {
                let id = record.id.clone();
                self.upsert(state, record);
                if let Some(column) = &log_column {
                    state.refresh_derived(&id, column);
                }
            }
            state.resort();
        }
        self.emit(StoreEvent::RowsChanged);
    }

    /// Remove a row (user delete). Returns its confirmed snapshot so a failed
    /// delete can restore it.
    pub fn remove_row(&self, row_id: &RowId) -> Option<Row> {
        let removed = {
            let mut state = self.write();
            if state.closed {
                return None;
            }
            let removed = state.take_confirmed(row_id);
            state.resort();
            removed
        };
        if removed.is_some() {
            self.emit(StoreEvent::RowsChanged);
        }
        removed
    }

    /// Put back a row removed by `remove_row`. Refused when the row was
    /// deleted authoritatively meanwhile or has reappeared.
    pub fn restore_row(&self, row: Row) -> bool {
        let restored = {
            let mut state = self.write();
            if state.closed || state.tombstones.contains(&row.id) || state.rows.contains_key(&row.id)
            {
                false
            } else {
                state.rows.insert(row.id.clone(), row);
                state.resort();
                true
            }
        };
        if restored {
            self.emit(StoreEvent::RowsChanged);
        }
        restored
    }

    /// Create or merge; returns the id when a new row was created.
    fn upsert(&self, state: &mut StoreState, record: RowRecord) -> Option<RowId> {
        state.tombstones.remove(&record.id);
        if state.rows.contains_key(&record.id) {
            let mut payload = record.fields;
            payload.insert(self.schema.rank_field.clone(), Value::Integer(record.rank));
            self.merge_fields(state, &record.id, payload);
            None
        } else {
            let id = record.id.clone();
            state.rows.insert(id.clone(), Row::from_record(record));
            Some(id)
        }
    }

    /// Field-level merge of remote values. Returns (applied, held).
    fn merge_fields(&self, state: &mut StoreState, row_id: &RowId, payload: Fields) -> (usize, usize) {
        let log_column = self.latest_log_column();
        let Some(row) = state.rows.get_mut(row_id) else {
            return (0, 0);
        };
        let (mut applied, mut held) = (0, 0);
        for (field, value) in payload {
            if Some(&field) == log_column.as_ref() {
                // Derived from the log table, never taken from the row payload
                continue;
            }
            if row.dirty.contains(&field) {
                held += 1;
                if let Some(pending) = state.pending.get_mut(&(row_id.clone(), field.clone())) {
                    pending.previous_value = value;
                }
                continue;
            }
            if self.schema.is_rank_field(field.as_str()) {
                if let Some(rank) = value.as_i64() {
                    if row.rank != rank {
                        row.rank = rank;
                        applied += 1;
                    }
                }
                continue;
            }
            if row.fields.get(&field) != Some(&value) {
                row.fields.insert(field, value);
                applied += 1;
            }
        }
        (applied, held)
    }

    // =========================================================================
    // Remote events
    // =========================================================================

    /// Merge a pushed change event into the store.
    pub fn apply_remote_event(&self, event: &ChangeEvent) -> RemoteOutcome {
        let outcome = {
            let mut guard = self.write();
            let state = &mut *guard;
            if state.closed {
                return RemoteOutcome::Ignored;
            }
            if event.table == self.schema.table {
                self.apply_row_event(state, event)
            } else if self
                .schema
                .log
                .as_ref()
                .is_some_and(|log| log.table == event.table)
            {
                self.apply_log_event(state, event)
            } else {
                RemoteOutcome::Ignored
            }
        };
        debug!(
            "[GridStore] {:?} {} on {}: {:?}",
            event.kind, event.row_id, event.table, outcome
        );
        match outcome {
            RemoteOutcome::Ignored
            | RemoteOutcome::UnknownRow
            | RemoteOutcome::Merged { applied: 0, .. } => {}
            _ => self.emit(StoreEvent::RowsChanged),
        }
        outcome
    }

    fn apply_row_event(&self, state: &mut StoreState, event: &ChangeEvent) -> RemoteOutcome {
        match event.kind {
            ChangeKind::Insert if !state.rows.contains_key(&event.row_id) => {
                let mut fields = event.payload.clone();
                let rank = fields
                    .remove(&self.schema.rank_field)
                    .and_then(|v| v.as_i64())
                    .unwrap_or_else(|| state.next_rank());
                let partial = self
                    .schema
                    .columns
                    .iter()
                    .filter(|c| !c.is_latest_log())
                    .any(|c| !fields.contains_key(c.source_field()));
                state.tombstones.remove(&event.row_id);
                state.rows.insert(
                    event.row_id.clone(),
                    Row::from_record(RowRecord {
                        id: event.row_id.clone(),
                        rank,
                        fields,
                    }),
                );
                if let Some(column) = self.latest_log_column() {
                    state.refresh_derived(&event.row_id, &column);
                }
                state.resort();
                RemoteOutcome::Inserted { partial }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                if !state.rows.contains_key(&event.row_id) {
                    return RemoteOutcome::UnknownRow;
                }
                let (applied, held) =
                    self.merge_fields(state, &event.row_id, event.payload.clone());
                if applied > 0 {
                    state.resort();
                }
                RemoteOutcome::Merged { applied, held }
            }
            ChangeKind::Delete => {
                state.tombstones.insert(event.row_id.clone());
                state
                    .log_entries
                    .retain(|_, entry| entry.row_id != event.row_id);
                if state.take_confirmed(&event.row_id).is_some() {
                    state.resort();
                    RemoteOutcome::Removed
                } else {
                    RemoteOutcome::Ignored
                }
            }
        }
    }

    fn apply_log_event(&self, state: &mut StoreState, event: &ChangeEvent) -> RemoteOutcome {
        let (Some(spec), Some(column)) = (self.schema.log.as_ref(), self.latest_log_column())
        else {
            return RemoteOutcome::Ignored;
        };
        let touched = match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(entry) = spec.entry_from_event(event) else {
                    return RemoteOutcome::Ignored;
                };
                state.upsert_log_entry(entry)
            }
            ChangeKind::Delete => match state.log_entries.remove(event.row_id.as_str()) {
                Some(entry) => vec![entry.row_id],
                None => return RemoteOutcome::Ignored,
            },
        };
        for owner in &touched {
            state.refresh_derived(owner, &column);
        }
        match touched.into_iter().next() {
            Some(row_id) => RemoteOutcome::LogUpdated { row_id },
            None => RemoteOutcome::Ignored,
        }
    }

    // =========================================================================
    // Ranks
    // =========================================================================

    pub fn rank_snapshot(&self) -> HashMap<RowId, i64> {
        self.read()
            .rows
            .values()
            .map(|r| (r.id.clone(), r.rank))
            .collect()
    }

    /// Apply new ranks locally and mark them dirty until persisted.
    pub fn apply_ranks(&self, updates: &[RankUpdate]) {
        {
            let mut state = self.write();
            if state.closed {
                return;
            }
            for update in updates {
                if let Some(row) = state.rows.get_mut(&update.row_id) {
                    row.rank = update.rank;
                    row.dirty.insert(self.schema.rank_field.clone());
                }
            }
            state.resort();
        }
        self.emit(StoreEvent::RowsChanged);
    }

    /// Clear the rank dirty marker once the ranks are persisted.
    pub fn settle_ranks(&self, row_ids: &[RowId]) {
        let mut state = self.write();
        if state.closed {
            return;
        }
        for id in row_ids {
            if let Some(row) = state.rows.get_mut(id) {
                row.dirty.remove(&self.schema.rank_field);
            }
        }
    }

    /// Put the given rows back to their snapshot ranks.
    pub fn restore_ranks(&self, snapshot: &HashMap<RowId, i64>, row_ids: &[RowId]) {
        {
            let mut state = self.write();
            if state.closed {
                return;
            }
            for id in row_ids {
                if let (Some(row), Some(rank)) = (state.rows.get_mut(id), snapshot.get(id)) {
                    row.rank = *rank;
                    row.dirty.remove(&self.schema.rank_field);
                }
            }
            state.resort();
        }
        self.emit(StoreEvent::RowsChanged);
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Stop accepting mutations. Outstanding results become `Stale`.
    pub fn close(&self) {
        let mut state = self.write();
        state.closed = true;
        state.pending.clear();
        info!("[GridStore] Closed");
    }
}

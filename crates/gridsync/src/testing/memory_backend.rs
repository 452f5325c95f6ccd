//! In-memory backend for tests and demos
//!
//! Implements all three collaborator traits over one shared table:
//! - writes mutate the in-memory rows and echo a change event on the feed,
//!   tagged with the origin the engine passed in
//! - write outcomes can be scripted (delay, failure) and writes can be held
//!   behind a gate to keep them in flight
//! - the feed can be disrupted and subscriptions refused to exercise the
//!   reconnect path

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use gridsync_api::{
    CatalogEntry, CatalogId, ChangeEvent, ChangeOrigin, ChangeStream, ColumnId, Fields, GridError,
    LogEntry, RankUpdate, RowId, RowRecord, Value,
};
use gridsync_core::{CatalogSource, ChangeFeedClient, GridPersistence, GridSchema, Result};

/// A persistence call as the backend received it.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceCall {
    UpdateField {
        row_id: RowId,
        column: ColumnId,
        value: Value,
    },
    InsertRow {
        rank: i64,
    },
    DeleteRow {
        row_id: RowId,
    },
    UpdateRanks {
        ranks: Vec<RankUpdate>,
    },
    AppendLogEntry {
        row_id: RowId,
        content: String,
    },
    FetchRows,
}

/// How the next write behaves.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptedWrite {
    pub delay: Duration,
    pub failure: Option<String>,
}

impl ScriptedWrite {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            failure: Some(message.into()),
        }
    }

    pub fn after(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }
}

#[derive(Debug, Clone)]
enum FeedMessage {
    Event(ChangeEvent),
    Disrupt(String),
}

struct BackendState {
    schema: GridSchema,
    rows: HashMap<RowId, RowRecord>,
    log: Vec<LogEntry>,
    catalogs: HashMap<CatalogId, Vec<CatalogEntry>>,
    failing_catalogs: HashSet<CatalogId>,
    script: VecDeque<ScriptedWrite>,
    calls: Vec<PersistenceCall>,
    refused_subscriptions: u32,
    subscriptions: HashMap<String, usize>,
    next_row_id: u64,
    echo_writes: bool,
    fail_fetches: bool,
}

pub struct MemoryGridBackend {
    state: Mutex<BackendState>,
    feed: broadcast::Sender<FeedMessage>,
    /// `true` while writes may proceed
    gate: watch::Sender<bool>,
}

impl MemoryGridBackend {
    pub fn new(schema: &GridSchema) -> Self {
        let (feed, _) = broadcast::channel(1000);
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(BackendState {
                schema: schema.clone(),
                rows: HashMap::new(),
                log: Vec::new(),
                catalogs: HashMap::new(),
                failing_catalogs: HashSet::new(),
                script: VecDeque::new(),
                calls: Vec::new(),
                refused_subscriptions: 0,
                subscriptions: HashMap::new(),
                next_row_id: 1,
                echo_writes: true,
                fail_fetches: false,
            }),
            feed,
            gate,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Seeding and inspection
    // =========================================================================

    pub fn with_catalog(self, catalog: &str, entries: Vec<CatalogEntry>) -> Self {
        self.lock().catalogs.insert(CatalogId::from(catalog), entries);
        self
    }

    pub fn seed_row(&self, record: RowRecord) {
        self.lock().rows.insert(record.id.clone(), record);
    }

    pub fn seed_log_entry(&self, entry: LogEntry) {
        self.lock().log.push(entry);
    }

    pub fn row(&self, row_id: &str) -> Option<RowRecord> {
        self.lock().rows.get(row_id).cloned()
    }

    /// Stored rows ordered by rank.
    pub fn rows(&self) -> Vec<RowRecord> {
        let mut rows: Vec<RowRecord> = self.lock().rows.values().cloned().collect();
        rows.sort_by(|a, b| (a.rank, &a.id).cmp(&(b.rank, &b.id)));
        rows
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.lock().log.clone()
    }

    pub fn calls(&self) -> Vec<PersistenceCall> {
        self.lock().calls.clone()
    }

    /// Calls other than snapshot fetches.
    pub fn writes(&self) -> Vec<PersistenceCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, PersistenceCall::FetchRows))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn subscription_count(&self, table: &str) -> usize {
        self.lock().subscriptions.get(table).copied().unwrap_or(0)
    }

    // =========================================================================
    // Behaviour switches
    // =========================================================================

    /// Queue the behaviour of upcoming writes, in call order.
    pub fn script(&self, write: ScriptedWrite) {
        self.lock().script.push_back(write);
    }

    pub fn fail_next(&self, count: usize, message: &str) {
        for _ in 0..count {
            self.script(ScriptedWrite::fail(message));
        }
    }

    /// Hold every write until `resume_writes`.
    pub fn pause_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Whether successful writes echo a change event on the feed.
    pub fn set_echo(&self, echo: bool) {
        self.lock().echo_writes = echo;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.lock().fail_fetches = fail;
    }

    pub fn fail_catalog(&self, catalog: &str) {
        self.lock().failing_catalogs.insert(CatalogId::from(catalog));
    }

    pub fn restore_catalog(&self, catalog: &str) {
        self.lock().failing_catalogs.remove(catalog);
    }

    /// Refuse the next `count` subscribe calls.
    pub fn refuse_subscriptions(&self, count: u32) {
        self.lock().refused_subscriptions = count;
    }

    // =========================================================================
    // Simulated remote activity
    // =========================================================================

    /// Push an event to every live subscription.
    pub fn emit(&self, event: ChangeEvent) {
        let _ = self.feed.send(FeedMessage::Event(event));
    }

    /// Another client changed a field.
    pub fn remote_update(&self, row_id: &str, column: &str, value: impl Into<Value>) {
        let value = value.into();
        let table = {
            let mut state = self.lock();
            let rank_field = state.schema.rank_field.clone();
            if let Some(row) = state.rows.get_mut(row_id) {
                if column == rank_field.as_str() {
                    if let Some(rank) = value.as_i64() {
                        row.rank = rank;
                    }
                } else {
                    row.fields.insert(ColumnId::from(column), value.clone());
                }
            }
            state.schema.table.clone()
        };
        self.emit(ChangeEvent::update(table, row_id).with_field(column, value));
    }

    /// Another client deleted a row.
    pub fn remote_delete(&self, row_id: &str) {
        let table = {
            let mut state = self.lock();
            state.rows.remove(row_id);
            state.schema.table.clone()
        };
        self.emit(ChangeEvent::delete(table, row_id));
    }

    /// Another client created a row.
    pub fn remote_insert(&self, record: RowRecord) {
        let event = {
            let mut state = self.lock();
            let event = row_event(&state.schema, &record, ChangeOrigin::Remote);
            state.rows.insert(record.id.clone(), record);
            event
        };
        self.emit(event);
    }

    /// Break every live subscription.
    pub fn disrupt_feed(&self, reason: &str) {
        let _ = self.feed.send(FeedMessage::Disrupt(reason.to_string()));
    }

    // =========================================================================
    // Write plumbing
    // =========================================================================

    /// Record the call and take its scripted behaviour, in call order.
    fn begin_write(&self, call: PersistenceCall) -> ScriptedWrite {
        let mut state = self.lock();
        debug!("[MemoryGridBackend] {:?}", call);
        state.calls.push(call);
        state.script.pop_front().unwrap_or_default()
    }

    async fn settle(&self, operation: &str, write: ScriptedWrite) -> Result<()> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if !write.delay.is_zero() {
            tokio::time::sleep(write.delay).await;
        }
        match write.failure {
            Some(message) => Err(GridError::persistence(operation, message)),
            None => Ok(()),
        }
    }

    fn echo(&self, event: ChangeEvent) {
        if self.lock().echo_writes {
            self.emit(event);
        }
    }
}

fn row_event(schema: &GridSchema, record: &RowRecord, origin: ChangeOrigin) -> ChangeEvent {
    let mut event = ChangeEvent::insert(schema.table.clone(), record.id.clone())
        .with_field(schema.rank_field.clone(), record.rank)
        .with_origin(origin);
    for (field, value) in &record.fields {
        event = event.with_field(field.clone(), value.clone());
    }
    event
}

#[async_trait]
impl GridPersistence for MemoryGridBackend {
    async fn update_field(
        &self,
        row_id: &RowId,
        column: &ColumnId,
        value: Value,
        origin: ChangeOrigin,
    ) -> Result<RowRecord> {
        let write = self.begin_write(PersistenceCall::UpdateField {
            row_id: row_id.clone(),
            column: column.clone(),
            value: value.clone(),
        });
        self.settle("update_field", write).await?;

        let (record, table) = {
            let mut state = self.lock();
            let table = state.schema.table.clone();
            let row = state
                .rows
                .get_mut(row_id)
                .ok_or_else(|| GridError::RowNotFound {
                    id: row_id.to_string(),
                })?;
            row.fields.insert(column.clone(), value.clone());
            (row.clone(), table)
        };
        self.echo(
            ChangeEvent::update(table, row_id.clone())
                .with_field(column.clone(), value)
                .with_origin(origin),
        );
        Ok(record)
    }

    async fn insert_row(&self, fields: Fields, rank: i64, origin: ChangeOrigin) -> Result<RowRecord> {
        let write = self.begin_write(PersistenceCall::InsertRow { rank });
        self.settle("insert_row", write).await?;

        let event = {
            let mut state = self.lock();
            let id = RowId::new(format!("srv-{}", state.next_row_id));
            state.next_row_id += 1;
            let record = RowRecord { id, rank, fields };
            let event = row_event(&state.schema, &record, origin);
            state.rows.insert(record.id.clone(), record);
            event
        };
        let record = self.row(event.row_id.as_str()).ok_or_else(|| GridError::RowNotFound {
            id: event.row_id.to_string(),
        })?;
        self.echo(event);
        Ok(record)
    }

    async fn delete_row(&self, row_id: &RowId, origin: ChangeOrigin) -> Result<()> {
        let write = self.begin_write(PersistenceCall::DeleteRow {
            row_id: row_id.clone(),
        });
        self.settle("delete_row", write).await?;

        let table = {
            let mut state = self.lock();
            if state.rows.remove(row_id).is_none() {
                return Err(GridError::RowNotFound {
                    id: row_id.to_string(),
                });
            }
            state.schema.table.clone()
        };
        self.echo(ChangeEvent::delete(table, row_id.clone()).with_origin(origin));
        Ok(())
    }

    async fn update_ranks(&self, ranks: Vec<RankUpdate>, origin: ChangeOrigin) -> Result<()> {
        let write = self.begin_write(PersistenceCall::UpdateRanks {
            ranks: ranks.clone(),
        });
        self.settle("update_ranks", write).await?;

        let events: Vec<ChangeEvent> = {
            let mut state = self.lock();
            let table = state.schema.table.clone();
            let rank_field = state.schema.rank_field.clone();
            let mut events = Vec::new();
            for update in &ranks {
                if let Some(row) = state.rows.get_mut(&update.row_id) {
                    row.rank = update.rank;
                    events.push(
                        ChangeEvent::update(table.clone(), update.row_id.clone())
                            .with_field(rank_field.clone(), update.rank)
                            .with_origin(origin.clone()),
                    );
                }
            }
            events
        };
        for event in events {
            self.echo(event);
        }
        Ok(())
    }

    async fn append_log_entry(
        &self,
        row_id: &RowId,
        content: String,
        origin: ChangeOrigin,
    ) -> Result<LogEntry> {
        let write = self.begin_write(PersistenceCall::AppendLogEntry {
            row_id: row_id.clone(),
            content: content.clone(),
        });
        self.settle("append_log_entry", write).await?;

        let (entry, event) = {
            let mut state = self.lock();
            let spec = state.schema.log.clone().ok_or_else(|| {
                GridError::persistence("append_log_entry", "schema has no log table")
            })?;
            let entry = LogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                row_id: row_id.clone(),
                content,
                created_at: Utc::now(),
            };
            let event = ChangeEvent::insert(spec.table, entry.id.clone())
                .with_field(spec.row_field, row_id.as_str())
                .with_field(spec.content_field, entry.content.clone())
                .with_field(spec.created_at_field, Value::from_datetime(entry.created_at))
                .with_origin(origin)
                .at(entry.created_at);
            state.log.push(entry.clone());
            (entry, event)
        };
        self.echo(event);
        Ok(entry)
    }

    async fn fetch_rows(&self) -> Result<Vec<RowRecord>> {
        let fail = {
            let mut state = self.lock();
            state.calls.push(PersistenceCall::FetchRows);
            state.fail_fetches
        };
        if fail {
            return Err(GridError::persistence("fetch_rows", "backend unavailable"));
        }
        Ok(self.rows())
    }

    async fn fetch_log_entries(&self) -> Result<Vec<LogEntry>> {
        if self.lock().fail_fetches {
            return Err(GridError::persistence(
                "fetch_log_entries",
                "backend unavailable",
            ));
        }
        Ok(self.log_entries())
    }
}

#[async_trait]
impl CatalogSource for MemoryGridBackend {
    async fn list_catalog(&self, catalog: &CatalogId) -> Result<Vec<CatalogEntry>> {
        let state = self.lock();
        if state.failing_catalogs.contains(catalog) {
            return Err(GridError::CatalogLoadFailure {
                catalog: catalog.to_string(),
                message: "catalog service unavailable".to_string(),
            });
        }
        Ok(state.catalogs.get(catalog).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ChangeFeedClient for MemoryGridBackend {
    async fn subscribe(&self, table: &str) -> Result<ChangeStream> {
        {
            let mut state = self.lock();
            *state.subscriptions.entry(table.to_string()).or_insert(0) += 1;
            if state.refused_subscriptions > 0 {
                state.refused_subscriptions -= 1;
                return Err(GridError::subscription(table, "connection refused"));
            }
        }

        let rx = self.feed.subscribe();
        let table = table.to_string();
        let stream = futures::stream::unfold((rx, table), |(mut rx, table)| async move {
            loop {
                match rx.recv().await {
                    Ok(FeedMessage::Event(event)) if event.table == table => {
                        return Some((Ok(event), (rx, table)));
                    }
                    Ok(FeedMessage::Event(_)) => continue,
                    Ok(FeedMessage::Disrupt(reason)) => {
                        let error = GridError::subscription(table.clone(), reason);
                        return Some((Err(error), (rx, table)));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let error =
                            GridError::subscription(table.clone(), format!("lagged by {} events", n));
                        return Some((Err(error), (rx, table)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn backend() -> MemoryGridBackend {
        let backend = MemoryGridBackend::new(&GridSchema::cases());
        backend.seed_row(RowRecord::new("1", 0).with_field("title", "First"));
        backend
    }

    #[tokio::test]
    async fn test_write_echoes_with_origin() {
        let backend = backend();
        let mut stream = backend.subscribe("cases").await.unwrap();
        let origin = ChangeOrigin::Local {
            operation_id: Some("op".into()),
            trace_id: Some("trace".into()),
        };
        backend
            .update_field(&RowId::from("1"), &ColumnId::from("title"), "Changed".into(), origin.clone())
            .await
            .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.origin, origin);
        assert_eq!(event.payload.get("title"), Some(&Value::from("Changed")));
    }

    #[tokio::test]
    async fn test_scripted_failure_leaves_row_untouched() {
        let backend = backend();
        backend.fail_next(1, "boom");
        let result = backend
            .update_field(
                &RowId::from("1"),
                &ColumnId::from("title"),
                "Nope".into(),
                ChangeOrigin::Remote,
            )
            .await;
        assert!(matches!(result, Err(GridError::PersistenceFailure { .. })));
        assert_eq!(
            backend.row("1").unwrap().fields.get("title"),
            Some(&Value::from("First"))
        );
    }

    #[tokio::test]
    async fn test_feed_filters_by_table_and_reports_disruption() {
        let backend = backend();
        let mut stream = backend.subscribe("case_updates").await.unwrap();
        backend.remote_update("1", "title", "Elsewhere");
        backend.emit(ChangeEvent::insert("case_updates", "u1").with_field("case_id", "1"));
        backend.disrupt_feed("socket closed");

        assert_eq!(stream.next().await.unwrap().unwrap().row_id.as_str(), "u1");
        assert!(stream.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_refused_subscriptions_are_counted() {
        let backend = backend();
        backend.refuse_subscriptions(1);
        assert!(backend.subscribe("cases").await.is_err());
        assert!(backend.subscribe("cases").await.is_ok());
        assert_eq!(backend.subscription_count("cases"), 2);
    }
}

//! Collaborator traits
//!
//! The engine never talks to a network or database directly. Everything it
//! needs from the outside world goes through these three traits so tests can
//! substitute in-memory fakes.

use async_trait::async_trait;

use gridsync_api::{
    CatalogEntry, CatalogId, ChangeOrigin, ChangeStream, ColumnId, Fields, GridError, LogEntry,
    RankUpdate, RowId, RowRecord, Value,
};

pub type Result<T> = std::result::Result<T, GridError>;

/// Persistence API of the table behind one grid.
///
/// Every write is individually awaited by the engine so its outcome can drive
/// rollback. Writes carry the `ChangeOrigin` of the edit that caused them;
/// backends that echo changes should tag the echo with it.
#[async_trait]
pub trait GridPersistence: Send + Sync {
    /// Persist a single field. Returns the row as stored after the write.
    async fn update_field(
        &self,
        row_id: &RowId,
        column: &ColumnId,
        value: Value,
        origin: ChangeOrigin,
    ) -> Result<RowRecord>;

    /// Create a row from the given initial fields and rank.
    async fn insert_row(&self, fields: Fields, rank: i64, origin: ChangeOrigin)
        -> Result<RowRecord>;

    async fn delete_row(&self, row_id: &RowId, origin: ChangeOrigin) -> Result<()>;

    async fn update_ranks(&self, ranks: Vec<RankUpdate>, origin: ChangeOrigin) -> Result<()>;

    /// Append an entry to the row's log table.
    async fn append_log_entry(
        &self,
        row_id: &RowId,
        content: String,
        origin: ChangeOrigin,
    ) -> Result<LogEntry>;

    /// Full snapshot of the table, used at mount and for resync.
    async fn fetch_rows(&self) -> Result<Vec<RowRecord>>;

    /// Full snapshot of the log table. Backends without a log table return
    /// an empty list.
    async fn fetch_log_entries(&self) -> Result<Vec<LogEntry>> {
        Ok(Vec::new())
    }
}

/// Loader for the small reference tables behind select columns.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_catalog(&self, catalog: &CatalogId) -> Result<Vec<CatalogEntry>>;
}

/// Push-based change feed.
///
/// The caller owns connection setup and auth; the engine only consumes the
/// per-table event streams. Dropping the stream unsubscribes.
#[async_trait]
pub trait ChangeFeedClient: Send + Sync {
    async fn subscribe(&self, table: &str) -> Result<ChangeStream>;
}

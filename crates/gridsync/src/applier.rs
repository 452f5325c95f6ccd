//! Optimistic mutation applier
//!
//! Applies user edits to the store immediately, then awaits the persistence
//! call and either confirms or rolls back. Every call is individually awaited
//! so its outcome can drive rollback; the UI does not wait on it (see
//! `GridEngine::spawn_commit`).

use std::sync::Arc;

use tracing::{debug, info, warn, Instrument};

use gridsync_api::{
    ChangeOrigin, ColumnId, Fields, GridError, RowId, RowRecord, TraceContext, Value,
};
use gridsync_core::{GridPersistence, Result};

use crate::store::{GridNotice, GridStore, PendingMutation, Resolution};

/// What happened to a committed edit once its persistence call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Persisted, and the store now shows the confirmed value
    Confirmed,
    /// A newer edit to the same cell took over; this result was not applied
    Superseded,
    /// The row was deleted or the grid unmounted while in flight
    Abandoned,
}

impl From<Resolution> for CommitOutcome {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Resolved => CommitOutcome::Confirmed,
            Resolution::Superseded => CommitOutcome::Superseded,
            Resolution::Stale => CommitOutcome::Abandoned,
        }
    }
}

fn origin_for(trace: Option<&TraceContext>) -> ChangeOrigin {
    match trace {
        Some(ctx) => ChangeOrigin::local_from_trace_context(ctx),
        None => ChangeOrigin::local_with_current_span(),
    }
}

/// An edit already visible in the store, waiting for its persistence call.
#[derive(Debug)]
pub struct StagedEdit {
    mutation: PendingMutation,
    log_content: Option<String>,
    span: tracing::Span,
}

impl StagedEdit {
    pub fn mutation(&self) -> &PendingMutation {
        &self.mutation
    }
}

pub struct MutationApplier {
    store: Arc<GridStore>,
    persistence: Arc<dyn GridPersistence>,
}

impl MutationApplier {
    pub fn new(store: Arc<GridStore>, persistence: Arc<dyn GridPersistence>) -> Self {
        Self { store, persistence }
    }

    /// Commit a raw value to one cell.
    ///
    /// A failure that is still the newest edit for the cell is rolled back,
    /// published as a notice and returned as `Err`.
    pub async fn commit_edit(
        &self,
        row_id: &RowId,
        column_id: &ColumnId,
        value: Value,
    ) -> Result<CommitOutcome> {
        let staged = self.stage_edit(row_id, column_id, value)?;
        self.persist(staged).await
    }

    /// Validate an edit and apply it to the store right away.
    ///
    /// The returned edit still has to be handed to `persist`.
    pub fn stage_edit(&self, row_id: &RowId, column_id: &ColumnId, value: Value) -> Result<StagedEdit> {
        let column = self.store.schema().require_column(column_id.as_str())?;
        if !column.is_editable() {
            return Err(GridError::ReadOnlyColumn {
                column: column_id.to_string(),
            });
        }
        if row_id.is_local() {
            return Err(GridError::EditSession {
                message: format!("row {} is still being created", row_id),
            });
        }
        let log_content = if column.is_latest_log() {
            match value.as_string().map(str::trim) {
                Some(content) if !content.is_empty() => Some(content.to_string()),
                _ => {
                    return Err(GridError::InvalidValue {
                        column: column_id.to_string(),
                        message: "a log entry needs content".to_string(),
                    })
                }
            }
        } else {
            None
        };

        let span = tracing::span!(
            tracing::Level::INFO,
            "grid.commit_edit",
            "row_id" = %row_id,
            "column" = %column_id
        );
        let trace = span.in_scope(TraceContext::from_current_span);
        let mutation = self
            .store
            .apply_local_edit(row_id, column_id, value, trace)?;
        debug!(
            "[MutationApplier] Edit {} applied locally on {}/{}",
            mutation.request_id, row_id, column_id
        );
        Ok(StagedEdit {
            mutation,
            log_content,
            span,
        })
    }

    /// Persist a staged edit and settle it in the store.
    pub async fn persist(&self, staged: StagedEdit) -> Result<CommitOutcome> {
        let StagedEdit {
            mutation,
            log_content,
            span,
        } = staged;

        async {
            let origin = origin_for(mutation.trace.as_ref());
            let operation = if log_content.is_some() {
                "append_log_entry"
            } else {
                "update_field"
            };
            let result = match log_content {
                Some(content) => self
                    .persistence
                    .append_log_entry(&mutation.row_id, content, origin)
                    .await
                    .map(|entry| {
                        self.store.record_log_entry(entry);
                        None
                    }),
                None => self
                    .persistence
                    .update_field(
                        &mutation.row_id,
                        &mutation.column,
                        mutation.new_value.clone(),
                        origin,
                    )
                    .await
                    .map(|record| record.fields.get(&mutation.column).cloned()),
            };

            match result {
                Ok(confirmed) => {
                    let outcome =
                        CommitOutcome::from(self.store.resolve_success(&mutation, confirmed));
                    debug!(
                        "[MutationApplier] Edit {} persisted: {:?}",
                        mutation.request_id, outcome
                    );
                    Ok(outcome)
                }
                Err(e) => self.handle_failure(&mutation, operation, e),
            }
        }
        .instrument(span)
        .await
    }

    fn handle_failure(
        &self,
        mutation: &PendingMutation,
        operation: &str,
        error: GridError,
    ) -> Result<CommitOutcome> {
        warn!(
            "[MutationApplier] Edit {} on {}/{} failed: {}",
            mutation.request_id, mutation.row_id, mutation.column, error
        );
        match self.store.resolve_failure(mutation) {
            Resolution::Resolved => {
                self.store.notify(GridNotice::PersistenceFailed {
                    operation: operation.to_string(),
                    row_id: Some(mutation.row_id.clone()),
                    message: error.to_string(),
                });
                Err(error)
            }
            other => Ok(other.into()),
        }
    }

    /// Append a row optimistically under a temporary id.
    ///
    /// Returns the server id. On failure the temporary row is removed again.
    pub async fn insert_row(&self, fields: Fields) -> Result<RowId> {
        if self.store.is_closed() {
            return Err(GridError::Closed);
        }
        let local_id = RowId::new_local();
        let rank = self.store.next_rank();
        self.store.insert_row(RowRecord {
            id: local_id.clone(),
            rank,
            fields: fields.clone(),
        });

        let span = tracing::span!(tracing::Level::INFO, "grid.insert_row", "row_id" = %local_id);
        async {
            let origin = ChangeOrigin::local_with_current_span();
            match self.persistence.insert_row(fields, rank, origin).await {
                Ok(record) => {
                    let id = record.id.clone();
                    info!("[MutationApplier] Row {} created as {}", local_id, id);
                    self.store.replace_local_row(&local_id, record);
                    Ok(id)
                }
                Err(e) => {
                    warn!("[MutationApplier] Insert of {} failed: {}", local_id, e);
                    self.store.remove_row(&local_id);
                    self.store.notify(GridNotice::PersistenceFailed {
                        operation: "insert_row".to_string(),
                        row_id: None,
                        message: e.to_string(),
                    });
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Remove a row optimistically; restores it if the delete is rejected.
    pub async fn delete_row(&self, row_id: &RowId) -> Result<()> {
        if row_id.is_local() {
            return Err(GridError::EditSession {
                message: format!("row {} is still being created", row_id),
            });
        }
        let snapshot = self
            .store
            .remove_row(row_id)
            .ok_or_else(|| GridError::RowNotFound {
                id: row_id.to_string(),
            })?;

        let span = tracing::span!(tracing::Level::INFO, "grid.delete_row", "row_id" = %row_id);
        async {
            let origin = ChangeOrigin::local_with_current_span();
            match self.persistence.delete_row(row_id, origin).await {
                Ok(()) => {
                    info!("[MutationApplier] Row {} deleted", row_id);
                    Ok(())
                }
                Err(e) => {
                    warn!("[MutationApplier] Delete of {} failed: {}", row_id, e);
                    if self.store.restore_row(snapshot) {
                        self.store.notify(GridNotice::PersistenceFailed {
                            operation: "delete_row".to_string(),
                            row_id: Some(row_id.clone()),
                            message: e.to_string(),
                        });
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

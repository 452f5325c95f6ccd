//! Grid engine facade
//!
//! `GridEngine` is what a rendering layer mounts: it wires the catalog
//! resolver, the store, the mutation applier, the reorder engine, the
//! change-feed reconciler and the cell edit session together for one grid.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use gridsync_api::{CatalogId, Fields, GridError, RowId};
use gridsync_core::codec::{self, CellValue, DisplayCell};
use gridsync_core::{
    CatalogSource, ChangeFeedClient, Column, ColumnKind, GridPersistence, GridSchema, Result,
};

use crate::applier::{CommitOutcome, MutationApplier};
use crate::catalog::CatalogResolver;
use crate::config::GridConfig;
use crate::edit_session::{
    BelowAnchor, CellRef, CommitRequest, EditSession, EditState, OverlayAnchor, OverlayPlacement,
    SelectOverlay,
};
use crate::reconciler::{ChangeFeedReconciler, SubscriptionState};
use crate::reorder::{ReorderEngine, ReorderOutcome};
use crate::store::{GridNotice, GridStore, Row, StoreEvent};

/// The outside world a grid talks to.
#[derive(Clone)]
pub struct GridCollaborators {
    pub persistence: Arc<dyn GridPersistence>,
    pub catalogs: Arc<dyn CatalogSource>,
    pub feed: Arc<dyn ChangeFeedClient>,
}

impl GridCollaborators {
    /// Use one backend for persistence, catalogs and the change feed.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: GridPersistence + CatalogSource + ChangeFeedClient + 'static,
    {
        Self {
            persistence: backend.clone(),
            catalogs: backend.clone(),
            feed: backend,
        }
    }
}

/// Pending commit started by the edit session or `spawn_commit`.
pub type CommitHandle = JoinHandle<Result<CommitOutcome>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct GridEngine {
    schema: Arc<GridSchema>,
    config: GridConfig,
    collaborators: GridCollaborators,
    store: Arc<GridStore>,
    catalogs: Arc<CatalogResolver>,
    applier: Arc<MutationApplier>,
    reorder: ReorderEngine,
    reconciler: Mutex<Option<ChangeFeedReconciler>>,
    session: Arc<Mutex<EditSession>>,
    placement: Box<dyn OverlayPlacement>,
    in_flight: Mutex<Vec<AbortHandle>>,
}

impl GridEngine {
    /// Mount a grid: load catalogs, subscribe to the change feed, then fetch
    /// the initial snapshot.
    ///
    /// Subscribing before fetching means no change is lost between the two;
    /// an event for a row the snapshot already holds reconciles by id. Neither
    /// a catalog nor a snapshot failure aborts the mount, both are published
    /// as notices.
    pub async fn mount(schema: GridSchema, config: GridConfig, collaborators: GridCollaborators) -> Self {
        let schema = Arc::new(schema);
        let store = Arc::new(GridStore::new(schema.clone(), config.notification_capacity));

        let catalogs = Arc::new(CatalogResolver::new());
        let failed = catalogs
            .load(collaborators.catalogs.as_ref(), &schema.catalog_ids())
            .await;
        for catalog in failed {
            store.notify(GridNotice::CatalogUnavailable { catalog });
        }

        let reconciler =
            ChangeFeedReconciler::start(store.clone(), collaborators.feed.clone(), &config);

        let engine = Self {
            applier: Arc::new(MutationApplier::new(
                store.clone(),
                collaborators.persistence.clone(),
            )),
            reorder: ReorderEngine::new(store.clone(), collaborators.persistence.clone()),
            reconciler: Mutex::new(Some(reconciler)),
            session: Arc::new(Mutex::new(EditSession::new())),
            placement: Box::new(BelowAnchor::default()),
            in_flight: Mutex::new(Vec::new()),
            schema,
            config,
            collaborators,
            store,
            catalogs,
        };

        if let Err(e) = engine.resync().await {
            warn!("[GridEngine] Initial fetch of {} failed: {}", engine.schema.table, e);
        }
        info!(
            "[GridEngine] Mounted {} ({} rows)",
            engine.schema.table,
            engine.store.len()
        );
        engine
    }

    pub fn with_placement(mut self, placement: Box<dyn OverlayPlacement>) -> Self {
        self.placement = placement;
        self
    }

    pub fn schema(&self) -> &GridSchema {
        &self.schema
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<GridStore> {
        &self.store
    }

    pub fn catalogs(&self) -> &CatalogResolver {
        &self.catalogs
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Rows in display order.
    pub fn rows(&self) -> Vec<Row> {
        self.store.rows()
    }

    pub fn row(&self, row_id: &RowId) -> Option<Row> {
        self.store.row(row_id)
    }

    /// Re-render signals and notices.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    fn row_or_err(&self, row_id: &RowId) -> Result<Row> {
        self.store.row(row_id).ok_or_else(|| GridError::RowNotFound {
            id: row_id.to_string(),
        })
    }

    /// Typed value of one cell.
    pub fn cell(&self, row_id: &RowId, column: &str) -> Result<CellValue> {
        let column = self.schema.require_column(column)?;
        let row = self.row_or_err(row_id)?;
        codec::decode(column, codec::raw_value(column, &row.fields))
    }

    /// Display text and color of one cell.
    pub fn display(&self, row_id: &RowId, column: &str) -> Result<DisplayCell> {
        let column = self.schema.require_column(column)?;
        let row = self.row_or_err(row_id)?;
        Ok(codec::display(column, &row.fields, &self.catalogs.snapshot()))
    }

    /// Read-only columns: foreign-key labels, and select columns whose
    /// catalog is not loaded.
    pub fn is_read_only(&self, column: &Column) -> bool {
        if !column.is_editable() {
            return true;
        }
        match &column.kind {
            ColumnKind::Select { catalog } => !self.catalogs.is_available(catalog),
            _ => false,
        }
    }

    fn editable_column(&self, column: &str) -> Result<&Column> {
        let column = self.schema.require_column(column)?;
        if self.is_read_only(column) {
            return Err(GridError::ReadOnlyColumn {
                column: column.id.to_string(),
            });
        }
        Ok(column)
    }

    // =========================================================================
    // Edits
    // =========================================================================

    /// Commit a typed value and wait for its persistence call.
    pub async fn commit_edit(&self, row_id: &RowId, column: &str, cell: CellValue) -> Result<CommitOutcome> {
        let column = self.editable_column(column)?;
        let value = codec::encode(column, &cell)?;
        self.applier.commit_edit(row_id, &column.id, value).await
    }

    /// Commit user-typed text (option labels are accepted for select columns).
    pub async fn commit_text(&self, row_id: &RowId, column: &str, text: &str) -> Result<CommitOutcome> {
        let parsed = {
            let column = self.editable_column(column)?;
            codec::parse_input(column, text, &self.catalogs.snapshot())?
        };
        self.commit_edit(row_id, column, parsed).await
    }

    /// Apply an edit now and persist it in the background.
    pub fn spawn_commit(&self, row_id: &RowId, column: &str, cell: CellValue) -> Result<CommitHandle> {
        self.spawn_request(CommitRequest {
            cell: CellRef::new(row_id.clone(), column),
            value: cell,
        })
    }

    fn spawn_request(&self, request: CommitRequest) -> Result<CommitHandle> {
        let staged = self
            .editable_column(request.cell.column.as_str())
            .and_then(|column| {
                let value = codec::encode(column, &request.value)?;
                self.applier
                    .stage_edit(&request.cell.row_id, &column.id, value)
            });
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                lock(&self.session).finish(&request.cell);
                return Err(e);
            }
        };

        let applier = self.applier.clone();
        let session = self.session.clone();
        let cell = request.cell;
        let handle = tokio::spawn(async move {
            let result = applier.persist(staged).await;
            lock(&session).finish(&cell);
            result
        });

        let mut in_flight = lock(&self.in_flight);
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle.abort_handle());
        Ok(handle)
    }

    // =========================================================================
    // Cell edit session
    // =========================================================================

    /// Activate a cell for editing. Select cells open an overlay with the
    /// catalog options, placed relative to `anchor` when given.
    ///
    /// If another cell was being edited it is committed; its handle is
    /// returned.
    pub fn begin_edit(
        &self,
        row_id: &RowId,
        column: &str,
        anchor: Option<OverlayAnchor>,
    ) -> Result<Option<CommitHandle>> {
        let column = self.editable_column(column)?;
        let current = self.cell(row_id, column.id.as_str())?;
        let overlay = match &column.kind {
            ColumnKind::Select { catalog } => Some(
                SelectOverlay::new(self.catalogs.options(catalog)).placed(self.placement.as_ref(), anchor),
            ),
            _ => None,
        };
        let cell = CellRef::new(row_id.clone(), column.id.clone());
        let blurred = lock(&self.session).begin(cell, current, overlay);
        blurred.map(|request| self.spawn_request(request)).transpose()
    }

    pub fn update_draft(&self, value: CellValue) -> Result<()> {
        lock(&self.session).set_draft(value)
    }

    /// Replace the draft from typed text, parsed for the edited column.
    pub fn update_draft_text(&self, text: &str) -> Result<()> {
        let mut session = lock(&self.session);
        let column = match session.editing_cell() {
            Some(cell) => self.schema.require_column(cell.column.as_str())?,
            None => {
                return Err(GridError::EditSession {
                    message: "no cell is being edited".to_string(),
                })
            }
        };
        let value = codec::parse_input(column, text, &self.catalogs.snapshot())?;
        session.set_draft(value)
    }

    /// Pick an option in the open select overlay; commits right away.
    pub fn choose_option(&self, id: Option<i64>) -> Result<CommitHandle> {
        let request = lock(&self.session).choose_option(id)?;
        self.spawn_request(request)
    }

    /// Blur or Enter on the edited cell. `None` when the value is unchanged.
    pub fn commit_active_edit(&self) -> Result<Option<CommitHandle>> {
        let request = lock(&self.session).commit()?;
        request.map(|request| self.spawn_request(request)).transpose()
    }

    /// Escape on the edited cell. Returns the value the cell shows again.
    pub fn cancel_edit(&self) -> Result<CellValue> {
        let mut session = lock(&self.session);
        let cell = session.editing_cell().cloned();
        let snapshot = session.cancel()?;
        if let Some(cell) = cell {
            session.finish(&cell);
        }
        Ok(snapshot)
    }

    pub fn edit_state(&self) -> EditState {
        lock(&self.session).state().clone()
    }

    // =========================================================================
    // Rows and order
    // =========================================================================

    pub async fn insert_row(&self, fields: Fields) -> Result<RowId> {
        self.applier.insert_row(fields).await
    }

    pub async fn delete_row(&self, row_id: &RowId) -> Result<()> {
        self.applier.delete_row(row_id).await
    }

    pub async fn move_row(&self, row_id: &RowId, from_index: usize, to_index: usize) -> Result<ReorderOutcome> {
        self.reorder.move_row(row_id, from_index, to_index).await
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Refetch the whole table. Dirty cells keep their local values.
    pub async fn resync(&self) -> Result<()> {
        let fetched = async {
            let rows = self.collaborators.persistence.fetch_rows().await?;
            let log_entries = match self.schema.log {
                Some(_) => self.collaborators.persistence.fetch_log_entries().await?,
                None => Vec::new(),
            };
            Ok::<_, GridError>((rows, log_entries))
        }
        .await;

        match fetched {
            Ok((rows, log_entries)) => {
                self.store.load(rows, log_entries);
                Ok(())
            }
            Err(e) => {
                self.store.notify(GridNotice::PersistenceFailed {
                    operation: "fetch_rows".to_string(),
                    row_id: None,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn unavailable_catalogs(&self) -> Vec<CatalogId> {
        self.catalogs.failed()
    }

    /// One retry pass over the failed catalogs. Returns the recovered ones.
    pub async fn retry_failed_catalogs(&self) -> Vec<CatalogId> {
        let restored = self
            .catalogs
            .retry_failed(self.collaborators.catalogs.as_ref())
            .await;
        for catalog in &restored {
            info!("[GridEngine] Catalog {} available again", catalog);
            self.store.notify(GridNotice::CatalogRestored {
                catalog: catalog.clone(),
            });
            if self.store.is_closed() {
                break;
            }
        }
        restored
    }

    /// Retry failed catalogs up to `attempts` times, waiting the configured
    /// backoff between passes. Returns whether every catalog is loaded.
    pub async fn retry_catalogs_until_available(&self, attempts: u32) -> bool {
        for attempt in 0..attempts {
            if self.catalogs.failed().is_empty() || self.store.is_closed() {
                break;
            }
            if attempt > 0 {
                tokio::time::sleep(self.config.catalog_retry_backoff()).await;
            }
            self.retry_failed_catalogs().await;
        }
        self.catalogs.failed().is_empty()
    }

    pub fn subscription_state(&self, table: &str) -> Option<SubscriptionState> {
        lock(&self.reconciler).as_ref().and_then(|r| r.state(table))
    }

    pub fn watch_subscription(&self, table: &str) -> Option<watch::Receiver<SubscriptionState>> {
        lock(&self.reconciler)
            .as_ref()
            .and_then(|r| r.watch_state(table))
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tear the grid down without waiting on anything in flight.
    ///
    /// Subscriptions are dropped, in-flight persistence tasks are abandoned
    /// and the store stops accepting mutations. Idempotent.
    pub fn unmount(&self) {
        if self.store.is_closed() {
            return;
        }
        self.store.close();
        if let Some(mut reconciler) = lock(&self.reconciler).take() {
            reconciler.shutdown();
        }
        for handle in lock(&self.in_flight).drain(..) {
            handle.abort();
        }
        info!("[GridEngine] Unmounted {}", self.schema.table);
    }

    pub fn is_mounted(&self) -> bool {
        !self.store.is_closed()
    }
}

impl Drop for GridEngine {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl std::fmt::Debug for GridEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridEngine")
            .field("table", &self.schema.table)
            .field("rows", &self.store.len())
            .field("mounted", &self.is_mounted())
            .finish()
    }
}


//! Reorder engine
//!
//! A drag re-ranks every visible row to its position (0..n-1) and persists
//! the rows whose rank changed, one write per row, in order. Any failed write
//! rolls the whole drag back locally. Rank changes made by other clients are
//! adopted by the store's re-sort and never trigger a write from here.
//!
//! Rows whose insert is still in flight (`local:` ids) are unknown to the
//! server. They cannot be dragged and keep their rank while others move.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn, Instrument};

use gridsync_api::{ChangeOrigin, GridError, RowId};
use gridsync_core::rank::{changed_ranks, contiguous_ranks, move_index};
use gridsync_core::{GridPersistence, Result};

use crate::store::{GridNotice, GridStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderOutcome {
    Unchanged,
    Reordered { writes: usize },
}

pub struct ReorderEngine {
    store: Arc<GridStore>,
    persistence: Arc<dyn GridPersistence>,
    /// Drags are persisted one at a time
    drag_lock: Mutex<()>,
}

impl ReorderEngine {
    pub fn new(store: Arc<GridStore>, persistence: Arc<dyn GridPersistence>) -> Self {
        Self {
            store,
            persistence,
            drag_lock: Mutex::new(()),
        }
    }

    /// Move `row_id` from `from_index` to `to_index` in display order.
    ///
    /// `from_index` is a hint from the gesture layer; when it no longer
    /// points at the row (a remote reorder landed mid-gesture) the row's
    /// actual position is used.
    pub async fn move_row(
        &self,
        row_id: &RowId,
        from_index: usize,
        to_index: usize,
    ) -> Result<ReorderOutcome> {
        let _drag = self.drag_lock.lock().await;
        if self.store.is_closed() {
            return Err(GridError::Closed);
        }
        if row_id.is_local() {
            return Err(GridError::InvalidMove {
                message: format!("row {} is still being created", row_id),
            });
        }

        let mut order = self.store.order();
        let actual = order
            .iter()
            .position(|id| id == row_id)
            .ok_or_else(|| GridError::RowNotFound {
                id: row_id.to_string(),
            })?;
        if actual != from_index {
            warn!(
                "[ReorderEngine] Row {} is at {} not {}, using its current position",
                row_id, actual, from_index
            );
        }
        move_index(&mut order, actual, to_index)?;
        order.retain(|id| !id.is_local());

        let snapshot = self.store.rank_snapshot();
        let updates = changed_ranks(&snapshot, contiguous_ranks(&order));
        if updates.is_empty() {
            return Ok(ReorderOutcome::Unchanged);
        }
        let touched: Vec<RowId> = updates.iter().map(|u| u.row_id.clone()).collect();
        self.store.apply_ranks(&updates);

        let span = tracing::span!(
            tracing::Level::INFO,
            "grid.move_row",
            "row_id" = %row_id,
            "writes" = updates.len()
        );
        async {
            let origin = ChangeOrigin::local_with_current_span();
            for update in &updates {
                if self.store.is_closed() {
                    return Err(GridError::Closed);
                }
                if let Err(e) = self
                    .persistence
                    .update_ranks(vec![update.clone()], origin.clone())
                    .await
                {
                    warn!(
                        "[ReorderEngine] Rank write for {} failed, rolling back drag: {}",
                        update.row_id, e
                    );
                    self.store.restore_ranks(&snapshot, &touched);
                    self.store.notify(GridNotice::PersistenceFailed {
                        operation: "update_ranks".to_string(),
                        row_id: Some(update.row_id.clone()),
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            }
            self.store.settle_ranks(&touched);
            info!(
                "[ReorderEngine] Moved {} to {} ({} rank writes)",
                row_id,
                to_index,
                updates.len()
            );
            Ok(ReorderOutcome::Reordered {
                writes: updates.len(),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{case_backend, MemoryGridBackend, PersistenceCall, ScriptedWrite};
    use gridsync_api::{RankUpdate, RowRecord};
    use gridsync_core::GridSchema;

    fn id(s: &str) -> RowId {
        RowId::from(s)
    }

    fn setup(rows: Vec<RowRecord>) -> (Arc<GridStore>, Arc<MemoryGridBackend>, ReorderEngine) {
        let store = Arc::new(GridStore::new(Arc::new(GridSchema::cases()), 64));
        let backend = Arc::new(case_backend());
        for row in &rows {
            backend.seed_row(row.clone());
        }
        store.load(rows, vec![]);
        backend.set_echo(false);
        let engine = ReorderEngine::new(store.clone(), backend.clone());
        (store, backend, engine)
    }

    #[tokio::test]
    async fn test_drag_to_front_rewrites_every_rank() {
        let (store, backend, engine) = setup(vec![
            RowRecord::new("B", 0),
            RowRecord::new("C", 1),
            RowRecord::new("A", 2),
        ]);
        let outcome = engine.move_row(&id("A"), 2, 0).await.unwrap();
        assert_eq!(outcome, ReorderOutcome::Reordered { writes: 3 });
        assert_eq!(store.order(), vec![id("A"), id("B"), id("C")]);

        let ranks: Vec<(String, i64)> = store
            .rows()
            .into_iter()
            .map(|r| (r.id.to_string(), r.rank))
            .collect();
        assert_eq!(
            ranks,
            vec![("A".into(), 0), ("B".into(), 1), ("C".into(), 2)]
        );
        assert_eq!(
            backend.writes(),
            vec![
                PersistenceCall::UpdateRanks {
                    ranks: vec![RankUpdate { row_id: id("A"), rank: 0 }]
                },
                PersistenceCall::UpdateRanks {
                    ranks: vec![RankUpdate { row_id: id("B"), rank: 1 }]
                },
                PersistenceCall::UpdateRanks {
                    ranks: vec![RankUpdate { row_id: id("C"), rank: 2 }]
                },
            ]
        );
        assert!(store.rows().iter().all(|r| r.dirty.is_empty()));
    }

    #[tokio::test]
    async fn test_partial_failure_rolls_back_whole_drag() {
        let (store, backend, engine) = setup(vec![
            RowRecord::new("A", 0),
            RowRecord::new("B", 1),
            RowRecord::new("C", 2),
        ]);
        backend.script(ScriptedWrite::ok());
        backend.script(ScriptedWrite::fail("timeout"));

        let result = engine.move_row(&id("C"), 2, 0).await;
        assert!(result.is_err());
        assert_eq!(store.order(), vec![id("A"), id("B"), id("C")]);
        assert_eq!(store.row(&id("C")).unwrap().rank, 2);
        // Sequential writes stop at the failure
        assert_eq!(backend.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_noop_move_writes_nothing() {
        let (_store, backend, engine) = setup(vec![RowRecord::new("A", 0), RowRecord::new("B", 1)]);
        assert_eq!(
            engine.move_row(&id("A"), 0, 0).await.unwrap(),
            ReorderOutcome::Unchanged
        );
        assert!(backend.writes().is_empty());
    }

    #[tokio::test]
    async fn test_stale_from_index_uses_actual_position() {
        let (store, _backend, engine) = setup(vec![
            RowRecord::new("A", 0),
            RowRecord::new("B", 1),
            RowRecord::new("C", 2),
        ]);
        engine.move_row(&id("A"), 1, 2).await.unwrap();
        assert_eq!(store.order(), vec![id("B"), id("C"), id("A")]);
    }

    #[tokio::test]
    async fn test_row_being_created_cannot_be_dragged() {
        let (store, backend, engine) = setup(vec![RowRecord::new("A", 0), RowRecord::new("B", 1)]);
        let local = RowId::new_local();
        store.insert_row(RowRecord::new(local.clone(), 2));

        assert!(matches!(
            engine.move_row(&local, 2, 0).await,
            Err(GridError::InvalidMove { .. })
        ));
        assert!(backend.writes().is_empty());
        assert_eq!(store.order(), vec![id("A"), id("B"), local.clone()]);
        assert_eq!(store.row(&local).unwrap().rank, 2);
    }

    #[tokio::test]
    async fn test_drag_skips_rows_being_created() {
        let (store, backend, engine) = setup(vec![
            RowRecord::new("A", 1),
            RowRecord::new("B", 2),
            RowRecord::new("C", 3),
        ]);
        let local = RowId::new_local();
        store.insert_row(RowRecord::new(local.clone(), 4));

        let outcome = engine.move_row(&id("C"), 2, 0).await.unwrap();
        assert_eq!(outcome, ReorderOutcome::Reordered { writes: 3 });
        assert!(backend.writes().iter().all(|call| match call {
            PersistenceCall::UpdateRanks { ranks } => ranks.iter().all(|u| !u.row_id.is_local()),
            _ => false,
        }));
        assert_eq!(store.order(), vec![id("C"), id("A"), id("B"), local.clone()]);
        assert_eq!(store.row(&local).unwrap().rank, 4);
    }

    #[tokio::test]
    async fn test_out_of_range_target_is_rejected() {
        let (store, backend, engine) = setup(vec![RowRecord::new("A", 0), RowRecord::new("B", 1)]);
        assert!(matches!(
            engine.move_row(&id("A"), 0, 5).await,
            Err(GridError::InvalidMove { .. })
        ));
        assert!(backend.writes().is_empty());
        assert_eq!(store.order(), vec![id("A"), id("B")]);
    }
}

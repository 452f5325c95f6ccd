//! Realtime optimistic editable grid engine
//!
//! A mounted grid merges three sources of truth into one ordered row list:
//! optimistic local edits, confirmed persisted state, and a pushed change
//! feed that races with in-flight edits. Conflicts are settled per field by
//! the dirty set ("dirty wins"), deletes always win, and row order is always
//! derived from the persisted integer rank.
//!
//! Components:
//! - `catalog`: option lists behind select columns
//! - `store`: the rows, their dirty sets and pending mutations
//! - `applier`: optimistic edits, inserts and deletes with rollback
//! - `reorder`: drag reordering with a full contiguous re-rank
//! - `reconciler`: change-feed subscriptions and event merging
//! - `edit_session`: the single-cell editing state machine
//! - `engine`: `GridEngine`, the facade that wires them for one grid

pub mod applier;
pub mod catalog;
pub mod config;
pub mod edit_session;
pub mod engine;
pub mod reconciler;
pub mod reorder;
pub mod store;
pub mod telemetry;
pub mod testing;

pub use applier::{CommitOutcome, MutationApplier, StagedEdit};
pub use catalog::{CatalogResolver, CatalogSnapshot, CatalogStatus};
pub use config::GridConfig;
pub use edit_session::{
    BelowAnchor, CellRef, CommitRequest, EditSession, EditState, OverlayAnchor, OverlayPlacement,
    Rect, SelectOverlay,
};
pub use engine::{CommitHandle, GridCollaborators, GridEngine};
pub use reconciler::{ChangeFeedReconciler, SubscriptionState};
pub use reorder::{ReorderEngine, ReorderOutcome};
pub use store::{GridNotice, GridStore, PendingMutation, RemoteOutcome, Resolution, Row, StoreEvent};

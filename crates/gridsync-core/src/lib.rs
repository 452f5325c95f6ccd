//! Core traits and column model for the gridsync engine
//!
//! This crate provides:
//! - `GridPersistence`, `CatalogSource`, `ChangeFeedClient`: the collaborators the engine talks to
//! - `GridSchema`, `Column`, `ColumnKind`: static column descriptors
//! - `codec`: conversion between raw row values and typed cell values
//! - `rank`: contiguous re-ranking used by drag reordering

pub mod codec;
pub mod rank;
pub mod schema;
pub mod traits;

pub use codec::{CatalogLookup, CellValue, DisplayCell};
pub use schema::{Column, ColumnKind, DerivedColumn, GridSchema, LogTableSpec};
pub use traits::{CatalogSource, ChangeFeedClient, GridPersistence, Result};

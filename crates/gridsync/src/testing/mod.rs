//! Test infrastructure for the grid engine
//!
//! - `MemoryGridBackend`: scriptable in-memory persistence, catalogs and change feed
//! - fixtures for the case grid
//! - `wait_until` for polling asynchronous effects

pub mod memory_backend;

pub use memory_backend::{MemoryGridBackend, PersistenceCall, ScriptedWrite};

use anyhow::{bail, Result};
use std::time::Duration;

use gridsync_api::{CatalogEntry, RowRecord};
use gridsync_core::GridSchema;

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Case grid backend with three rows (ranks 0..2) and its catalogs loaded.
pub fn case_backend() -> MemoryGridBackend {
    let backend = MemoryGridBackend::new(&GridSchema::cases())
        .with_catalog(
            "case_status",
            vec![
                CatalogEntry::new(1, "Pending").with_color("#f9a825"),
                CatalogEntry::new(2, "Archived").with_color("#757575"),
                CatalogEntry::new(3, "Open").with_color("#2e7d32"),
            ],
        )
        .with_catalog(
            "case_category",
            vec![CatalogEntry::new(10, "Civil"), CatalogEntry::new(11, "Criminal")],
        )
        .with_catalog(
            "staff",
            vec![CatalogEntry::new(7, "Dana"), CatalogEntry::new(8, "Sam")],
        );
    for record in case_rows() {
        backend.seed_row(record);
    }
    backend
}

pub fn case_rows() -> Vec<RowRecord> {
    vec![
        RowRecord::new("1", 0)
            .with_field("title", "Lease dispute")
            .with_field("status", 3)
            .with_field("category", 10)
            .with_field("opened_on", "2024-03-01")
            .with_field("urgent", false)
            .with_field("assignee_id", 7),
        RowRecord::new("2", 1)
            .with_field("title", "Contract review")
            .with_field("status", 1)
            .with_field("category", 10)
            .with_field("opened_on", "2024-04-12")
            .with_field("urgent", true)
            .with_field("assignee_id", 8),
        RowRecord::new("3", 2)
            .with_field("title", "Appeal")
            .with_field("status", 3)
            .with_field("category", 11)
            .with_field("opened_on", "2024-05-20")
            .with_field("urgent", false)
            .with_field("assignee_id", 7),
    ]
}

//! Catalog resolver
//!
//! Loads the option lists behind select columns once per mount and maps
//! id <-> label <-> color. A catalog that failed to load stays `Failed` until
//! a retry succeeds; select columns bound to it render read-only meanwhile.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use gridsync_api::{CatalogEntry, CatalogId};
use gridsync_core::{CatalogLookup, CatalogSource};

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogStatus {
    Loaded(Arc<Vec<CatalogEntry>>),
    Failed(String),
}

#[derive(Default)]
pub struct CatalogResolver {
    catalogs: RwLock<HashMap<CatalogId, CatalogStatus>>,
}

impl CatalogResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every listed catalog. Returns the ids that failed.
    pub async fn load(&self, source: &dyn CatalogSource, catalog_ids: &[CatalogId]) -> Vec<CatalogId> {
        let mut failed = Vec::new();
        for catalog in catalog_ids {
            if !self.fetch(source, catalog).await {
                failed.push(catalog.clone());
            }
        }
        failed
    }

    async fn fetch(&self, source: &dyn CatalogSource, catalog: &CatalogId) -> bool {
        let status = match source.list_catalog(catalog).await {
            Ok(entries) => {
                info!("[CatalogResolver] Loaded {} ({} options)", catalog, entries.len());
                CatalogStatus::Loaded(Arc::new(entries))
            }
            Err(e) => {
                warn!("[CatalogResolver] Failed to load {}: {}", catalog, e);
                CatalogStatus::Failed(e.to_string())
            }
        };
        let loaded = matches!(status, CatalogStatus::Loaded(_));
        self.catalogs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(catalog.clone(), status);
        loaded
    }

    /// Re-attempt one catalog. Returns whether it is available afterwards.
    pub async fn retry(&self, source: &dyn CatalogSource, catalog: &CatalogId) -> bool {
        self.fetch(source, catalog).await
    }

    /// Re-attempt every failed catalog. Returns the ones that recovered.
    pub async fn retry_failed(&self, source: &dyn CatalogSource) -> Vec<CatalogId> {
        let mut restored = Vec::new();
        for catalog in self.failed() {
            if self.fetch(source, &catalog).await {
                restored.push(catalog);
            }
        }
        restored
    }

    pub fn status(&self, catalog: &CatalogId) -> Option<CatalogStatus> {
        self.catalogs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(catalog)
            .cloned()
    }

    pub fn failed(&self) -> Vec<CatalogId> {
        let catalogs = self.catalogs.read().unwrap_or_else(PoisonError::into_inner);
        let mut failed: Vec<CatalogId> = catalogs
            .iter()
            .filter(|(_, status)| matches!(status, CatalogStatus::Failed(_)))
            .map(|(id, _)| id.clone())
            .collect();
        failed.sort();
        failed
    }

    pub fn is_available(&self, catalog: &CatalogId) -> bool {
        matches!(self.status(catalog), Some(CatalogStatus::Loaded(_)))
    }

    /// Options of a loaded catalog, in source order.
    pub fn options(&self, catalog: &CatalogId) -> Vec<CatalogEntry> {
        match self.status(catalog) {
            Some(CatalogStatus::Loaded(entries)) => entries.as_ref().clone(),
            _ => Vec::new(),
        }
    }

    pub fn label(&self, catalog: &CatalogId, id: i64) -> Option<String> {
        self.snapshot().entry(catalog, id).map(|e| e.label.clone())
    }

    pub fn color(&self, catalog: &CatalogId, id: i64) -> Option<String> {
        self.snapshot()
            .entry(catalog, id)
            .and_then(|e| e.color_hint.clone())
    }

    /// Case-insensitive reverse lookup
    pub fn id_for_label(&self, catalog: &CatalogId, label: &str) -> Option<i64> {
        self.snapshot().find_by_label(catalog, label).map(|e| e.id)
    }

    /// Point-in-time view of the loaded catalogs, for the field codec.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let catalogs = self.catalogs.read().unwrap_or_else(PoisonError::into_inner);
        CatalogSnapshot {
            loaded: catalogs
                .iter()
                .filter_map(|(id, status)| match status {
                    CatalogStatus::Loaded(entries) => Some((id.clone(), entries.clone())),
                    CatalogStatus::Failed(_) => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    loaded: HashMap<CatalogId, Arc<Vec<CatalogEntry>>>,
}

impl CatalogLookup for CatalogSnapshot {
    fn entry(&self, catalog: &CatalogId, id: i64) -> Option<&CatalogEntry> {
        self.loaded.get(catalog)?.iter().find(|e| e.id == id)
    }

    fn find_by_label(&self, catalog: &CatalogId, label: &str) -> Option<&CatalogEntry> {
        let label = label.trim();
        self.loaded
            .get(catalog)?
            .iter()
            .find(|e| e.label.eq_ignore_ascii_case(label))
    }
}

//! Static column descriptors and grid schemas

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::traits::Result;
use gridsync_api::{CatalogId, ChangeEvent, ColumnId, Fields, GridError, LogEntry, RowId};

/// Columns whose displayed value is computed from a related record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "derived", rename_all = "snake_case")]
pub enum DerivedColumn {
    /// Label of the foreign-key id stored in `source`, resolved through `catalog`.
    /// Read-only in the grid.
    ForeignKeyLabel { catalog: CatalogId, source: ColumnId },
    /// Content of the newest log entry for the row. Editing appends a log entry.
    LatestLogEntry,
}

/// Display kind of a column, carrying what the kind needs to encode values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Select { catalog: CatalogId },
    Date,
    Boolean,
    Derived(DerivedColumn),
}

impl ColumnKind {
    pub fn catalog(&self) -> Option<&CatalogId> {
        match self {
            ColumnKind::Select { catalog }
            | ColumnKind::Derived(DerivedColumn::ForeignKeyLabel { catalog, .. }) => Some(catalog),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub label: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(id: impl Into<ColumnId>, label: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
        }
    }

    pub fn text(id: &str, label: &str) -> Self {
        Self::new(id, label, ColumnKind::Text)
    }

    pub fn select(id: &str, label: &str, catalog: &str) -> Self {
        Self::new(
            id,
            label,
            ColumnKind::Select {
                catalog: catalog.into(),
            },
        )
    }

    pub fn date(id: &str, label: &str) -> Self {
        Self::new(id, label, ColumnKind::Date)
    }

    pub fn boolean(id: &str, label: &str) -> Self {
        Self::new(id, label, ColumnKind::Boolean)
    }

    pub fn latest_log(id: &str, label: &str) -> Self {
        Self::new(id, label, ColumnKind::Derived(DerivedColumn::LatestLogEntry))
    }

    pub fn foreign_key_label(id: &str, label: &str, catalog: &str, source: &str) -> Self {
        Self::new(
            id,
            label,
            ColumnKind::Derived(DerivedColumn::ForeignKeyLabel {
                catalog: catalog.into(),
                source: source.into(),
            }),
        )
    }

    /// The row field holding this column's raw value.
    pub fn source_field(&self) -> &ColumnId {
        match &self.kind {
            ColumnKind::Derived(DerivedColumn::ForeignKeyLabel { source, .. }) => source,
            _ => &self.id,
        }
    }

    pub fn is_editable(&self) -> bool {
        !matches!(
            self.kind,
            ColumnKind::Derived(DerivedColumn::ForeignKeyLabel { .. })
        )
    }

    pub fn is_latest_log(&self) -> bool {
        matches!(self.kind, ColumnKind::Derived(DerivedColumn::LatestLogEntry))
    }
}

/// Where the secondary log table keeps its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTableSpec {
    pub table: String,
    /// Foreign key pointing at the owning row
    pub row_field: ColumnId,
    pub content_field: ColumnId,
    pub created_at_field: ColumnId,
}

impl LogTableSpec {
    /// Build a log entry from a change event on the log table.
    ///
    /// The event's `row_id` is the log entry id; the owning row is read from
    /// `row_field`. Falls back to the event timestamp when the payload has no
    /// creation time.
    pub fn entry_from_event(&self, event: &ChangeEvent) -> Option<LogEntry> {
        self.entry_from_fields(event.row_id.as_str(), &event.payload, event.timestamp)
    }

    pub fn entry_from_fields(
        &self,
        id: &str,
        fields: &Fields,
        fallback_time: DateTime<Utc>,
    ) -> Option<LogEntry> {
        let row_id = fields.get(&self.row_field).and_then(|v| match v {
            gridsync_api::Value::Integer(i) => Some(i.to_string()),
            other => other.as_string().map(str::to_string),
        })?;
        let content = fields
            .get(&self.content_field)
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_string();
        let created_at = fields
            .get(&self.created_at_field)
            .and_then(|v| v.as_datetime())
            .unwrap_or(fallback_time);
        Some(LogEntry {
            id: id.to_string(),
            row_id: RowId::new(row_id),
            content,
            created_at,
        })
    }
}

/// Column layout and table names for one grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSchema {
    pub table: String,
    #[serde(default = "default_rank_field")]
    pub rank_field: ColumnId,
    #[serde(default)]
    pub log: Option<LogTableSpec>,
    pub columns: Vec<Column>,
}

fn default_rank_field() -> ColumnId {
    ColumnId::from("rank")
}

impl GridSchema {
    pub fn new(table: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            table: table.into(),
            rank_field: default_rank_field(),
            log: None,
            columns,
        }
    }

    pub fn with_log(mut self, log: LogTableSpec) -> Self {
        self.log = Some(log);
        self
    }

    /// Case records grid.
    pub fn cases() -> Self {
        Self::new(
            "cases",
            vec![
                Column::text("title", "Title"),
                Column::select("status", "Status", "case_status"),
                Column::select("category", "Category", "case_category"),
                Column::date("opened_on", "Opened"),
                Column::boolean("urgent", "Urgent"),
                Column::foreign_key_label("assignee", "Assignee", "staff", "assignee_id"),
                Column::latest_log("last_update", "Last update"),
            ],
        )
        .with_log(LogTableSpec {
            table: "case_updates".to_string(),
            row_field: "case_id".into(),
            content_field: "content".into(),
            created_at_field: "created_at".into(),
        })
    }

    /// Work-item records grid.
    pub fn work_items() -> Self {
        Self::new(
            "work_items",
            vec![
                Column::text("title", "Title"),
                Column::select("stage", "Stage", "work_item_stage"),
                Column::select("priority", "Priority", "priority"),
                Column::date("due_on", "Due"),
                Column::boolean("done", "Done"),
                Column::latest_log("last_update", "Last update"),
            ],
        )
        .with_log(LogTableSpec {
            table: "work_item_updates".to_string(),
            row_field: "work_item_id".into(),
            content_field: "content".into(),
            created_at_field: "created_at".into(),
        })
    }

    pub fn column(&self, id: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.id.as_str() == id)
    }

    pub fn require_column(&self, id: &str) -> Result<&Column> {
        self.column(id).ok_or_else(|| GridError::ColumnNotFound {
            column: id.to_string(),
        })
    }

    pub fn latest_log_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_latest_log())
    }

    /// Catalogs referenced by any column, without duplicates.
    pub fn catalog_ids(&self) -> Vec<CatalogId> {
        let mut ids: Vec<CatalogId> = Vec::new();
        for catalog in self.columns.iter().filter_map(|c| c.kind.catalog()) {
            if !ids.contains(catalog) {
                ids.push(catalog.clone());
            }
        }
        ids
    }

    /// Whether the given field name is one of the engine-managed ones that
    /// never show up as a regular column (rank).
    pub fn is_rank_field(&self, field: &str) -> bool {
        self.rank_field.as_str() == field
    }
}

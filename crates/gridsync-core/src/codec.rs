//! Field codec: raw row values <-> typed cell values
//!
//! Rows store whatever the persistence layer returned. Editors and renderers
//! need a value shaped by the column kind; this module is the only place that
//! converts between the two.

use chrono::{DateTime, NaiveDate};
use std::collections::HashMap;

use crate::schema::{Column, ColumnKind, DerivedColumn};
use crate::traits::Result;
use gridsync_api::{CatalogEntry, CatalogId, Fields, GridError, Value};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Read-only access to loaded catalogs.
pub trait CatalogLookup {
    fn entry(&self, catalog: &CatalogId, id: i64) -> Option<&CatalogEntry>;

    /// Case-insensitive label lookup
    fn find_by_label(&self, catalog: &CatalogId, label: &str) -> Option<&CatalogEntry>;
}

impl CatalogLookup for HashMap<CatalogId, Vec<CatalogEntry>> {
    fn entry(&self, catalog: &CatalogId, id: i64) -> Option<&CatalogEntry> {
        self.get(catalog)?.iter().find(|e| e.id == id)
    }

    fn find_by_label(&self, catalog: &CatalogId, label: &str) -> Option<&CatalogEntry> {
        let label = label.trim();
        self.get(catalog)?
            .iter()
            .find(|e| e.label.eq_ignore_ascii_case(label))
    }
}

/// Typed cell value, one variant per column kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Select(Option<i64>),
    Date(Option<NaiveDate>),
    Boolean(bool),
    Derived(Option<String>),
}

/// What a renderer shows for a cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DisplayCell {
    pub text: String,
    pub color: Option<String>,
}

fn invalid(column: &Column, message: impl Into<String>) -> GridError {
    GridError::InvalidValue {
        column: column.id.to_string(),
        message: message.into(),
    }
}

/// The raw value backing `column` in a row's fields.
pub fn raw_value<'a>(column: &Column, fields: &'a Fields) -> Option<&'a Value> {
    fields.get(column.source_field())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" | "" => Some(false),
        _ => None,
    }
}

/// Decode a raw value into the column's typed representation.
pub fn decode(column: &Column, raw: Option<&Value>) -> Result<CellValue> {
    let raw = raw.unwrap_or(&Value::Null);
    match &column.kind {
        ColumnKind::Text => match raw {
            Value::Null => Ok(CellValue::Text(String::new())),
            Value::String(s) | Value::DateTime(s) => Ok(CellValue::Text(s.clone())),
            Value::Integer(i) => Ok(CellValue::Text(i.to_string())),
            Value::Float(f) => Ok(CellValue::Text(f.to_string())),
            Value::Boolean(b) => Ok(CellValue::Text(b.to_string())),
            other => Err(invalid(column, format!("cannot show {:?} as text", other))),
        },
        ColumnKind::Select { .. } | ColumnKind::Derived(DerivedColumn::ForeignKeyLabel { .. }) => {
            match raw {
                Value::Null => Ok(CellValue::Select(None)),
                Value::String(s) if s.trim().is_empty() => Ok(CellValue::Select(None)),
                other => other
                    .as_i64()
                    .map(|id| CellValue::Select(Some(id)))
                    .ok_or_else(|| invalid(column, format!("{:?} is not a catalog id", other))),
            }
        }
        ColumnKind::Date => match raw {
            Value::Null => Ok(CellValue::Date(None)),
            Value::String(s) | Value::DateTime(s) if s.trim().is_empty() => {
                Ok(CellValue::Date(None))
            }
            Value::String(s) | Value::DateTime(s) => parse_date(s)
                .map(|d| CellValue::Date(Some(d)))
                .ok_or_else(|| invalid(column, format!("'{}' is not a date", s))),
            other => Err(invalid(column, format!("{:?} is not a date", other))),
        },
        ColumnKind::Boolean => match raw {
            Value::Null => Ok(CellValue::Boolean(false)),
            Value::String(s) => parse_bool(s)
                .map(CellValue::Boolean)
                .ok_or_else(|| invalid(column, format!("'{}' is not a boolean", s))),
            other => other
                .as_bool()
                .map(CellValue::Boolean)
                .ok_or_else(|| invalid(column, format!("{:?} is not a boolean", other))),
        },
        ColumnKind::Derived(DerivedColumn::LatestLogEntry) => match raw {
            Value::Null => Ok(CellValue::Derived(None)),
            other => Ok(CellValue::Derived(other.as_string().map(str::to_string))),
        },
    }
}

/// Encode a typed cell value into the raw value sent to persistence.
pub fn encode(column: &Column, cell: &CellValue) -> Result<Value> {
    match (&column.kind, cell) {
        (ColumnKind::Text, CellValue::Text(s)) => Ok(Value::String(s.clone())),
        (ColumnKind::Select { .. }, CellValue::Select(id))
        | (ColumnKind::Derived(DerivedColumn::ForeignKeyLabel { .. }), CellValue::Select(id)) => {
            Ok(id.map(Value::Integer).unwrap_or(Value::Null))
        }
        (ColumnKind::Date, CellValue::Date(date)) => Ok(date
            .map(|d| Value::String(d.format(DATE_FORMAT).to_string()))
            .unwrap_or(Value::Null)),
        (ColumnKind::Boolean, CellValue::Boolean(b)) => Ok(Value::Boolean(*b)),
        (ColumnKind::Derived(DerivedColumn::LatestLogEntry), CellValue::Derived(content)) => {
            Ok(content.clone().map(Value::String).unwrap_or(Value::Null))
        }
        (kind, cell) => Err(invalid(
            column,
            format!("{:?} does not fit a {:?} column", cell, kind),
        )),
    }
}

/// Parse user-typed text into a cell value.
///
/// Select columns accept either a numeric id or an option label.
pub fn parse_input(column: &Column, text: &str, catalogs: &dyn CatalogLookup) -> Result<CellValue> {
    match &column.kind {
        ColumnKind::Text => Ok(CellValue::Text(text.to_string())),
        ColumnKind::Select { catalog } => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(CellValue::Select(None));
            }
            if let Ok(id) = trimmed.parse::<i64>() {
                return Ok(CellValue::Select(Some(id)));
            }
            catalogs
                .find_by_label(catalog, trimmed)
                .map(|entry| CellValue::Select(Some(entry.id)))
                .ok_or_else(|| invalid(column, format!("no option labelled '{}'", trimmed)))
        }
        ColumnKind::Date => {
            if text.trim().is_empty() {
                return Ok(CellValue::Date(None));
            }
            parse_date(text)
                .map(|d| CellValue::Date(Some(d)))
                .ok_or_else(|| invalid(column, format!("'{}' is not a date", text)))
        }
        ColumnKind::Boolean => parse_bool(text)
            .map(CellValue::Boolean)
            .ok_or_else(|| invalid(column, format!("'{}' is not a boolean", text))),
        ColumnKind::Derived(DerivedColumn::LatestLogEntry) => {
            let trimmed = text.trim();
            Ok(CellValue::Derived(
                (!trimmed.is_empty()).then(|| trimmed.to_string()),
            ))
        }
        ColumnKind::Derived(DerivedColumn::ForeignKeyLabel { .. }) => {
            Err(GridError::ReadOnlyColumn {
                column: column.id.to_string(),
            })
        }
    }
}

/// Render a cell for display. Never fails: undecodable values fall back to
/// their raw JSON text.
pub fn display(column: &Column, fields: &Fields, catalogs: &dyn CatalogLookup) -> DisplayCell {
    let raw = raw_value(column, fields);
    let cell = match decode(column, raw) {
        Ok(cell) => cell,
        Err(_) => {
            return DisplayCell {
                text: raw.map(Value::to_json_string).unwrap_or_default(),
                color: None,
            };
        }
    };
    match (cell, column.kind.catalog()) {
        (CellValue::Select(Some(id)), Some(catalog)) => match catalogs.entry(catalog, id) {
            Some(entry) => DisplayCell {
                text: entry.label.clone(),
                color: entry.color_hint.clone(),
            },
            None => DisplayCell {
                text: format!("#{}", id),
                color: None,
            },
        },
        (CellValue::Select(_), _) => DisplayCell::default(),
        (CellValue::Text(s), _) => DisplayCell {
            text: s,
            color: None,
        },
        (CellValue::Date(d), _) => DisplayCell {
            text: d.map(|d| d.format(DATE_FORMAT).to_string()).unwrap_or_default(),
            color: None,
        },
        (CellValue::Boolean(b), _) => DisplayCell {
            text: if b { "yes" } else { "no" }.to_string(),
            color: None,
        },
        (CellValue::Derived(content), _) => DisplayCell {
            text: content.unwrap_or_default(),
            color: None,
        },
    }
}

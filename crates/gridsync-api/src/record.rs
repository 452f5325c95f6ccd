//! Records exchanged with the persistence layer.
//!
//! Identifiers are thin newtypes over `String` so row ids, column ids and
//! catalog ids cannot be mixed up at call sites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

use crate::Value;

/// Prefix of row ids minted locally for optimistic inserts.
pub const LOCAL_ID_PREFIX: &str = "local:";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Stable identifier of a row in the owning table.
    RowId
);
string_id!(
    /// Identifier of a column (equal to the persisted field name).
    ColumnId
);
string_id!(
    /// Identifier of a reference table backing a select column.
    CatalogId
);

impl RowId {
    /// Mint a temporary id for a row that has not been persisted yet.
    pub fn new_local() -> Self {
        Self(format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

/// Field map of a row, keyed by column id.
pub type Fields = HashMap<ColumnId, Value>;

/// A row as returned by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: RowId,
    pub rank: i64,
    #[serde(default)]
    pub fields: Fields,
}

impl RowRecord {
    pub fn new(id: impl Into<RowId>, rank: i64) -> Self {
        Self {
            id: id.into(),
            rank,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, column: impl Into<ColumnId>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }
}

/// An entry of the secondary log table ("updates" attached to a row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub row_id: RowId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One option of a reference table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub label: String,
    #[serde(default)]
    pub color_hint: Option<String>,
}

impl CatalogEntry {
    pub fn new(id: i64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            color_hint: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color_hint = Some(color.into());
        self
    }
}

/// A single rank write issued by the reorder engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankUpdate {
    pub row_id: RowId,
    pub rank: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids() {
        let id = RowId::new_local();
        assert!(id.is_local());
        assert!(!RowId::from("42").is_local());
    }

    #[test]
    fn test_column_id_borrows_as_str() {
        let mut fields = Fields::new();
        fields.insert(ColumnId::from("title"), Value::from("Leak"));
        assert_eq!(fields.get("title"), Some(&Value::from("Leak")));
    }

    #[test]
    fn test_row_record_deserializes_without_fields() {
        let row: RowRecord = serde_json::from_str(r#"{"id":"7","rank":3}"#).unwrap();
        assert_eq!(row.id.as_str(), "7");
        assert!(row.fields.is_empty());
    }
}

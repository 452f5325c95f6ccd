use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod record;
pub mod streaming;

// Re-export record types
pub use record::{
    CatalogEntry, CatalogId, ColumnId, Fields, LogEntry, RankUpdate, RowId, RowRecord,
    LOCAL_ID_PREFIX,
};

// Re-export streaming types
pub use streaming::{
    ChangeEvent, ChangeKind, ChangeOrigin, ChangeStream, TraceContext, CURRENT_TRACE_CONTEXT,
};

/// Raw field value as stored on a row and carried by change events.
///
/// Column-specific typing happens in the field codec (`gridsync-core`);
/// this type only mirrors what the persistence layer hands back.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    // Stored as RFC3339 string; use as_datetime() to get the parsed chrono::DateTime
    DateTime(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    Null,
}

impl Value {
    /// Create a Value from a serde_json::Value
    pub fn from_json_value(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::String(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_json_value).collect())
            }
            serde_json::Value::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, Value::from_json_value(v)))
                    .collect(),
            ),
        }
    }

    /// Get string value, returning None if not a string
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::DateTime(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Get datetime value as parsed chrono::DateTime
    ///
    /// Accepts both the DateTime variant and plain RFC3339 strings, since
    /// untagged deserialization always lands timestamps in `String`.
    pub fn as_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            Value::DateTime(s) | Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&chrono::Utc)),
            _ => None,
        }
    }

    /// Create a Value from a chrono::DateTime
    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Value::DateTime(dt.to_rfc3339())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::from_json_value(v)
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) | Value::DateTime(s) => serde_json::Value::String(s),
            Value::Integer(i) => serde_json::Value::Number(serde_json::Number::from(i)),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(b),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(Into::into).collect())
            }
            Value::Object(obj) => {
                serde_json::Value::Object(obj.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Value::Null => serde_json::Value::Null,
        }
    }
}

/// Structured error types for the grid engine.
///
/// Every variant is recoverable from the process' point of view: the grid
/// stays interactive and the failure is surfaced as a notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum GridError {
    #[error("Persistence failure during {operation}: {message}")]
    PersistenceFailure { operation: String, message: String },

    #[error("Subscription to {table} failed: {message}")]
    SubscriptionFailure { table: String, message: String },

    #[error("Catalog {catalog} could not be loaded: {message}")]
    CatalogLoadFailure { catalog: String, message: String },

    #[error("Row not found: {id}")]
    RowNotFound { id: String },

    #[error("Column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("Invalid value for column {column}: {message}")]
    InvalidValue { column: String, message: String },

    #[error("Column {column} is read-only")]
    ReadOnlyColumn { column: String },

    #[error("Invalid move: {message}")]
    InvalidMove { message: String },

    #[error("Edit session error: {message}")]
    EditSession { message: String },

    #[error("Grid has been unmounted")]
    Closed,
}

impl GridError {
    pub fn persistence(operation: impl Into<String>, message: impl ToString) -> Self {
        GridError::PersistenceFailure {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn subscription(table: impl Into<String>, message: impl ToString) -> Self {
        GridError::SubscriptionFailure {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure was handled by a local rollback or retry (as
    /// opposed to a caller mistake such as an unknown row or column).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GridError::PersistenceFailure { .. }
                | GridError::SubscriptionFailure { .. }
                | GridError::CatalogLoadFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        let v = Value::Boolean(true);
        assert_eq!(v.as_bool(), Some(true));
        assert_eq!(v.as_i64(), None);

        let v = Value::Integer(42);
        assert_eq!(v.as_i64(), Some(42));
        assert_eq!(v.as_f64(), Some(42.0));

        let v = Value::String("17".to_string());
        assert_eq!(v.as_i64(), Some(17));

        let v = Value::Null;
        assert!(v.is_null());
    }

    #[test]
    fn test_value_from() {
        let v: Value = true.into();
        assert_eq!(v, Value::Boolean(true));

        let v: Value = "test".into();
        assert_eq!(v, Value::String("test".to_string()));

        let v: Value = None::<i64>.into();
        assert_eq!(v, Value::Null);

        let v: Value = Some(42).into();
        assert_eq!(v, Value::Integer(42));
    }

    #[test]
    fn test_value_json() {
        let json = serde_json::json!({"title": "Leak", "urgent": true, "status_id": 3});
        let v = Value::from_json_value(json.clone());
        let back: serde_json::Value = v.into();
        assert_eq!(back, json);
    }

    #[test]
    fn test_datetime_from_plain_string() {
        let v = Value::String("2024-03-01T10:00:00Z".to_string());
        assert!(v.as_datetime().is_some());
    }

    #[test]
    fn test_error_recoverability() {
        assert!(GridError::persistence("update_field", "timeout").is_recoverable());
        assert!(!GridError::RowNotFound { id: "x".into() }.is_recoverable());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

use crate::{ColumnId, Fields, GridError, RowId, Value};

// Task-local storage for trace context propagation through async call chains
tokio::task_local! {
    /// Current trace context for the executing task
    /// Set by the embedding layer, read by TraceContext::from_current_span()
    pub static CURRENT_TRACE_CONTEXT: TraceContext;
}

/// Stream of change notifications for one watched table.
///
/// An `Err` item means the subscription was disrupted; the consumer is
/// expected to drop the stream and resubscribe.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent, GridError>> + Send>>;

/// Kind of row-level change pushed by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Origin of a change event (local vs. remote).
///
/// Writes issued by this client are tagged `Local` with the trace context of
/// the edit that caused them, so their echo can be correlated in logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Change initiated by this client
    Local {
        /// Span ID (16 hex chars) linking this change to the originating edit
        operation_id: Option<String>,
        /// Trace ID (32 hex chars) for distributed tracing
        trace_id: Option<String>,
    },
    /// Change made by another client or by the server itself
    Remote,
}

impl ChangeOrigin {
    /// Create Local origin with trace context extracted from the current span
    pub fn local_with_current_span() -> Self {
        match TraceContext::from_current_span() {
            Some(ctx) => Self::local_from_trace_context(&ctx),
            None => Self::Local {
                operation_id: None,
                trace_id: None,
            },
        }
    }

    pub fn local_from_trace_context(ctx: &TraceContext) -> Self {
        Self::Local {
            operation_id: Some(ctx.span_id.clone()),
            trace_id: Some(ctx.trace_id.clone()),
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        match self {
            Self::Local { trace_id, .. } => trace_id.as_deref(),
            Self::Remote => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

/// Row-level change notification.
///
/// Ephemeral: the reconciler consumes it immediately. `payload` holds the
/// changed fields for `Update`, the (possibly partial) new row for `Insert`
/// and is typically empty for `Delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub row_id: RowId,
    #[serde(default)]
    pub payload: Fields,
    pub timestamp: DateTime<Utc>,
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, table: impl Into<String>, row_id: impl Into<RowId>) -> Self {
        Self {
            kind,
            table: table.into(),
            row_id: row_id.into(),
            payload: Fields::new(),
            timestamp: Utc::now(),
            origin: ChangeOrigin::Remote,
        }
    }

    pub fn insert(table: impl Into<String>, row_id: impl Into<RowId>) -> Self {
        Self::new(ChangeKind::Insert, table, row_id)
    }

    pub fn update(table: impl Into<String>, row_id: impl Into<RowId>) -> Self {
        Self::new(ChangeKind::Update, table, row_id)
    }

    pub fn delete(table: impl Into<String>, row_id: impl Into<RowId>) -> Self {
        Self::new(ChangeKind::Delete, table, row_id)
    }

    pub fn with_field(mut self, column: impl Into<ColumnId>, value: impl Into<Value>) -> Self {
        self.payload.insert(column.into(), value.into());
        self
    }

    pub fn with_origin(mut self, origin: ChangeOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Trace context attached to pending mutations and local change origins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    /// Trace ID (32 hex characters)
    pub trace_id: String,
    /// Span ID (16 hex characters)
    pub span_id: String,
    /// Trace flags
    pub trace_flags: u8,
}

impl TraceContext {
    /// Create a TraceContext from OpenTelemetry span context
    pub fn from_span_context(span_context: &opentelemetry::trace::SpanContext) -> Self {
        Self {
            trace_id: format!("{:032x}", span_context.trace_id()),
            span_id: format!("{:016x}", span_context.span_id()),
            trace_flags: if span_context.is_sampled() {
                0x01
            } else {
                0x00
            },
        }
    }

    /// Extract trace context from task-local storage or current span
    ///
    /// Priority:
    /// 1. Task-local CURRENT_TRACE_CONTEXT
    /// 2. OpenTelemetry context attached to the current tracing span
    /// 3. Fallback to tracing span ID
    pub fn from_current_span() -> Option<Self> {
        if let Ok(ctx) = CURRENT_TRACE_CONTEXT.try_with(|ctx| ctx.clone()) {
            return Some(ctx);
        }

        use opentelemetry::trace::TraceContextExt;
        use tracing_opentelemetry::OpenTelemetrySpanExt;

        let span = tracing::Span::current();
        if span.is_none() {
            return None;
        }

        let otel_ctx = span.context();
        let span_ref = otel_ctx.span();
        let span_ctx = span_ref.span_context();
        if span_ctx.is_valid() {
            return Some(Self::from_span_context(span_ctx));
        }

        span.id().map(|id| Self {
            trace_id: format!("{:032x}", id.into_u64()),
            span_id: format!("{:016x}", id.into_u64()),
            trace_flags: 0x01, // Sampled
        })
    }
}

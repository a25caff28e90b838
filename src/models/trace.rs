use serde::Serialize;
use serde_json::{Map, Value};

/// A normalized OTLP span, ready for insertion. `attributes` is the flattened
/// key → primitive map from the span's AnyValue list.
#[derive(Debug, Clone, Serialize)]
pub struct NewSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub service_name: String,
    pub operation_name: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<i64>,
    pub status: String,
    pub attributes: Map<String, Value>,
}

/// A span row as stored, timestamps in epoch milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct SpanRow {
    pub id: i64,
    pub drop_id: i64,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub service_name: String,
    pub operation_name: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<i64>,
    pub status: String,
    pub attributes: Value,
    pub created_at: i64,
}

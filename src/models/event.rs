use serde::Serialize;
use serde_json::Value;

/// A normalized wide event ready for insertion. The structured columns are
/// extracted from the event's dotted keys; `attributes` keeps the entire
/// originating event untouched.
#[derive(Debug, Clone, Serialize)]
pub struct NewWideEvent {
    pub trace_id: Option<String>,
    pub service_name: String,
    pub operation_type: Option<String>,
    pub field_name: Option<String>,
    pub outcome: String,
    pub duration_ms: Option<f64>,
    pub user_id: Option<String>,
    pub error_count: i64,
    pub rpc_call_count: i64,
    pub attributes: Value,
}

/// A wide-event row as stored.
#[derive(Debug, Clone, Serialize)]
pub struct WideEventRow {
    pub id: i64,
    pub drop_id: i64,
    pub trace_id: Option<String>,
    pub service_name: String,
    pub operation_type: Option<String>,
    pub field_name: Option<String>,
    pub outcome: String,
    pub duration_ms: Option<f64>,
    pub user_id: Option<String>,
    pub error_count: i64,
    pub rpc_call_count: i64,
    pub attributes: Value,
    pub created_at: i64,
}

/// Per-drop overview counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DropStats {
    pub traces: StreamStats,
    pub events: StreamStats,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub total: i64,
    pub errors: i64,
}

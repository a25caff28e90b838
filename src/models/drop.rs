use serde::Serialize;

/// The reserved workspace that always exists and receives telemetry when no
/// drop is selected.
pub const DEFAULT_DROP_NAME: &str = "default";

pub const DEFAULT_TRACES_RETENTION_MS: i64 = 3 * 86_400_000;
pub const DEFAULT_EVENTS_RETENTION_MS: i64 = 7 * 86_400_000;

/// A named, access-controlled workspace partitioning all telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct DropRecord {
    pub id: i64,
    pub name: String,
    pub label: Option<String>,
    pub created_at: i64,
}

/// Per-drop retention policy. `None` (or a stored 0) disables pruning for
/// that stream.
#[derive(Debug, Clone, Serialize)]
pub struct DropRetention {
    pub drop_id: i64,
    pub traces_retention_ms: Option<i64>,
    pub events_retention_ms: Option<i64>,
    pub updated_at: i64,
}

/// List-endpoint payload: the drop plus its effective retention.
#[derive(Debug, Clone, Serialize)]
pub struct DropWithRetention {
    #[serde(flatten)]
    pub drop: DropRecord,
    pub traces_retention_ms: Option<i64>,
    pub events_retention_ms: Option<i64>,
}

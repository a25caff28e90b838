use serde::Serialize;

/// A stored dashboard. The server treats `spec` as opaque JSON; rendering is
/// entirely client-side.
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub id: String,
    pub drop_id: i64,
    pub name: String,
    pub spec: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

use serde::Serialize;

/// A long-lived machine identity. API keys hang off a service account and the
/// account name is unique per owner.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceAccount {
    pub id: String,
    pub name: String,
    pub created_by_user_id: String,
    pub created_at: i64,
}

/// Only `key_prefix` is ever displayed after creation; the raw secret exists
/// exactly once in the creation response. Revocation is soft.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: String,
    pub service_account_id: String,
    pub name: Option<String>,
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub created_by_user_id: String,
    pub created_at: i64,
    pub revoked_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyPermission {
    pub api_key_id: String,
    pub drop_id: i64,
    pub can_ingest: bool,
    pub can_query: bool,
}

/// A usage record awaiting insertion, produced once per API-key request.
#[derive(Debug, Clone)]
pub struct NewApiKeyUsage {
    pub api_key_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub drop_id: Option<i64>,
    pub ip: String,
    pub user_agent: String,
}

/// Append-only request log for API-key principals.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyUsageRow {
    pub id: i64,
    pub api_key_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub drop_id: Option<i64>,
    pub ip: String,
    pub user_agent: String,
    pub created_at: i64,
}

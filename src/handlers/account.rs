use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;

use crate::AppState;
use crate::auth::{self, Action, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::models::api_key::ApiKey;
use crate::query_builder::clamp_limit;

fn actor(ctx: &AuthContext) -> ApiResult<String> {
    auth::require_session(ctx)?;
    ctx.actor_id()
        .map(str::to_string)
        .ok_or(ApiError::Unauthenticated)
}

// ── Service accounts ──

/// `GET /api/account/service-accounts`
pub async fn list_service_accounts(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<impl IntoResponse> {
    let owner = actor(&ctx)?;
    Ok(Json(serde_json::json!({
        "service_accounts": state.store.list_service_accounts(&owner)?
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceAccountRequest {
    pub name: String,
}

/// `POST /api/account/service-accounts`
pub async fn create_service_account(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateServiceAccountRequest>,
) -> ApiResult<impl IntoResponse> {
    let owner = actor(&ctx)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadInput(
            "service account name is required".to_string(),
        ));
    }
    let id = uuid::Uuid::new_v4().to_string();
    let account = state.store.create_service_account(&id, name, &owner)?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// `DELETE /api/account/service-accounts/{id}`
pub async fn delete_service_account(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let owner = actor(&ctx)?;
    if !state.store.delete_service_account(&id, &owner)? {
        return Err(ApiError::NotFound("service account not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── API keys ──

fn generate_api_key() -> String {
    let mut rng = rand::rng();
    let chars: Vec<char> = "abcdefghijklmnopqrstuvwxyz0123456789".chars().collect();
    (0..64)
        .map(|_| chars[rng.random_range(0..chars.len())])
        .collect()
}

/// `GET /api/account/api-keys`: prefixes only, with per-drop capabilities.
pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<impl IntoResponse> {
    let owner = actor(&ctx)?;
    let mut keys = Vec::new();
    for key in state.store.list_api_keys(&owner)? {
        let perms = state.store.api_key_permissions(&key.id)?;
        let mut value = serde_json::to_value(&key).map_err(ApiError::internal)?;
        value["permissions"] = serde_json::to_value(perms).map_err(ApiError::internal)?;
        keys.push(value);
    }
    Ok(Json(serde_json::json!({ "keys": keys })))
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub service_account_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<KeyPermissionRequest>,
}

#[derive(Debug, Deserialize)]
pub struct KeyPermissionRequest {
    pub drop: String,
    #[serde(default)]
    pub can_ingest: bool,
    #[serde(default)]
    pub can_query: bool,
}

/// `POST /api/account/api-keys`: the full secret is returned exactly once.
/// Members can only delegate capabilities they themselves hold.
pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateApiKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    let owner = actor(&ctx)?;

    let account = state
        .store
        .get_service_account(&req.service_account_id)?
        .ok_or_else(|| ApiError::NotFound("service account not found".to_string()))?;
    if account.created_by_user_id != owner {
        return Err(ApiError::Forbidden("not your service account".to_string()));
    }

    let mut grants = Vec::with_capacity(req.permissions.len());
    for perm in &req.permissions {
        let drop_id = state
            .store
            .resolve_drop(&perm.drop, false)?
            .ok_or_else(|| ApiError::NotFound(format!("unknown drop: {}", perm.drop)))?;
        if perm.can_ingest {
            auth::require_drop_access(&state.store, &ctx, drop_id, Action::Ingest)?;
        }
        if perm.can_query {
            auth::require_drop_access(&state.store, &ctx, drop_id, Action::Query)?;
        }
        grants.push((drop_id, perm.can_ingest, perm.can_query));
    }

    let secret = generate_api_key();
    let key = ApiKey {
        id: uuid::Uuid::new_v4().to_string(),
        service_account_id: account.id.clone(),
        name: req.name.clone(),
        key_prefix: secret[..8].to_string(),
        key_hash: auth::hash_token(&secret),
        created_by_user_id: owner,
        created_at: chrono::Utc::now().timestamp_millis(),
        revoked_at: None,
    };
    state.store.create_api_key(&key, &grants)?;

    let mut body = serde_json::to_value(&key).map_err(ApiError::internal)?;
    // The only place the raw secret ever appears.
    body["key"] = serde_json::Value::String(secret);
    body["permissions"] = serde_json::to_value(state.store.api_key_permissions(&key.id)?)
        .map_err(ApiError::internal)?;
    Ok((StatusCode::CREATED, Json(body)))
}

/// `DELETE /api/account/api-keys/{id}`: soft revocation.
pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let owner = actor(&ctx)?;
    if !state.store.revoke_api_key(&id, &owner)? {
        return Err(ApiError::NotFound("api key not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/account/api-key-usage`
pub async fn list_api_key_usage(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let owner = actor(&ctx)?;
    let limit = clamp_limit(super::parse_i64_param(&params, "limit", 100)?);
    Ok(Json(serde_json::json!({
        "usage": state.store.list_usage_for_user(&owner, limit)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_long_lowercase_alnum() {
        let key = generate_api_key();
        assert_eq!(key.len(), 64);
        assert!(
            key.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        assert_ne!(key, generate_api_key());
    }
}

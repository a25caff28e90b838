use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use std::collections::HashMap;

use crate::AppState;
use crate::auth::{self, Action, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::models::query::QueryEnvelope;
use crate::query_builder::{self, Entity, clamp_limit};
use crate::usage::UsageDropId;

fn resolve(
    state: &AppState,
    ctx: &AuthContext,
    usage_drop: &UsageDropId,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    action: Action,
) -> ApiResult<i64> {
    let selector = super::drop_selector(params, headers);
    let drop_id = super::resolve_drop(state, ctx, &selector)?;
    usage_drop.set(drop_id);
    auth::require_drop_access(&state.store, ctx, drop_id, action)?;
    Ok(drop_id)
}

/// `GET /api/traces`: most recent spans for the drop.
pub async fn list_traces(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Query)?;
    let limit = clamp_limit(super::parse_i64_param(&params, "limit", 100)?);
    Ok(Json(state.store.recent_spans(drop_id, limit)?))
}

/// `GET /api/events`
pub async fn list_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Query)?;
    let limit = clamp_limit(super::parse_i64_param(&params, "limit", 100)?);
    Ok(Json(state.store.recent_events(drop_id, limit)?))
}

/// `GET /api/stats`: totals, error counts and the service catalog.
pub async fn get_stats(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Query)?;
    Ok(Json(state.store.stats(drop_id)?))
}

/// `GET /api/services`
pub async fn list_services(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Query)?;
    Ok(Json(
        serde_json::json!({ "services": state.store.list_services(drop_id)? }),
    ))
}

fn search_envelope(params: &HashMap<String, String>) -> ApiResult<QueryEnvelope> {
    let mut env = QueryEnvelope::default();
    env.q = params.get("q").cloned();
    env.limit = super::parse_i64_param(params, "limit", 100)?;
    Ok(env)
}

/// `GET /api/search/traces?q=`: free-text wrapper over the query engine.
pub async fn search_traces(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Query)?;
    let compiled = query_builder::compile(Entity::Traces, &search_envelope(&params)?)?;
    Ok(Json(state.store.query_spans(drop_id, &compiled)?))
}

/// `GET /api/search/events?q=`
pub async fn search_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Query)?;
    let compiled = query_builder::compile(Entity::Events, &search_envelope(&params)?)?;
    Ok(Json(state.store.query_events(drop_id, &compiled)?))
}

/// `DELETE /api/clear`: wipe a drop's telemetry.
pub async fn clear_drop(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Ingest)?;
    let (spans, events) = state.store.clear_drop(drop_id)?;
    Ok(Json(
        serde_json::json!({ "cleared": { "spans": spans, "events": events } }),
    ))
}

/// `GET /api/me`: who the viewer shell is talking as.
pub async fn me(Extension(ctx): Extension<AuthContext>) -> ApiResult<impl IntoResponse> {
    let body = match &ctx {
        AuthContext::Disabled => serde_json::json!({
            "auth_enabled": false,
            "kind": "disabled",
        }),
        AuthContext::Anonymous => serde_json::json!({
            "auth_enabled": true,
            "kind": "anonymous",
        }),
        AuthContext::Session(profile) => serde_json::json!({
            "auth_enabled": true,
            "kind": "session",
            "user": profile,
        }),
        AuthContext::ApiKey { key, .. } => serde_json::json!({
            "auth_enabled": true,
            "kind": "api_key",
            "key_prefix": key.key_prefix,
        }),
    };
    Ok(Json(body))
}

// ── Dashboards ──

#[derive(Debug, Deserialize)]
pub struct CreateDashboardRequest {
    pub name: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDashboardRequest {
    pub name: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// `GET /api/dashboards`
pub async fn list_dashboards(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Query)?;
    Ok(Json(
        serde_json::json!({ "dashboards": state.store.list_dashboards(drop_id)? }),
    ))
}

/// `POST /api/dashboards`
pub async fn create_dashboard(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(req): Json<CreateDashboardRequest>,
) -> ApiResult<impl IntoResponse> {
    let drop_id = resolve(&state, &ctx, &usage_drop, &params, &headers, Action::Query)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadInput("dashboard name is required".to_string()));
    }
    let id = uuid::Uuid::new_v4().to_string();
    let spec_json = serde_json::to_string(&req.spec).map_err(ApiError::internal)?;
    state
        .store
        .create_dashboard(&id, drop_id, req.name.trim(), &spec_json)?;
    let dashboard = state
        .store
        .get_dashboard(&id)?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("failed to read created dashboard")))?;
    Ok((StatusCode::CREATED, Json(dashboard)))
}

/// `GET /api/dashboards/{id}`
pub async fn get_dashboard(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let dashboard = state
        .store
        .get_dashboard(&id)?
        .ok_or_else(|| ApiError::NotFound("dashboard not found".to_string()))?;
    usage_drop.set(dashboard.drop_id);
    auth::require_drop_access(&state.store, &ctx, dashboard.drop_id, Action::Query)?;
    Ok(Json(dashboard))
}

/// `PUT /api/dashboards/{id}`
pub async fn update_dashboard(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Path(id): Path<String>,
    Json(req): Json<UpdateDashboardRequest>,
) -> ApiResult<impl IntoResponse> {
    let existing = state
        .store
        .get_dashboard(&id)?
        .ok_or_else(|| ApiError::NotFound("dashboard not found".to_string()))?;
    usage_drop.set(existing.drop_id);
    auth::require_drop_access(&state.store, &ctx, existing.drop_id, Action::Query)?;

    let spec_json = serde_json::to_string(&req.spec).map_err(ApiError::internal)?;
    state
        .store
        .update_dashboard(&id, req.name.trim(), &spec_json)?;
    let dashboard = state
        .store
        .get_dashboard(&id)?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("failed to read dashboard")))?;
    Ok(Json(dashboard))
}

/// `DELETE /api/dashboards/{id}`
pub async fn delete_dashboard(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let existing = state
        .store
        .get_dashboard(&id)?
        .ok_or_else(|| ApiError::NotFound("dashboard not found".to_string()))?;
    usage_drop.set(existing.drop_id);
    auth::require_drop_access(&state.store, &ctx, existing.drop_id, Action::Query)?;
    state.store.delete_dashboard(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use std::collections::HashMap;

use crate::AppState;
use crate::auth::{self, Action, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::models::event::WideEventRow;
use crate::models::query::QueryEnvelope;
use crate::models::trace::SpanRow;
use crate::query_builder::{self, Entity};
use crate::usage::UsageDropId;

/// Query endpoints also accept the drop in the body; query string and header
/// still win.
fn resolve_query_drop(
    state: &AppState,
    ctx: &AuthContext,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    env: &QueryEnvelope,
) -> ApiResult<i64> {
    let mut selector = super::drop_selector(params, headers);
    if selector.trim().is_empty() {
        selector = env
            .drop
            .clone()
            .or_else(|| env.drop_id.clone())
            .unwrap_or_default();
    }
    super::resolve_drop(state, ctx, &selector)
}

/// `POST /v1/query/traces`
pub async fn query_traces(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(env): Json<QueryEnvelope>,
) -> ApiResult<Json<Vec<SpanRow>>> {
    let drop_id = resolve_query_drop(&state, &ctx, &params, &headers, &env)?;
    usage_drop.set(drop_id);
    auth::require_drop_access(&state.store, &ctx, drop_id, Action::Query)?;

    let compiled = query_builder::compile(Entity::Traces, &env)?;
    let rows = state.store.query_spans(drop_id, &compiled)?;
    Ok(Json(rows))
}

/// `POST /v1/query/events`
pub async fn query_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(env): Json<QueryEnvelope>,
) -> ApiResult<Json<Vec<WideEventRow>>> {
    let drop_id = resolve_query_drop(&state, &ctx, &params, &headers, &env)?;
    usage_drop.set(drop_id);
    auth::require_drop_access(&state.store, &ctx, drop_id, Action::Query)?;

    let compiled = query_builder::compile(Entity::Events, &env)?;
    let rows = state.store.query_events(drop_id, &compiled)?;
    Ok(Json(rows))
}

/// `GET /v1/query/traces/{trace_id}` (also mounted at `/api/traces/{trace_id}`)
///: the drill-down: every span of the trace plus its correlated wide events.
pub async fn get_trace(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Path(trace_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let selector = super::drop_selector(&params, &headers);
    let drop_id = super::resolve_drop(&state, &ctx, &selector)?;
    usage_drop.set(drop_id);
    auth::require_drop_access(&state.store, &ctx, drop_id, Action::Query)?;

    let (spans, events) = state.store.get_trace(drop_id, &trace_id)?;
    if spans.is_empty() && events.is_empty() {
        return Err(ApiError::NotFound("trace not found".to_string()));
    }
    Ok(Json(
        serde_json::json!({ "spans": spans, "events": events }),
    ))
}

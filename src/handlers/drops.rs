use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::AppState;
use crate::auth::{self, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::models::drop::DEFAULT_DROP_NAME;
use crate::pruner::{self, PrunerConfig};
use crate::usage::UsageDropId;

const MS_PER_DAY: i64 = 86_400_000;

fn pruner_config(state: &AppState) -> PrunerConfig {
    PrunerConfig {
        interval: std::time::Duration::from_secs(state.cfg.prune_interval_secs),
        batch_size: state.cfg.prune_batch_size,
        max_runtime: std::time::Duration::from_millis(state.cfg.prune_max_runtime_ms),
    }
}

fn lookup_drop(state: &AppState, selector: &str) -> ApiResult<i64> {
    state
        .store
        .resolve_drop(selector, false)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown drop: {selector}")))
}

/// `GET /api/drops`: admins see everything, members see the drops they hold
/// any permission on, API keys see the drops their capabilities name.
pub async fn list_drops(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<impl IntoResponse> {
    auth::require_auth(&ctx)?;
    let drops = match &ctx {
        AuthContext::Session(profile) if !ctx.is_admin() => {
            state.store.list_drops_for_user(&profile.user_id)?
        }
        AuthContext::ApiKey { perms, .. } => {
            let visible: Vec<i64> = perms.iter().map(|p| p.drop_id).collect();
            state
                .store
                .list_drops()?
                .into_iter()
                .filter(|d| visible.contains(&d.drop.id))
                .collect()
        }
        _ => state.store.list_drops()?,
    };
    Ok(Json(serde_json::json!({ "drops": drops })))
}

#[derive(Debug, Deserialize)]
pub struct CreateDropRequest {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// `POST /api/drops`
pub async fn create_drop(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateDropRequest>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadInput("drop name is required".to_string()));
    }
    // All-digit names would collide with id selectors and be unreachable.
    if name.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::BadInput(
            "drop name cannot be all digits".to_string(),
        ));
    }
    let drop = state.store.create_drop(name, req.label.as_deref())?;
    Ok((StatusCode::CREATED, Json(drop)))
}

/// `GET /api/drops/{drop}`: one drop with its retention policy.
pub async fn get_drop(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Path(selector): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let drop_id = lookup_drop(&state, &selector)?;
    usage_drop.set(drop_id);
    auth::require_drop_access(&state.store, &ctx, drop_id, auth::Action::Query)?;
    let drop = state
        .store
        .get_drop(drop_id)?
        .ok_or_else(|| ApiError::NotFound("unknown drop".to_string()))?;
    let retention = state.store.get_retention(drop_id)?;
    Ok(Json(
        serde_json::json!({ "drop": drop, "retention": retention }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SetRetentionRequest {
    #[serde(default)]
    pub traces_days: Option<i64>,
    #[serde(default)]
    pub events_days: Option<i64>,
}

/// `PUT /api/drops/{drop}/retention`: days to ms, 0 disables. A change is
/// followed by one immediate pruning pass for the drop.
pub async fn set_retention(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Path(selector): Path<String>,
    Json(req): Json<SetRetentionRequest>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    let drop_id = lookup_drop(&state, &selector)?;
    usage_drop.set(drop_id);

    if req.traces_days.is_some_and(|d| d < 0) || req.events_days.is_some_and(|d| d < 0) {
        return Err(ApiError::BadInput(
            "retention days cannot be negative".to_string(),
        ));
    }
    let retention = state.store.get_retention(drop_id)?;
    let traces_ms = match req.traces_days {
        Some(days) => Some(days * MS_PER_DAY),
        None => retention.traces_retention_ms,
    };
    let events_ms = match req.events_days {
        Some(days) => Some(days * MS_PER_DAY),
        None => retention.events_retention_ms,
    };
    state.store.set_retention(drop_id, traces_ms, events_ms)?;

    pruner::prune_drop_soon(state.store.clone(), pruner_config(&state), drop_id);
    Ok(Json(state.store.get_retention(drop_id)?))
}

#[derive(Debug, Deserialize)]
pub struct SetLabelRequest {
    #[serde(default)]
    pub label: Option<String>,
}

/// `PUT /api/drops/{drop}/label`
pub async fn set_label(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Path(selector): Path<String>,
    Json(req): Json<SetLabelRequest>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    let drop_id = lookup_drop(&state, &selector)?;
    usage_drop.set(drop_id);
    state.store.set_drop_label(drop_id, req.label.as_deref())?;
    let drop = state
        .store
        .get_drop(drop_id)?
        .ok_or_else(|| ApiError::NotFound("unknown drop".to_string()))?;
    Ok(Json(drop))
}

/// `DELETE /api/drops/{drop}`: the default drop and the last remaining drop
/// are protected; everything the drop owns cascades.
pub async fn delete_drop(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Path(selector): Path<String>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    let drop_id = lookup_drop(&state, &selector)?;
    usage_drop.set(drop_id);

    let drop = state
        .store
        .get_drop(drop_id)?
        .ok_or_else(|| ApiError::NotFound("unknown drop".to_string()))?;
    if drop.name.eq_ignore_ascii_case(DEFAULT_DROP_NAME) {
        return Err(ApiError::Forbidden(
            "the default drop cannot be deleted".to_string(),
        ));
    }
    if state.store.count_drops()? <= 1 {
        return Err(ApiError::Forbidden(
            "cannot delete the last drop".to_string(),
        ));
    }
    state.store.delete_drop(drop_id)?;
    Ok(StatusCode::NO_CONTENT)
}

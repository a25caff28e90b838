pub mod account;
pub mod admin;
pub mod api;
pub mod drops;
pub mod health;
pub mod ingest;
pub mod query;
pub mod ws;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use axum::middleware;
use axum::routing::{delete, get, patch, post, put};
use std::collections::HashMap;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::auth::{self, AuthContext};
use crate::error::{ApiError, ApiResult};

/// Ingest and query bodies are parsed whole in memory; this cap keeps that
/// bounded (413 beyond it).
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        // Ingest
        .route("/v1/traces", post(ingest::post_traces))
        .route("/v1/events", post(ingest::post_events))
        .route("/v1/logs", post(ingest::post_logs))
        // Query
        .route("/v1/query/traces", post(query::query_traces))
        .route("/v1/query/events", post(query::query_events))
        .route("/v1/query/traces/{trace_id}", get(query::get_trace))
        // Viewer convenience
        .route("/api/traces", get(api::list_traces))
        .route("/api/events", get(api::list_events))
        .route("/api/traces/{trace_id}", get(query::get_trace))
        .route("/api/stats", get(api::get_stats))
        .route("/api/services", get(api::list_services))
        .route("/api/search/traces", get(api::search_traces))
        .route("/api/search/events", get(api::search_events))
        .route("/api/clear", delete(api::clear_drop))
        .route("/api/me", get(api::me))
        // Dashboards
        .route(
            "/api/dashboards",
            get(api::list_dashboards).post(api::create_dashboard),
        )
        .route(
            "/api/dashboards/{id}",
            get(api::get_dashboard)
                .put(api::update_dashboard)
                .delete(api::delete_dashboard),
        )
        // Drop registry
        .route(
            "/api/drops",
            get(drops::list_drops).post(drops::create_drop),
        )
        .route(
            "/api/drops/{drop}",
            get(drops::get_drop).delete(drops::delete_drop),
        )
        .route("/api/drops/{drop}/retention", put(drops::set_retention))
        .route("/api/drops/{drop}/label", put(drops::set_label))
        // Administration
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/{id}", patch(admin::update_user))
        .route(
            "/api/admin/users/{id}/permissions",
            get(admin::get_permissions).put(admin::set_permissions),
        )
        .route(
            "/api/admin/auth-policy",
            get(admin::get_auth_policy).put(admin::set_auth_policy),
        )
        // Account (session-only)
        .route(
            "/api/account/service-accounts",
            get(account::list_service_accounts).post(account::create_service_account),
        )
        .route(
            "/api/account/service-accounts/{id}",
            delete(account::delete_service_account),
        )
        .route(
            "/api/account/api-keys",
            get(account::list_api_keys).post(account::create_api_key),
        )
        .route(
            "/api/account/api-keys/{id}",
            delete(account::revoke_api_key),
        )
        .route(
            "/api/account/api-key-usage",
            get(account::list_api_key_usage),
        )
        // Live viewers
        .route("/ws", get(ws::ws_handler))
        // Health
        .route("/healthz", get(health::healthz))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Drop selection for a request: `?drop=`, then `?dropId=`, then the
/// `X-Raphael-Drop` header. Empty means the default drop.
pub(crate) fn drop_selector(params: &HashMap<String, String>, headers: &HeaderMap) -> String {
    if let Some(value) = params.get("drop") {
        return value.clone();
    }
    if let Some(value) = params.get("dropId") {
        return value.clone();
    }
    headers
        .get("x-raphael-drop")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Drops are auto-created only when auth is off or the caller is an admin.
pub(crate) fn allow_create(state: &AppState, ctx: &AuthContext) -> bool {
    !state.cfg.auth_enabled || ctx.is_admin()
}

pub(crate) fn resolve_drop(state: &AppState, ctx: &AuthContext, selector: &str) -> ApiResult<i64> {
    state
        .store
        .resolve_drop(selector, allow_create(state, ctx))?
        .ok_or_else(|| ApiError::NotFound(format!("unknown drop: {selector}")))
}

/// Parse an optional numeric query parameter; garbage is a 400, not a
/// silent default.
pub(crate) fn parse_i64_param(
    params: &HashMap<String, String>,
    key: &str,
    default: i64,
) -> ApiResult<i64> {
    match params.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::BadInput(format!("invalid numeric parameter: {key}"))),
        None => Ok(default),
    }
}

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde::Serialize;
use std::collections::HashMap;

use crate::AppState;
use crate::auth::{self, Action, AuthContext};
use crate::error::{ApiError, ApiResult};
use crate::hub::Hub;
use crate::ingest::{self, StageBuffer};
use crate::usage::UsageDropId;

/// When nobody is watching the drop, ingest is just the database write.
/// Otherwise rows are staged into the bounded ring before the insert.
fn stage_if_subscribed<T: Serialize>(
    hub: &Hub,
    drop_id: i64,
    capacity: usize,
    rows: &[T],
) -> ApiResult<Option<StageBuffer>> {
    if !hub.has_subscribers(drop_id) {
        return Ok(None);
    }
    let mut buffer = StageBuffer::new(capacity);
    for row in rows {
        buffer.push(serde_json::to_value(row).map_err(ApiError::internal)?);
    }
    Ok(Some(buffer))
}

/// Emit the staged rows after the commit, one frame per chunk, in order.
fn broadcast_staged(hub: &Hub, drop_id: i64, kind: &str, buffer: StageBuffer, batch_size: usize) {
    for chunk in buffer.into_chunks(batch_size) {
        hub.broadcast(
            &serde_json::json!({ "type": kind, "drop_id": drop_id, "data": chunk }),
            Some(drop_id),
        );
    }
}

/// `POST /v1/traces`: OTLP/HTTP-JSON span export.
pub async fn post_traces(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let selector = super::drop_selector(&params, &headers);
    let drop_id = super::resolve_drop(&state, &ctx, &selector)?;
    usage_drop.set(drop_id);
    auth::require_drop_access(&state.store, &ctx, drop_id, Action::Ingest)?;

    let request: ingest::ExportTraceRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("OTLP trace payload: {e}")))?;
    let spans = ingest::normalize_traces(&request);

    let staged = stage_if_subscribed(&state.hub, drop_id, state.cfg.broadcast_max_items, &spans)?;
    state.store.insert_spans(drop_id, &spans)?;
    if let Some(buffer) = staged {
        broadcast_staged(
            &state.hub,
            drop_id,
            "traces",
            buffer,
            state.cfg.broadcast_batch_size,
        );
    }

    Ok(Json(serde_json::json!({ "partialSuccess": {} })))
}

/// `POST /v1/events`: a wide event or an array of them.
pub async fn post_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let selector = super::drop_selector(&params, &headers);
    let drop_id = super::resolve_drop(&state, &ctx, &selector)?;
    usage_drop.set(drop_id);
    auth::require_drop_access(&state.store, &ctx, drop_id, Action::Ingest)?;

    let events = ingest::normalize_events_body(&body).map_err(ApiError::Internal)?;

    let staged = stage_if_subscribed(&state.hub, drop_id, state.cfg.broadcast_max_items, &events)?;
    let received = state.store.insert_events(drop_id, &events)?;
    if let Some(buffer) = staged {
        broadcast_staged(
            &state.hub,
            drop_id,
            "wide_events",
            buffer,
            state.cfg.broadcast_batch_size,
        );
    }

    Ok(Json(serde_json::json!({ "received": received })))
}

/// `POST /v1/logs`: OTLP/HTTP-JSON logs, filtered down to wide events.
pub async fn post_logs(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(usage_drop): Extension<UsageDropId>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let selector = super::drop_selector(&params, &headers);
    let drop_id = super::resolve_drop(&state, &ctx, &selector)?;
    usage_drop.set(drop_id);
    auth::require_drop_access(&state.store, &ctx, drop_id, Action::Ingest)?;

    let request: ingest::ExportLogsRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("OTLP log payload: {e}")))?;
    let events = ingest::normalize_logs(&request).map_err(ApiError::Internal)?;

    let staged = stage_if_subscribed(&state.hub, drop_id, state.cfg.broadcast_max_items, &events)?;
    state.store.insert_events(drop_id, &events)?;
    if let Some(buffer) = staged {
        broadcast_staged(
            &state.hub,
            drop_id,
            "wide_events",
            buffer,
            state.cfg.broadcast_batch_size,
        );
    }

    Ok(Json(serde_json::json!({ "partialSuccess": {} })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::api_key::{ApiKey, ApiKeyPermission};
    use crate::models::event::NewWideEvent;
    use axum::http::{HeaderValue, StatusCode};

    fn query_only_key(drop_id: i64) -> AuthContext {
        AuthContext::ApiKey {
            key: ApiKey {
                id: "key-1".to_string(),
                service_account_id: "sa-1".to_string(),
                name: None,
                key_prefix: "abcd1234".to_string(),
                key_hash: "hash".to_string(),
                created_by_user_id: "u1".to_string(),
                created_at: 0,
                revoked_at: None,
            },
            perms: vec![ApiKeyPermission {
                api_key_id: "key-1".to_string(),
                drop_id,
                can_ingest: false,
                can_query: true,
            }],
        }
    }

    fn event() -> NewWideEvent {
        NewWideEvent {
            trace_id: Some("t1".to_string()),
            service_name: "gw".to_string(),
            operation_type: None,
            field_name: None,
            outcome: "success".to_string(),
            duration_ms: Some(42.0),
            user_id: None,
            error_count: 0,
            rpc_call_count: 0,
            attributes: serde_json::json!({"service.name": "gw", "outcome": "success"}),
        }
    }

    #[test]
    fn no_subscribers_means_no_staging() {
        let hub = Hub::new();
        let staged = stage_if_subscribed(&hub, 1, 500, &[event()]).unwrap();
        assert!(staged.is_none());
    }

    #[tokio::test]
    async fn subscribed_drop_receives_chunked_frames() {
        let hub = Hub::new();
        let (_id, mut rx) = hub.register(7);
        let rows: Vec<NewWideEvent> = (0..5).map(|_| event()).collect();

        let staged = stage_if_subscribed(&hub, 7, 500, &rows).unwrap().unwrap();
        broadcast_staged(&hub, 7, "wide_events", staged, 2);

        // ceil(5 / 2) frames, each carrying at most two rows, in order.
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str::<serde_json::Value>(&frame).unwrap());
        }
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!(frame["type"], "wide_events");
            assert_eq!(frame["drop_id"], 7);
            assert!(frame["data"].as_array().unwrap().len() <= 2);
        }
        assert_eq!(frames[0]["data"].as_array().unwrap().len(), 2);
        assert_eq!(frames[2]["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drop_header_routes_events_to_a_new_drop() {
        let state = crate::test_state();
        let mut headers = HeaderMap::new();
        headers.insert("x-raphael-drop", HeaderValue::from_static("staging"));
        let body = serde_json::json!([
            {"trace_id": "t1", "service.name": "gw", "outcome": "success", "duration.total_ms": 42}
        ]);

        let res = post_events(
            State(state.clone()),
            Extension(AuthContext::Disabled),
            Extension(UsageDropId::default()),
            Query(HashMap::new()),
            headers,
            Json(body),
        )
        .await
        .unwrap();
        assert_eq!(res.0["received"], 1);

        let staging = state.store.get_drop_by_name("staging").unwrap().unwrap().id;
        let default = state.store.default_drop_id().unwrap();
        assert_eq!(state.store.recent_events(staging, 10).unwrap().len(), 1);
        assert_eq!(state.store.recent_events(default, 10).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn query_only_api_key_cannot_ingest() {
        let mut cfg = crate::config::AppConfig::default();
        cfg.auth_enabled = true;
        let state = crate::test_state_with_config(cfg);
        let default = state.store.default_drop_id().unwrap();

        let err = post_events(
            State(state.clone()),
            Extension(query_only_key(default)),
            Extension(UsageDropId::default()),
            Query(HashMap::new()),
            HeaderMap::new(),
            Json(serde_json::json!({"service.name": "gw", "outcome": "success"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(state.store.recent_events(default, 10).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn frames_go_only_to_the_matching_drop() {
        let hub = Hub::new();
        let (_a, mut rx_default) = hub.register(1);
        let (_b, mut rx_staging) = hub.register(2);

        let staged = stage_if_subscribed(&hub, 2, 500, &[event()])
            .unwrap()
            .unwrap();
        broadcast_staged(&hub, 2, "wide_events", staged, 200);

        assert!(rx_default.try_recv().is_err());
        let frame: serde_json::Value =
            serde_json::from_str(&rx_staging.try_recv().unwrap()).unwrap();
        assert_eq!(frame["drop_id"], 2);
        assert_eq!(frame["data"][0]["service_name"], "gw");
    }
}

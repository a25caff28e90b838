use axum::Extension;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::AppState;
use crate::auth::{self, Action, AuthContext};

/// Application close codes; the HTTP handshake has already succeeded, so
/// auth failures are reported on the socket itself.
const CLOSE_UNAUTHORIZED: u16 = 4401;
const CLOSE_DISABLED: u16 = 4403;

/// `GET /ws`: live telemetry feed. One subscription per connection; the
/// default drop until the client sends a subscribe frame.
pub async fn ws_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, ctx, socket))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(state: AppState, ctx: AuthContext, socket: WebSocket) {
    if state.cfg.auth_enabled {
        match &ctx {
            AuthContext::Session(profile) if !profile.disabled => {}
            AuthContext::Session(_) => {
                close_with(socket, CLOSE_DISABLED, "account disabled").await;
                return;
            }
            _ => {
                close_with(socket, CLOSE_UNAUTHORIZED, "unauthorized").await;
                return;
            }
        }
    }

    let default_drop = match state.store.default_drop_id() {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("websocket connect failed: {e}");
            return;
        }
    };

    let (client_id, mut rx) = state.hub.register(default_drop);
    state.hub.send_to(
        client_id,
        &serde_json::json!({ "type": "connected", "drop_id": default_drop }),
    );

    let (mut sink, mut stream) = socket.split();

    // Sender loop: drains the hub queue for this socket. When the hub evicts
    // the client the queue closes and the socket goes with it.
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => handle_client_frame(&state, &ctx, client_id, text.as_str()),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.unregister(client_id);
    send_task.abort();
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    drop: Option<String>,
    #[serde(default, rename = "dropId")]
    drop_id: Option<String>,
}

fn reply_error(state: &AppState, client_id: u64, error: &str) {
    state.hub.send_to(
        client_id,
        &serde_json::json!({ "type": "error", "error": error }),
    );
}

fn handle_client_frame(state: &AppState, ctx: &AuthContext, client_id: u64, raw: &str) {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(_) => {
            reply_error(state, client_id, "malformed message");
            return;
        }
    };
    if frame.kind != "subscribe" {
        reply_error(state, client_id, "unsupported message type");
        return;
    }

    let selector = frame.drop.or(frame.drop_id).unwrap_or_default();
    // Subscribing never creates drops for non-admins.
    let allow_create = !state.cfg.auth_enabled || ctx.is_admin();
    match state.store.resolve_drop(&selector, allow_create) {
        Ok(Some(drop_id)) => {
            if let Err(err) = auth::require_drop_access(&state.store, ctx, drop_id, Action::Query) {
                reply_error(state, client_id, &err.to_string());
                return;
            }
            state.hub.resubscribe(client_id, drop_id);
            state.hub.send_to(
                client_id,
                &serde_json::json!({ "type": "subscribed", "drop_id": drop_id }),
            );
        }
        Ok(None) => reply_error(state, client_id, "unknown drop"),
        Err(e) => {
            tracing::error!("subscribe failed: {e}");
            reply_error(state, client_id, "internal error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_frame_moves_the_subscription() {
        let state = crate::test_state();
        let staging = state.store.create_drop("staging", None).unwrap().id;
        let default = state.store.default_drop_id().unwrap();

        let (client_id, mut rx) = state.hub.register(default);
        handle_client_frame(
            &state,
            &AuthContext::Disabled,
            client_id,
            r#"{"type": "subscribe", "drop": "staging"}"#,
        );

        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "subscribed");
        assert_eq!(frame["drop_id"], staging);
        assert!(state.hub.has_subscribers(staging));
        assert!(!state.hub.has_subscribers(default));
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_answer_with_errors() {
        let state = crate::test_state();
        let default = state.store.default_drop_id().unwrap();
        let (client_id, mut rx) = state.hub.register(default);

        handle_client_frame(&state, &AuthContext::Disabled, client_id, "not-json");
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "error");

        handle_client_frame(
            &state,
            &AuthContext::Disabled,
            client_id,
            r#"{"type": "ping"}"#,
        );
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "error");

        // Subscription is untouched by failed frames.
        assert!(state.hub.has_subscribers(default));
    }

    #[tokio::test]
    async fn member_subscribe_cannot_create_drops() {
        let mut cfg = crate::config::AppConfig::default();
        cfg.auth_enabled = true;
        let state = crate::test_state_with_config(cfg);
        let default = state.store.default_drop_id().unwrap();

        let profile = state
            .store
            .insert_profile(
                "u1",
                "member@example.com",
                crate::models::user::Role::Member,
            )
            .unwrap();
        let ctx = AuthContext::Session(profile);

        let (client_id, mut rx) = state.hub.register(default);
        handle_client_frame(
            &state,
            &ctx,
            client_id,
            r#"{"type": "subscribe", "drop": "brand-new"}"#,
        );
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "error");
        assert!(state.store.get_drop_by_name("brand-new").unwrap().is_none());
    }
}

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::AppState;
use crate::auth::{self, AuthContext, AuthPolicy, DefaultPermission};
use crate::error::{ApiError, ApiResult};
use crate::models::user::Role;

/// `GET /api/admin/users`
pub async fn list_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    Ok(Json(
        serde_json::json!({ "users": state.store.list_profiles()? }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
}

/// The configured admin email can never be demoted or disabled.
fn is_protected(state: &AppState, email: &str) -> bool {
    state.cfg.admin_email.as_deref() == Some(email)
}

/// `PATCH /api/admin/users/{id}`
pub async fn update_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    let target = state
        .store
        .get_profile(&user_id)?
        .ok_or_else(|| ApiError::NotFound("unknown user".to_string()))?;
    if is_protected(&state, &target.email) {
        return Err(ApiError::Forbidden("this account is protected".to_string()));
    }

    let role = match req.role.as_deref() {
        Some(raw) => Some(
            Role::parse(raw).ok_or_else(|| ApiError::BadInput(format!("invalid role: {raw}")))?,
        ),
        None => None,
    };
    state.store.update_profile(&user_id, role, req.disabled)?;
    let updated = state
        .store
        .get_profile(&user_id)?
        .ok_or_else(|| ApiError::NotFound("unknown user".to_string()))?;
    Ok(Json(updated))
}

/// `GET /api/admin/users/{id}/permissions`
pub async fn get_permissions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    state
        .store
        .get_profile(&user_id)?
        .ok_or_else(|| ApiError::NotFound("unknown user".to_string()))?;
    Ok(Json(serde_json::json!({
        "permissions": state.store.user_permissions(&user_id)?
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetPermissionsRequest {
    #[serde(default)]
    pub permissions: Vec<PermissionGrant>,
}

#[derive(Debug, Deserialize)]
pub struct PermissionGrant {
    pub drop_id: i64,
    #[serde(default)]
    pub can_ingest: bool,
    #[serde(default)]
    pub can_query: bool,
}

/// `PUT /api/admin/users/{id}/permissions`: replace-all semantics.
pub async fn set_permissions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Json(req): Json<SetPermissionsRequest>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    state
        .store
        .get_profile(&user_id)?
        .ok_or_else(|| ApiError::NotFound("unknown user".to_string()))?;

    let mut grants = Vec::with_capacity(req.permissions.len());
    for grant in &req.permissions {
        state
            .store
            .get_drop(grant.drop_id)?
            .ok_or_else(|| ApiError::NotFound(format!("unknown drop: {}", grant.drop_id)))?;
        grants.push((grant.drop_id, grant.can_ingest, grant.can_query));
    }
    state.store.replace_user_permissions(&user_id, &grants)?;
    Ok(Json(serde_json::json!({
        "permissions": state.store.user_permissions(&user_id)?
    })))
}

/// `GET /api/admin/auth-policy`: the sealed OAuth client secret is never
/// echoed back, only its presence.
pub async fn get_auth_policy(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;
    let policy = auth::load_policy(&state.store)?;
    Ok(Json(serde_json::json!({
        "allowed_emails": policy.allowed_emails,
        "allowed_domains": policy.allowed_domains,
        "default_permissions": policy.default_permissions,
        "oauth_client_id": policy.oauth_client_id,
        "has_oauth_client_secret": policy.oauth_client_secret.is_some(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAuthPolicyRequest {
    #[serde(default)]
    pub allowed_emails: Vec<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub default_permissions: Vec<DefaultPermission>,
    #[serde(default)]
    pub oauth_client_id: Option<String>,
    /// Plaintext on input; sealed before it is persisted.
    #[serde(default)]
    pub oauth_client_secret: Option<String>,
}

/// `PUT /api/admin/auth-policy`: refuses a policy that would lock out the
/// calling admin.
pub async fn set_auth_policy(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UpdateAuthPolicyRequest>,
) -> ApiResult<impl IntoResponse> {
    auth::require_admin(&ctx)?;

    let existing = auth::load_policy(&state.store)?;
    let sealed_secret = match req.oauth_client_secret.as_deref() {
        Some(plaintext) if !plaintext.is_empty() => Some(
            state
                .secrets
                .seal_str(plaintext)
                .map_err(ApiError::Internal)?,
        ),
        Some(_) => None,
        None => existing.oauth_client_secret,
    };
    let policy = AuthPolicy {
        allowed_emails: req.allowed_emails,
        allowed_domains: req.allowed_domains,
        default_permissions: req.default_permissions,
        oauth_client_id: req.oauth_client_id,
        oauth_client_secret: sealed_secret,
    };

    if let AuthContext::Session(profile) = &ctx {
        let exempt = state.cfg.admin_email.as_deref() == Some(profile.email.as_str());
        if !exempt && !policy.allows(&profile.email) {
            return Err(ApiError::BadInput(
                "policy would lock out the current admin".to_string(),
            ));
        }
    }

    auth::save_policy(&state.store, &policy)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn protected_admin_email_cannot_be_touched() {
        let mut cfg = crate::config::AppConfig::default();
        cfg.auth_enabled = true;
        cfg.admin_email = Some("root@example.com".to_string());
        let state = crate::test_state_with_config(cfg);
        state
            .store
            .insert_profile("root", "root@example.com", Role::Admin)
            .unwrap();

        let err = update_user(
            State(state),
            Extension(AuthContext::Disabled),
            Path("root".to_string()),
            Json(UpdateUserRequest {
                role: Some("member".to_string()),
                disabled: None,
            }),
        )
        .await
        .err()
        .expect("expected an error");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn invalid_role_is_bad_input_and_unknown_user_not_found() {
        let state = crate::test_state();
        state
            .store
            .insert_profile("u1", "member@example.com", Role::Member)
            .unwrap();

        let err = update_user(
            State(state.clone()),
            Extension(AuthContext::Disabled),
            Path("u1".to_string()),
            Json(UpdateUserRequest {
                role: Some("superuser".to_string()),
                disabled: None,
            }),
        )
        .await
        .err()
        .expect("expected an error");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = update_user(
            State(state),
            Extension(AuthContext::Disabled),
            Path("ghost".to_string()),
            Json(UpdateUserRequest {
                role: None,
                disabled: Some(true),
            }),
        )
        .await
        .err()
        .expect("expected an error");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn policy_update_refuses_to_lock_out_the_caller() {
        let state = crate::test_state();
        let admin = state
            .store
            .insert_profile("a1", "admin@corp.io", Role::Admin)
            .unwrap();
        let ctx = AuthContext::Session(admin);

        let err = set_auth_policy(
            State(state.clone()),
            Extension(ctx.clone()),
            Json(UpdateAuthPolicyRequest {
                allowed_emails: vec!["someone-else@corp.io".to_string()],
                allowed_domains: vec![],
                default_permissions: vec![],
                oauth_client_id: None,
                oauth_client_secret: None,
            }),
        )
        .await
        .err()
        .expect("expected an error");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        // A policy that still covers the caller is accepted.
        assert!(
            set_auth_policy(
                State(state),
                Extension(ctx),
                Json(UpdateAuthPolicyRequest {
                    allowed_emails: vec![],
                    allowed_domains: vec!["corp.io".to_string()],
                    default_permissions: vec![],
                    oauth_client_id: None,
                    oauth_client_secret: None,
                }),
            )
            .await
            .is_ok()
        );
    }

    #[tokio::test]
    async fn oauth_client_secret_is_sealed_at_rest() {
        let state = crate::test_state();
        set_auth_policy(
            State(state.clone()),
            Extension(AuthContext::Disabled),
            Json(UpdateAuthPolicyRequest {
                allowed_emails: vec![],
                allowed_domains: vec![],
                default_permissions: vec![],
                oauth_client_id: Some("client-1".to_string()),
                oauth_client_secret: Some("hunter2".to_string()),
            }),
        )
        .await
        .unwrap();

        let stored = auth::load_policy(&state.store).unwrap();
        let sealed = stored.oauth_client_secret.unwrap();
        assert!(sealed.starts_with("v1:"));
        assert_eq!(state.secrets.open_str(&sealed).unwrap(), "hunter2");
    }
}

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::api_key::{ApiKey, ApiKeyPermission, NewApiKeyUsage};
use crate::models::user::{Role, UserProfile};
use crate::store::Store;
use crate::usage::UsageDropId;

/// The principal behind a request. Every protected route receives one of
/// these; capability checks are pure functions of it.
#[derive(Debug, Clone)]
pub enum AuthContext {
    /// Auth is switched off; the process trusts its caller.
    Disabled,
    Anonymous,
    Session(UserProfile),
    ApiKey {
        key: ApiKey,
        perms: Vec<ApiKeyPermission>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ingest,
    Query,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Ingest => "ingest",
            Action::Query => "query",
        }
    }
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        match self {
            AuthContext::Disabled => true,
            AuthContext::Session(profile) => profile.role == Role::Admin && !profile.disabled,
            _ => false,
        }
    }

    /// The user identity owning account-scoped resources. With auth disabled
    /// everything belongs to the single local operator.
    pub fn actor_id(&self) -> Option<&str> {
        match self {
            AuthContext::Disabled => Some("local"),
            AuthContext::Session(profile) => Some(&profile.user_id),
            _ => None,
        }
    }
}

/// Identity established by the external auth provider for a request.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: String,
    pub email: String,
}

/// Boundary to the external auth provider. Raphael only consumes resolved
/// identities; how cookies map to users is the provider's business.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> anyhow::Result<Option<SessionIdentity>>;
}

/// Resolver used when no auth provider is wired up: nobody has a session.
pub struct NoSessions;

#[async_trait]
impl SessionResolver for NoSessions {
    async fn resolve(&self, _headers: &HeaderMap) -> anyhow::Result<Option<SessionIdentity>> {
        Ok(None)
    }
}

// ── API key extraction ──

/// Accepted API key headers, in precedence order after `Authorization`.
const API_KEY_HEADERS: &[&str] = &[
    "x-api-key",
    "x-raphael-api-key",
    "x-raphael-key",
    "x-raphael-token",
];

pub fn api_key_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    for header in API_KEY_HEADERS {
        if let Some(token) = headers.get(*header).and_then(|v| v.to_str().ok()) {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Raw tokens are never stored or logged; lookup goes through this digest.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ── Allowlist policy ──

pub const AUTH_POLICY_KEY: &str = "auth_policy";

/// Stored allowlist + defaults applied to first-login members. The OAuth
/// client secret is sealed with the secrets envelope before it lands here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthPolicy {
    #[serde(default)]
    pub allowed_emails: Vec<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub default_permissions: Vec<DefaultPermission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultPermission {
    pub drop: String,
    #[serde(default)]
    pub can_ingest: bool,
    #[serde(default)]
    pub can_query: bool,
}

impl AuthPolicy {
    /// Empty lists mean an open door; otherwise the email must match an
    /// explicit entry or an allowed domain.
    pub fn allows(&self, email: &str) -> bool {
        if self.allowed_emails.is_empty() && self.allowed_domains.is_empty() {
            return true;
        }
        let email = email.to_lowercase();
        if self
            .allowed_emails
            .iter()
            .any(|e| e.to_lowercase() == email)
        {
            return true;
        }
        let Some(domain) = email.rsplit('@').next().filter(|d| !d.is_empty()) else {
            return false;
        };
        self.allowed_domains
            .iter()
            .any(|d| d.trim_start_matches('@').to_lowercase() == domain)
    }
}

pub fn load_policy(store: &Store) -> ApiResult<AuthPolicy> {
    match store.get_setting(AUTH_POLICY_KEY)? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("stored auth policy is corrupt: {e}"))),
        None => Ok(AuthPolicy::default()),
    }
}

pub fn save_policy(store: &Store, policy: &AuthPolicy) -> ApiResult<()> {
    let raw = serde_json::to_string(policy).map_err(ApiError::internal)?;
    store.set_setting(AUTH_POLICY_KEY, &raw)?;
    Ok(())
}

// ── Context resolution ──

pub async fn resolve_context(state: &AppState, headers: &HeaderMap) -> ApiResult<AuthContext> {
    if !state.cfg.auth_enabled {
        return Ok(AuthContext::Disabled);
    }
    if let Some(token) = api_key_token(headers) {
        let hash = hash_token(&token);
        if let Some((key, perms)) = state.store.find_api_key_by_hash(&hash)? {
            return Ok(AuthContext::ApiKey { key, perms });
        }
        // A bad token is treated as no credential; protected routes 401.
        return Ok(AuthContext::Anonymous);
    }
    if let Some(identity) = state
        .sessions
        .resolve(headers)
        .await
        .map_err(ApiError::internal)?
    {
        let profile = observe_session(state, &identity)?;
        return Ok(AuthContext::Session(profile));
    }
    Ok(AuthContext::Anonymous)
}

/// Side effects of seeing a session: profile upsert, admin-email promotion,
/// allowlist enforcement, default grants for first-login members.
fn observe_session(state: &AppState, identity: &SessionIdentity) -> ApiResult<UserProfile> {
    let store = &state.store;
    let email = identity.email.to_lowercase();
    let is_admin_email = state.cfg.admin_email.as_deref() == Some(email.as_str());

    // Allowlist applies only when OAuth is the sole way in; the configured
    // admin can never be locked out.
    if !state.cfg.password_login_enabled && !is_admin_email {
        let policy = load_policy(store)?;
        if !policy.allows(&email) {
            return Err(ApiError::Forbidden(
                "email is not on the allowlist".to_string(),
            ));
        }
    }

    if store.get_profile(&identity.user_id)?.is_some() {
        store.touch_login(&identity.user_id, &email)?;
        if is_admin_email {
            store.promote_admin(&identity.user_id)?;
        }
        let profile = store
            .get_profile(&identity.user_id)?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("profile vanished mid-request")))?;
        return Ok(profile);
    }

    // First profile ever becomes the admin; so does the configured email.
    let role = if is_admin_email || store.count_profiles()? == 0 {
        Role::Admin
    } else {
        Role::Member
    };
    let profile = store.insert_profile(&identity.user_id, &email, role)?;

    if profile.role == Role::Member && !store.has_any_permissions(&profile.user_id)? {
        grant_default_permissions(store, &profile.user_id)?;
    }
    Ok(profile)
}

fn grant_default_permissions(store: &Store, user_id: &str) -> ApiResult<()> {
    let policy = load_policy(store)?;
    if policy.default_permissions.is_empty() {
        return Ok(());
    }
    let mut grants = Vec::new();
    for perm in &policy.default_permissions {
        // Unknown drops in the policy are skipped, not created.
        if let Some(drop_id) = store.resolve_drop(&perm.drop, false)? {
            grants.push((drop_id, perm.can_ingest, perm.can_query));
        }
    }
    store.replace_user_permissions(user_id, &grants)?;
    Ok(())
}

// ── Policy predicates ──

pub fn require_auth(ctx: &AuthContext) -> ApiResult<()> {
    match ctx {
        AuthContext::Disabled | AuthContext::ApiKey { .. } => Ok(()),
        AuthContext::Session(profile) if !profile.disabled => Ok(()),
        AuthContext::Session(_) => Err(ApiError::Forbidden("account is disabled".to_string())),
        AuthContext::Anonymous => Err(ApiError::Unauthenticated),
    }
}

pub fn require_admin(ctx: &AuthContext) -> ApiResult<()> {
    match ctx {
        AuthContext::Disabled => Ok(()),
        AuthContext::Session(profile) if profile.role == Role::Admin && !profile.disabled => Ok(()),
        AuthContext::Anonymous => Err(ApiError::Unauthenticated),
        _ => Err(ApiError::Forbidden("admin role required".to_string())),
    }
}

/// Account routes are for humans; API keys cannot mint more API keys.
pub fn require_session(ctx: &AuthContext) -> ApiResult<()> {
    match ctx {
        AuthContext::Disabled => Ok(()),
        AuthContext::Session(profile) if !profile.disabled => Ok(()),
        AuthContext::Session(_) => Err(ApiError::Forbidden("account is disabled".to_string())),
        AuthContext::ApiKey { .. } => Err(ApiError::Forbidden(
            "a session is required for this route".to_string(),
        )),
        AuthContext::Anonymous => Err(ApiError::Unauthenticated),
    }
}

pub fn require_drop_access(
    store: &Store,
    ctx: &AuthContext,
    drop_id: i64,
    action: Action,
) -> ApiResult<()> {
    match ctx {
        AuthContext::Disabled => Ok(()),
        AuthContext::Anonymous => Err(ApiError::Unauthenticated),
        AuthContext::Session(profile) => {
            if profile.disabled {
                return Err(ApiError::Forbidden("account is disabled".to_string()));
            }
            if profile.role == Role::Admin {
                return Ok(());
            }
            let allowed = store
                .user_drop_permission(&profile.user_id, drop_id)?
                .map(|perm| match action {
                    Action::Ingest => perm.can_ingest,
                    Action::Query => perm.can_query,
                })
                .unwrap_or(false);
            if allowed {
                Ok(())
            } else {
                Err(ApiError::Forbidden(format!(
                    "missing {} permission for this drop",
                    action.as_str()
                )))
            }
        }
        AuthContext::ApiKey { perms, .. } => {
            let allowed = perms.iter().any(|perm| {
                perm.drop_id == drop_id
                    && match action {
                        Action::Ingest => perm.can_ingest,
                        Action::Query => perm.can_query,
                    }
            });
            if allowed {
                Ok(())
            } else {
                Err(ApiError::Forbidden(format!(
                    "api key lacks {} capability for this drop",
                    action.as_str()
                )))
            }
        }
    }
}

// ── Middleware ──

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// Resolves the principal for every request and, for API-key principals,
/// appends exactly one usage row once the response is complete. This is the
/// only usage-logging site.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let ctx = match resolve_context(&state, req.headers()).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let api_key_id = match &ctx {
        AuthContext::ApiKey { key, .. } => Some(key.id.clone()),
        _ => None,
    };
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let ip = client_ip(req.headers());
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let usage_drop = UsageDropId::default();
    req.extensions_mut().insert(ctx);
    req.extensions_mut().insert(usage_drop.clone());

    let response = next.run(req).await;

    if let Some(api_key_id) = api_key_id {
        state.usage.log(NewApiKeyUsage {
            api_key_id,
            method,
            path,
            status: response.status().as_u16(),
            drop_id: usage_drop.get(),
            ip,
            user_agent,
        });
    }
    response
}

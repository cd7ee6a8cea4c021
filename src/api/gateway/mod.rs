//! Request gateway: bearer-token principals, admin gating and body decoding.
//!
//! Flow Overview:
//! 1) Parse the bearer access token and resolve the user.
//! 2) Reject tokens minted before the last password change and disabled accounts.
//! 3) Admin routes additionally require role `admin`, an unlocked MFA scope when 2FA is on,
//!    and the route's permission code unless the caller is the primary admin.

mod mask;
mod request;

pub use mask::{looks_like_phone, mask_email, mask_phone};
pub use request::{
    ClientIp, IDEMPOTENCY_KEY, callback_base_url, client_ip, detect_device, idempotency_key,
};

use super::{
    HandlerDeps,
    error::{ApiError, ApiResult},
};
use crate::{
    domain::User,
    error::ServiceError,
    settings::AuthSettings,
    token::{Claims, TokenKind},
};
use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
    http::{HeaderMap, header::AUTHORIZATION},
};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, error};
use utoipa::IntoParams;

/// Authenticated caller resolved from an access token.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user: User,
    pub claims: Claims,
}

impl Principal {
    #[must_use]
    pub fn user_id(&self) -> i64 {
        self.user.id
    }

    #[must_use]
    pub fn mfa(&self) -> u8 {
        self.claims.mfa
    }
}

/// Token from `Authorization: Bearer <token>`.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Resolve the bearer access token into a principal.
///
/// # Errors
/// 401 `invalid token` for missing, malformed, expired or stale tokens; 403 `user disabled`.
pub async fn require_user(headers: &HeaderMap, deps: &HandlerDeps) -> ApiResult<Principal> {
    let raw = bearer_token(headers).ok_or_else(|| ApiError::unauthorized("invalid token"))?;
    let claims = deps.tokens.parse(raw, TokenKind::Access).map_err(|err| {
        debug!("Access token rejected: {err}");
        ApiError::unauthorized("invalid token")
    })?;
    let user = match deps.auth.get_user(claims.user_id).await {
        Ok(user) => user,
        Err(ServiceError::NotFound) => return Err(ApiError::unauthorized("invalid token")),
        Err(err) => return Err(err.into()),
    };
    if claims.issued_before(user.password_changed_at) {
        return Err(ApiError::unauthorized("invalid token"));
    }
    if !user.is_active() {
        return Err(ApiError::forbidden("user disabled"));
    }
    Ok(Principal { user, claims })
}

/// Admin role check without the MFA gate; used by the admin 2FA endpoints themselves.
///
/// # Errors
/// Everything [`require_user`] returns, plus 403 `admin required`.
pub async fn require_admin_token(headers: &HeaderMap, deps: &HandlerDeps) -> ApiResult<Principal> {
    let principal = require_user(headers, deps).await?;
    if !principal.user.is_admin() || principal.claims.role() != principal.user.role {
        return Err(ApiError::forbidden("admin required"));
    }
    Ok(principal)
}

/// Full admin gate: role, MFA scope and an optional permission code.
///
/// # Errors
/// 403 with `admin_2fa_bind_required` / `admin_2fa_required` codes for locked scopes,
/// 403 `permission denied`, or 500 `permission check failed`.
pub async fn require_admin(
    headers: &HeaderMap,
    deps: &HandlerDeps,
    permission: Option<&str>,
) -> ApiResult<Principal> {
    let principal = require_admin_token(headers, deps).await?;
    let settings = load_auth_settings(deps).await?;
    if settings.two_fa_enabled && !principal.claims.mfa_unlocked() {
        return Err(if principal.user.totp_enabled {
            ApiError::forbidden("2fa required").with_code("admin_2fa_required")
        } else {
            ApiError::forbidden("2fa bind required").with_code("admin_2fa_bind_required")
        });
    }
    if let Some(code) = permission {
        check_permission(deps, principal.user_id(), code).await?;
    }
    Ok(principal)
}

async fn check_permission(deps: &HandlerDeps, user_id: i64, code: &str) -> ApiResult<()> {
    let failed = |err: ServiceError| {
        error!(user_id, permission = code, "Permission check failed: {err}");
        ApiError::internal("permission check failed")
    };
    if deps.permissions.is_primary_admin(user_id).await.map_err(failed)? {
        return Ok(());
    }
    if deps.permissions.has_permission(user_id, code).await.map_err(failed)? {
        Ok(())
    } else {
        Err(ApiError::forbidden("permission denied"))
    }
}

/// Settings are read on every request; nothing is cached between calls.
///
/// # Errors
/// Propagates the settings collaborator failure.
pub async fn load_auth_settings(deps: &HandlerDeps) -> ApiResult<AuthSettings> {
    AuthSettings::load(deps.settings.as_ref())
        .await
        .map_err(ApiError::from)
}

/// `limit`/`offset` query parameters shared by list endpoints.
#[derive(Debug, Clone, Copy, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct Paging {
    /// Page size, 1 to 100 (default 20).
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Paging {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MAX_LIMIT: usize = 100;

    #[must_use]
    pub fn limit(self) -> usize {
        self.limit
            .filter(|limit| *limit > 0)
            .map_or(Self::DEFAULT_LIMIT, |limit| limit.min(Self::MAX_LIMIT))
    }

    #[must_use]
    pub fn offset(self) -> usize {
        self.offset.unwrap_or(0)
    }
}

/// JSON body decoder that answers 400 `invalid body` instead of axum's plain-text rejection.
///
/// An empty body decodes as `{}` so payloads made of optional fields may be omitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|rejection| {
            debug!("Failed to read request body: {rejection}");
            ApiError::bad_request("invalid body")
        })?;
        let raw: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &bytes
        };
        serde_json::from_slice(raw).map(Self).map_err(|err| {
            debug!("Failed to decode JSON body: {err}");
            ApiError::bad_request("invalid body")
        })
    }
}

//! Admin sign-in and MFA scope upgrade.
//!
//! Flow Overview:
//! 1) `login` validates the requested admin path against the configured one before any
//!    credential check, then applies the admin cooldown. Non-admin accounts count as failures.
//! 2) The minted pair has `mfa=0`. With 2FA on, the admin either enrolls (`2fa/setup` +
//!    `2fa/confirm`) or calls `2fa/unlock` with a TOTP code to get an `mfa=1` pair.
//! 3) Consecutive unlock failures disable the account once the threshold is reached.

use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{ClientIp, JsonBody, load_auth_settings, require_admin_token},
    handlers::{
        auth::{
            login::{LoginResponse, RefreshRequest, after_login, rotate},
            mint_pair, required,
            security::{TwoFaCodeRequest, TwoFaSetupRequest, confirm_totp, setup_totp},
        },
        dto::OkResponse,
    },
};
use crate::domain::{TotpSetup, UserStatus};
use crate::error::ServiceError;
use crate::guards::{
    ADMIN_2FA_FAILURE_THRESHOLD, admin_2fa_key, admin_login_key, admin_path_matches,
    effective_admin_path, validate_admin_path,
};
use crate::token::TokenPair;
use axum::{Json, extract::Extension, http::HeaderMap};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

/// Setting holding the configured admin path segment.
pub const ADMIN_PATH_SETTING: &str = "admin_path";

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct AdminLoginRequest {
    #[serde(alias = "account")]
    pub username: String,
    pub password: String,
    /// Path segment the console was opened under; empty means the default.
    pub admin_path: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct UnlockRequest {
    pub totp_code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UnlockResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub mfa_unlocked: bool,
}

async fn check_admin_path(deps: &HandlerDeps, requested: &str) -> ApiResult<()> {
    let requested = requested.trim();
    if !requested.is_empty() {
        validate_admin_path(requested).map_err(|err| ApiError::bad_request(err.to_string()))?;
    }
    let configured = effective_admin_path(deps.settings.get(ADMIN_PATH_SETTING).await?.as_deref());
    if admin_path_matches(Some(requested), &configured) {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin path mismatch"))
    }
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/auth/login",
    request_body = AdminLoginRequest,
    responses(
        (status = 200, description = "Signed in with an `mfa=0` pair.", body = LoginResponse),
        (status = 400, description = "Malformed admin path or missing field."),
        (status = 401, description = "Invalid credentials."),
        (status = 403, description = "Admin path mismatch."),
        (status = 429, description = "Cooling down.", body = crate::api::ErrorBody),
    ),
    tag = "admin"
)]
pub async fn login(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    ClientIp(ip): ClientIp,
    JsonBody(payload): JsonBody<AdminLoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    check_admin_path(&deps, &payload.admin_path).await?;
    let account = required(&payload.username, "username")?;
    required(&payload.password, "password")?;

    let key = admin_login_key(account);
    let now = Utc::now();
    let guards = &deps.guards;
    if let Some(until) = guards.login_cooldown.is_cooling_down(&key, now) {
        return Err(ApiError::locked(until));
    }

    let user = match deps.auth.login(account, &payload.password).await {
        Ok(user) if user.is_admin() => Some(user),
        Ok(_) | Err(ServiceError::InvalidCredentials | ServiceError::Forbidden) => None,
        Err(err) => return Err(err.into()),
    };
    let Some(user) = user else {
        let outcome = guards.login_cooldown.register_failure(
            &key,
            guards.admin_login_threshold,
            guards.admin_login_cooldown,
            now,
        );
        warn!(failures = outcome.failures, "Admin login rejected");
        return Err(match outcome.locked_until {
            Some(until) if outcome.locked => ApiError::locked(until),
            _ => ApiError::unauthorized("invalid credentials"),
        });
    };
    guards.login_cooldown.reset(&key);

    let settings = load_auth_settings(&deps).await?;
    after_login(&deps, &settings, &user, &ip).await;
    let tokens = mint_pair(&deps, user.id, user.role, 0)?;
    info!(user_id = user.id, ip = %ip, "Admin logged in");

    Ok(Json(LoginResponse::new(tokens, &settings, &user)))
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated admin pair; MFA scope is carried over.", body = TokenPair),
        (status = 401, description = "Invalid refresh token, or one not issued to an admin."),
        (status = 403, description = "Account disabled."),
    ),
    tag = "admin"
)]
pub async fn refresh(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    if payload.refresh_token.trim().is_empty() {
        return Err(ApiError::unauthorized("invalid refresh token"));
    }
    rotate(&deps, &payload.refresh_token, true).await.map(Json)
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/auth/2fa/setup",
    request_body = TwoFaSetupRequest,
    responses(
        (status = 200, description = "Pending TOTP secret.", body = TotpSetup),
        (status = 400, description = "Invalid password or current code."),
        (status = 403, description = "2FA, binding or rebinding disabled."),
    ),
    tag = "admin"
)]
pub async fn two_fa_setup(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<TwoFaSetupRequest>,
) -> ApiResult<Json<TotpSetup>> {
    let principal = require_admin_token(&headers, &deps).await?;
    let settings = load_auth_settings(&deps).await?;
    setup_totp(&deps, &settings, &principal.user, &payload)
        .await
        .map(Json)
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/auth/2fa/confirm",
    request_body = TwoFaCodeRequest,
    responses(
        (status = 200, description = "Secret activated.", body = OkResponse),
        (status = 400, description = "Invalid code."),
    ),
    tag = "admin"
)]
pub async fn two_fa_confirm(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<TwoFaCodeRequest>,
) -> ApiResult<Json<OkResponse>> {
    let principal = require_admin_token(&headers, &deps).await?;
    confirm_totp(&deps, principal.user_id(), &payload.code).await?;
    Ok(Json(OkResponse::ok()))
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/auth/2fa/unlock",
    request_body = UnlockRequest,
    responses(
        (status = 200, description = "`mfa=1` pair.", body = UnlockResponse),
        (status = 400, description = "Invalid 2FA code."),
        (status = 403, description = "2FA not enrolled, or account disabled after repeated failures."),
    ),
    tag = "admin"
)]
pub async fn two_fa_unlock(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<UnlockRequest>,
) -> ApiResult<Json<UnlockResponse>> {
    let principal = require_admin_token(&headers, &deps).await?;
    let user = &principal.user;
    if !user.totp_enabled {
        return Err(ApiError::forbidden("2fa not enabled"));
    }

    let key = admin_2fa_key(user.id);
    if let Err(err) = deps.auth.verify_totp(user.id, payload.totp_code.trim()).await {
        debug!(user_id = user.id, "Admin 2FA code rejected: {err}");
        let failures = deps.guards.admin_2fa.register_failure(&key);
        if failures >= ADMIN_2FA_FAILURE_THRESHOLD {
            deps.admin
                .update_admin_status(user.id, user.id, UserStatus::Disabled)
                .await
                .map_err(|err| {
                    error!(user_id = user.id, "Failed to disable admin: {err}");
                    ApiError::internal(err.to_string())
                })?;
            deps.guards.admin_2fa.reset(&key);
            warn!(
                user_id = user.id,
                failures, "Admin disabled after repeated 2FA failures"
            );
            return Err(ApiError::forbidden("user disabled"));
        }
        return Err(ApiError::bad_request("invalid 2fa code"));
    }
    deps.guards.admin_2fa.reset(&key);

    let tokens = mint_pair(&deps, user.id, user.role, 1)?;
    info!(user_id = user.id, "Admin MFA scope unlocked");
    Ok(Json(UnlockResponse {
        tokens,
        mfa_unlocked: true,
    }))
}

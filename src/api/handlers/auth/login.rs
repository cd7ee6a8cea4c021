//! Login, refresh and logout.
//!
//! Flow Overview:
//! 1) The per-IP login limiter and the optional captcha run before any credential check.
//! 2) A cooling-down account key answers 429 with `locked_until` without touching credentials.
//! 3) Rejected credentials register a failure; reaching the threshold locks the key.
//! 4) On success the key is cleared, the security hook runs and an `mfa=0` pair is minted.
//!    The response tells the client whether 2FA must be bound or unlocked next.

use super::{CaptchaFields, mint_pair, required, send_security_message, verify_captcha};
use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{ClientIp, JsonBody, load_auth_settings},
    handlers::dto::{OkResponse, UserView},
};
use crate::domain::{Channel, GeoLocation, User, UserRole};
use crate::error::ServiceError;
use crate::guards::{RateLimitAction, USER_LOGIN_FAILURE_THRESHOLD, user_login_cooldown, user_login_key};
use crate::settings::{AuthSettings, CaptchaProvider};
use crate::token::{TokenKind, TokenPair};
use axum::{Json, extract::Extension};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct LoginRequest {
    /// Username, email or phone number.
    #[serde(alias = "account")]
    pub username: String,
    pub password: String,
    #[serde(flatten)]
    pub captcha: CaptchaFields,
}

/// Token pair plus the next step the client must take for 2FA.
#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub mfa_required: bool,
    pub mfa_bind_required: bool,
    pub mfa_unlocked: bool,
    pub user: UserView,
}

impl LoginResponse {
    pub(crate) fn new(tokens: TokenPair, settings: &AuthSettings, user: &User) -> Self {
        let (mfa_required, mfa_bind_required, mfa_unlocked) = if !settings.two_fa_enabled {
            (false, false, true)
        } else if user.totp_enabled {
            (true, false, false)
        } else {
            (false, true, false)
        };
        Self {
            tokens,
            mfa_required,
            mfa_bind_required,
            mfa_unlocked,
            user: UserView::from(user),
        }
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Public subset of the auth settings consumed by the login and register pages.
#[derive(Debug, Serialize, ToSchema)]
pub struct AuthSettingsView {
    pub register_enabled: bool,
    pub register_required_fields: Vec<String>,
    pub register_email_required: bool,
    pub register_verify_channels: Vec<Channel>,
    pub register_captcha_enabled: bool,
    pub login_captcha_enabled: bool,
    pub captcha_provider: CaptchaProvider,
    pub password_min_len: usize,
    pub password_require_upper: bool,
    pub password_require_lower: bool,
    pub password_require_number: bool,
    pub password_require_symbol: bool,
    pub password_reset_enabled: bool,
    pub password_reset_channels: Vec<Channel>,
    pub email_bind_enabled: bool,
    pub phone_bind_enabled: bool,
    pub two_fa_enabled: bool,
    pub two_fa_bind_enabled: bool,
    pub two_fa_rebind_enabled: bool,
}

impl From<AuthSettings> for AuthSettingsView {
    fn from(s: AuthSettings) -> Self {
        Self {
            register_enabled: s.register_enabled,
            register_required_fields: s.register_required_fields,
            register_email_required: s.register_email_required,
            register_verify_channels: s.register_verify_channels,
            register_captcha_enabled: s.register_captcha_enabled,
            login_captcha_enabled: s.login_captcha_enabled,
            captcha_provider: s.captcha_provider,
            password_min_len: s.password_min_len,
            password_require_upper: s.password_require_upper,
            password_require_lower: s.password_require_lower,
            password_require_number: s.password_require_number,
            password_require_symbol: s.password_require_symbol,
            password_reset_enabled: s.password_reset_enabled,
            password_reset_channels: s.password_reset_channels,
            email_bind_enabled: s.email_bind_enabled,
            phone_bind_enabled: s.phone_bind_enabled,
            two_fa_enabled: s.two_fa_enabled,
            two_fa_bind_enabled: s.two_fa_bind_enabled,
            two_fa_rebind_enabled: s.two_fa_rebind_enabled,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in.", body = LoginResponse),
        (status = 400, description = "Missing field or captcha failure."),
        (status = 401, description = "Invalid credentials."),
        (status = 403, description = "User disabled."),
        (status = 429, description = "Rate limited or cooling down.", body = crate::api::ErrorBody),
    ),
    tag = "auth"
)]
pub async fn login(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    ClientIp(ip): ClientIp,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let settings = load_auth_settings(&deps).await?;
    let account = required(&payload.username, "username")?;
    required(&payload.password, "password")?;

    if settings.login_rate_limit_enabled {
        let key = format!("login:{}:{ip}", account.to_lowercase());
        let allowed = deps
            .guards
            .limiters
            .check(
                RateLimitAction::Login,
                &key,
                settings.login_rate_limit_max,
                settings.login_rate_limit_window,
            )
            .is_allowed();
        if !allowed {
            return Err(ApiError::too_many("too many attempts"));
        }
    }
    if settings.login_captcha_enabled {
        verify_captcha(&deps, &settings, &payload.captcha).await?;
    }

    let cooldown_key = user_login_key(account);
    let now = Utc::now();
    if let Some(until) = deps.guards.login_cooldown.is_cooling_down(&cooldown_key, now) {
        return Err(ApiError::locked(until));
    }

    let user = match deps.auth.login(account, &payload.password).await {
        Ok(user) => user,
        Err(ServiceError::InvalidCredentials) => {
            let outcome = deps.guards.login_cooldown.register_failure(
                &cooldown_key,
                USER_LOGIN_FAILURE_THRESHOLD,
                user_login_cooldown(),
                now,
            );
            debug!(failures = outcome.failures, "Login rejected");
            return Err(match outcome.locked_until {
                Some(until) if outcome.locked => ApiError::locked(until),
                _ => ApiError::unauthorized("invalid credentials"),
            });
        }
        Err(ServiceError::Forbidden) => return Err(ApiError::forbidden("user disabled")),
        Err(err) => return Err(err.into()),
    };
    deps.guards.login_cooldown.reset(&cooldown_key);

    after_login(&deps, &settings, &user, &ip).await;
    let tokens = mint_pair(&deps, user.id, user.role, 0)?;
    info!(user_id = user.id, "User logged in");

    Ok(Json(LoginResponse::new(tokens, &settings, &user)))
}

/// Security notice on first login or IP change, then the last-login record.
///
/// Failures here never fail the login.
const UNKNOWN_CITY: &str = "unknown";
const DEFAULT_TZ: &str = "GMT+00:00";

/// City and offset for a login alert; lookup failures fall back to placeholders.
pub(crate) async fn login_location(deps: &HandlerDeps, settings: &AuthSettings, ip: &str) -> GeoLocation {
    let mut location = match deps.geo.resolve(ip, &settings.geoip_mmdb_path).await {
        Ok(location) => location,
        Err(err) => {
            debug!(ip, "Login location unresolved: {err}");
            GeoLocation::default()
        }
    };
    if location.city.trim().is_empty() {
        location.city = UNKNOWN_CITY.to_string();
    }
    if location.tz.trim().is_empty() {
        location.tz = DEFAULT_TZ.to_string();
    }
    location
}

pub(crate) async fn after_login(deps: &HandlerDeps, settings: &AuthSettings, user: &User, ip: &str) {
    let now = Utc::now();
    if settings.login_notify_enabled {
        let first = user.last_login_at.is_none();
        let ip_changed = !ip.is_empty() && !user.last_login_ip.is_empty() && user.last_login_ip != ip;
        let reason = if first && settings.login_notify_on_first {
            Some("first_login")
        } else if ip_changed && settings.login_notify_on_ip_change {
            Some("ip_change")
        } else {
            None
        };
        if let Some(reason) = reason {
            let location = login_location(deps, settings, ip).await;
            let vars = [
                ("reason", reason.to_string()),
                ("ip", ip.to_string()),
                ("previous_ip", user.last_login_ip.clone()),
                ("city", location.city),
                ("time", format!("{} ({})", now.format("%m/%d %H:%M"), location.tz)),
                ("tz", location.tz),
            ];
            if let Err(err) = send_security_message(
                deps,
                user,
                &settings.login_notify_channels,
                "login_security_alert",
                &vars,
            )
            .await
            {
                warn!(user_id = user.id, reason, "Login notice not delivered: {err}");
            }
        }
    }
    if let Err(err) = deps.auth.record_login(user.id, ip, now).await {
        warn!(user_id = user.id, "Failed to record login: {err}");
    }
}

/// Rotates both tokens, copying the MFA scope of the refresh token.
///
/// # Errors
/// 401 `invalid refresh token` (including a non-admin token when `admin_only`), or 403
/// `user disabled`.
pub(crate) async fn rotate(deps: &HandlerDeps, raw: &str, admin_only: bool) -> ApiResult<TokenPair> {
    let invalid = || ApiError::unauthorized("invalid refresh token");
    let claims = deps
        .tokens
        .parse(raw.trim(), TokenKind::Refresh)
        .map_err(|err| {
            debug!("Refresh token rejected: {err}");
            invalid()
        })?;
    if admin_only && claims.role() != UserRole::Admin {
        return Err(invalid());
    }
    let user = match deps.auth.get_user(claims.user_id).await {
        Ok(user) => user,
        Err(ServiceError::NotFound) => return Err(invalid()),
        Err(err) => return Err(err.into()),
    };
    if claims.issued_before(user.password_changed_at) {
        return Err(invalid());
    }
    if admin_only && !user.is_admin() {
        return Err(invalid());
    }
    if !user.is_active() {
        return Err(ApiError::forbidden("user disabled"));
    }
    mint_pair(deps, user.id, user.role, claims.mfa)
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated token pair.", body = TokenPair),
        (status = 401, description = "Invalid refresh token."),
    ),
    tag = "auth"
)]
pub async fn refresh(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    if payload.refresh_token.trim().is_empty() {
        return Err(ApiError::unauthorized("invalid refresh token"));
    }
    rotate(&deps, &payload.refresh_token, false).await.map(Json)
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    responses(
        (status = 200, description = "Logged out; tokens are stateless.", body = OkResponse),
    ),
    tag = "auth"
)]
pub async fn logout() -> Json<OkResponse> {
    Json(OkResponse::ok())
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/settings",
    responses(
        (status = 200, description = "Auth settings relevant to the frontend.", body = AuthSettingsView),
    ),
    tag = "auth"
)]
pub async fn auth_settings(
    Extension(deps): Extension<Arc<HandlerDeps>>,
) -> ApiResult<Json<AuthSettingsView>> {
    let settings = load_auth_settings(&deps).await?;
    Ok(Json(AuthSettingsView::from(settings)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{UserRole, UserStatus};
    use crate::settings::SettingsSnapshot;

    fn user(totp_enabled: bool) -> User {
        User {
            id: 7,
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            phone: String::new(),
            qq: String::new(),
            role: UserRole::User,
            status: UserStatus::Active,
            totp_enabled,
            last_login_ip: String::new(),
            last_login_at: None,
            permission_group_id: None,
            user_tier_id: None,
            tier_expire_at: None,
            password_changed_at: None,
            created_at: Utc::now(),
        }
    }

    fn pair() -> TokenPair {
        TokenPair {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_in: 86_400,
        }
    }

    #[test]
    fn mfa_flags_follow_enrollment() {
        let on = AuthSettings::from_snapshot(&SettingsSnapshot::default());
        let off = AuthSettings::from_snapshot(&SettingsSnapshot::from_pairs([(
            "auth_2fa_enabled",
            "false",
        )]));

        let bind = LoginResponse::new(pair(), &on, &user(false));
        assert!(bind.mfa_bind_required && !bind.mfa_required && !bind.mfa_unlocked);

        let unlock = LoginResponse::new(pair(), &on, &user(true));
        assert!(unlock.mfa_required && !unlock.mfa_bind_required);

        let open = LoginResponse::new(pair(), &off, &user(true));
        assert!(open.mfa_unlocked && !open.mfa_required);
    }

    #[test]
    fn response_flattens_tokens() -> anyhow::Result<()> {
        let on = AuthSettings::from_snapshot(&SettingsSnapshot::default());
        let json = serde_json::to_value(LoginResponse::new(pair(), &on, &user(false)))?;
        assert_eq!(json["access_token"], "a");
        assert_eq!(json["expires_in"], 86_400);
        assert_eq!(json["user"]["email_masked"], "a*****e@example.com");
        Ok(())
    }
}

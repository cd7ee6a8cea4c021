//! Password reset through a verified contact channel.
//!
//! Flow Overview:
//! 1) `options` resolves the account and lists the channels it can receive codes on.
//! 2) `send-code` issues a `password_reset` code. SMS requires the full phone number unless the
//!    account itself was the phone.
//! 3) `verify-code` trades a valid code for a single-use reset ticket.
//! 4) `confirm` consumes the ticket, rotates the password and returns a fresh session. Rotating the
//!    password advances `password_changed_at`, which invalidates older tokens.

use super::{find_user_by_account, issue_ticket, mint_pair, required, send_security_message};
use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{ClientIp, JsonBody, load_auth_settings, mask_email, mask_phone},
    handlers::dto::UserBrief,
};
use crate::domain::{Channel, TicketPurpose, User};
use crate::guards::RateLimitAction;
use crate::settings::AuthSettings;
use axum::{Json, extract::Extension};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::info;
use utoipa::ToSchema;

const RESET_PURPOSE: &str = "password_reset";
const RESET_TICKET_BYTES: usize = 32;
const RESET_TICKET_TTL_SECONDS: i64 = 15 * 60;
const LIMIT_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ResetOptionsRequest {
    pub account: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetOptionsResponse {
    pub user_id: i64,
    pub account: String,
    pub channels: Vec<Channel>,
    pub masked_email: String,
    pub masked_phone: String,
    pub has_email: bool,
    pub has_phone: bool,
    pub sms_requires_phone_full: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ResetSendCodeRequest {
    pub account: String,
    pub channel: String,
    pub phone_full: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetSendCodeResponse {
    pub ok: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ResetVerifyRequest {
    pub account: String,
    pub channel: String,
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetVerifyResponse {
    pub reset_ticket: String,
    pub expires_in: i64,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ResetConfirmRequest {
    pub reset_ticket: String,
    pub new_password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetConfirmResponse {
    pub ok: bool,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user: UserBrief,
}

async fn enabled_settings(deps: &HandlerDeps) -> ApiResult<AuthSettings> {
    let settings = load_auth_settings(deps).await?;
    if settings.password_reset_enabled {
        Ok(settings)
    } else {
        Err(ApiError::forbidden("password reset disabled"))
    }
}

async fn resolve_account(deps: &HandlerDeps, account: &str) -> ApiResult<User> {
    find_user_by_account(deps, account)
        .await?
        .ok_or_else(|| ApiError::not_found("account not found"))
}

fn limited(deps: &HandlerDeps, action: RateLimitAction, key: &str, max: u32) -> bool {
    !deps
        .guards
        .limiters
        .check(action, key, max, LIMIT_WINDOW)
        .is_allowed()
}

/// Channels the account can actually receive a code on.
fn offered_channels(settings: &AuthSettings, user: &User) -> Vec<Channel> {
    let mut channels = Vec::with_capacity(2);
    if settings.password_reset_channels.contains(&Channel::Email) && user.email_bound() {
        channels.push(Channel::Email);
    }
    if settings.password_reset_channels.contains(&Channel::Sms) && user.phone_bound() {
        channels.push(Channel::Sms);
    }
    channels
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/password-reset/options",
    request_body = ResetOptionsRequest,
    responses(
        (status = 200, description = "Channels available for the account.", body = ResetOptionsResponse),
        (status = 403, description = "Password reset disabled."),
        (status = 404, description = "Account not found."),
    ),
    tag = "auth"
)]
pub async fn options(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<ResetOptionsRequest>,
) -> ApiResult<Json<ResetOptionsResponse>> {
    let settings = enabled_settings(&deps).await?;
    let user = resolve_account(&deps, &payload.account).await?;
    let account = payload.account.trim();

    Ok(Json(ResetOptionsResponse {
        user_id: user.id,
        account: user.username.clone(),
        channels: offered_channels(&settings, &user),
        masked_email: mask_email(&user.email),
        masked_phone: mask_phone(&user.phone),
        has_email: user.email_bound(),
        has_phone: user.phone_bound(),
        sms_requires_phone_full: !account.is_empty() && account != user.phone.trim(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/password-reset/send-code",
    request_body = ResetSendCodeRequest,
    responses(
        (status = 200, description = "Code sent.", body = ResetSendCodeResponse),
        (status = 400, description = "Channel, phone or delivery problem."),
        (status = 403, description = "Password reset disabled."),
        (status = 404, description = "Account not found."),
        (status = 429, description = "Too many requests."),
    ),
    tag = "auth"
)]
pub async fn send_code(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    ClientIp(ip): ClientIp,
    JsonBody(payload): JsonBody<ResetSendCodeRequest>,
) -> ApiResult<Json<ResetSendCodeResponse>> {
    let settings = enabled_settings(&deps).await?;
    let user = resolve_account(&deps, &payload.account).await?;
    let channel = Channel::parse(&payload.channel)
        .filter(|channel| settings.password_reset_channels.contains(channel))
        .ok_or_else(|| ApiError::bad_request("channel not enabled"))?;

    let receiver = match channel {
        Channel::Email => {
            if !user.email_bound() {
                return Err(ApiError::bad_request("email not bound"));
            }
            user.email.trim().to_string()
        }
        Channel::Sms => {
            if !user.phone_bound() {
                return Err(ApiError::bad_request("phone not bound"));
            }
            let phone = user.phone.trim();
            let phone_full = payload.phone_full.trim();
            if phone_full.is_empty() && payload.account.trim() != phone {
                return Err(ApiError::bad_request("phone_full required"));
            }
            if !phone_full.is_empty() && phone_full != phone {
                return Err(ApiError::bad_request("phone mismatch"));
            }
            phone.to_string()
        }
    };

    let receiver_key = match channel {
        Channel::Email => receiver.to_lowercase(),
        Channel::Sms => receiver.clone(),
    };
    if limited(
        &deps,
        RateLimitAction::ResetCode,
        &format!("password_reset_send:ip:{ip}"),
        10,
    ) || limited(
        &deps,
        RateLimitAction::ResetCode,
        &format!("password_reset_send:{channel}:{receiver_key}"),
        3,
    ) {
        return Err(ApiError::too_many("too many requests"));
    }

    let code = deps
        .auth
        .create_verification_code(
            channel,
            &receiver,
            RESET_PURPOSE,
            settings.code_policy(channel, settings.password_reset_verify_ttl),
        )
        .await?;
    let contact_var = match channel {
        Channel::Email => ("email", user.email.clone()),
        Channel::Sms => ("phone", user.phone.clone()),
    };
    send_security_message(
        &deps,
        &user,
        &[channel],
        "password_reset_verify_code",
        &[("code", code), contact_var],
    )
    .await?;

    Ok(Json(ResetSendCodeResponse { ok: true }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/password-reset/verify-code",
    request_body = ResetVerifyRequest,
    responses(
        (status = 200, description = "Reset ticket issued.", body = ResetVerifyResponse),
        (status = 400, description = "Invalid code or unknown receiver."),
        (status = 403, description = "Password reset disabled."),
        (status = 404, description = "Account not found."),
        (status = 429, description = "Too many requests."),
    ),
    tag = "auth"
)]
pub async fn verify_code(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    ClientIp(ip): ClientIp,
    JsonBody(payload): JsonBody<ResetVerifyRequest>,
) -> ApiResult<Json<ResetVerifyResponse>> {
    enabled_settings(&deps).await?;
    let account_key = payload.account.trim().to_lowercase();
    let channel_key = payload.channel.trim().to_lowercase();
    if limited(
        &deps,
        RateLimitAction::ResetVerify,
        &format!("password_reset_verify:ip:{ip}"),
        20,
    ) || limited(
        &deps,
        RateLimitAction::ResetVerify,
        &format!("password_reset_verify:{channel_key}:{account_key}"),
        8,
    ) {
        return Err(ApiError::too_many("too many requests"));
    }

    let user = resolve_account(&deps, &payload.account).await?;
    let channel = Channel::parse(&channel_key);
    let receiver = match channel {
        Some(Channel::Email) => user.email.trim(),
        Some(Channel::Sms) => user.phone.trim(),
        None => "",
    };
    let Some(channel) = channel.filter(|_| !receiver.is_empty()) else {
        return Err(ApiError::bad_request("receiver not found"));
    };
    deps.auth
        .verify_verification_code(channel, receiver, RESET_PURPOSE, &payload.code)
        .await
        .map_err(|_| ApiError::bad_request("invalid verification code"))?;

    let ticket = issue_ticket(
        &deps,
        user.id,
        TicketPurpose::PasswordReset,
        Some(channel),
        receiver,
        RESET_TICKET_BYTES,
        chrono::Duration::seconds(RESET_TICKET_TTL_SECONDS),
    )
    .await?;

    Ok(Json(ResetVerifyResponse {
        reset_ticket: ticket.token,
        expires_in: RESET_TICKET_TTL_SECONDS,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/password-reset/confirm",
    request_body = ResetConfirmRequest,
    responses(
        (status = 200, description = "Password rotated; fresh session.", body = ResetConfirmResponse),
        (status = 400, description = "Invalid reset ticket or weak password."),
        (status = 403, description = "Password reset disabled."),
    ),
    tag = "auth"
)]
pub async fn confirm(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<ResetConfirmRequest>,
) -> ApiResult<Json<ResetConfirmResponse>> {
    let settings = enabled_settings(&deps).await?;
    let token = required(&payload.reset_ticket, "reset_ticket")
        .map_err(|_| ApiError::bad_request("invalid reset ticket"))?;
    let now = Utc::now();
    let ticket = deps
        .tickets
        .get(token)
        .await?
        .filter(|ticket| ticket.purpose == TicketPurpose::PasswordReset && ticket.is_usable(now))
        .ok_or_else(|| ApiError::bad_request("invalid reset ticket"))?;

    settings.validate_password(&payload.new_password)?;
    deps.tickets.mark_used(&ticket.token, now).await?;
    let user = deps
        .auth
        .update_password(ticket.user_id, &payload.new_password)
        .await?;
    info!(user_id = user.id, "Password reset completed");

    let tokens = mint_pair(&deps, user.id, user.role, 0)?;
    Ok(Json(ResetConfirmResponse {
        ok: true,
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_in: tokens.expires_in,
        user: UserBrief::from(&user),
    }))
}

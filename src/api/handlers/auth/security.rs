//! Account security centre: profile, 2FA enrollment and contact binding.
//!
//! Flow Overview:
//! 1) Users enrolled in 2FA first trade a TOTP code for a security ticket (`verify-2fa`).
//! 2) `send-code` checks the gate: a ticket when 2FA applies, otherwise the current password when
//!    the settings ask for it. It then sends a `bind_*` code to the new contact.
//! 3) `confirm` verifies the code, writes the contact, alerts the old contact and consumes the
//!    ticket.
//!
//! Security boundaries:
//! - Tickets are bound to the user and to the contact kind they were issued for.
//! - Delivery failures surface with the transport's own message.

use super::{issue_ticket, required, send_security_message};
use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{JsonBody, Principal, load_auth_settings, mask_email, mask_phone, require_user},
    handlers::dto::{OkResponse, UserView},
};
use crate::domain::{ContactKind, Ticket, TotpSetup, User};
use crate::error::ServiceError;
use crate::guards::RateLimitAction;
use crate::settings::AuthSettings;
use axum::{
    Json,
    extract::{Extension, Path},
    http::HeaderMap,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use utoipa::ToSchema;

const SECURITY_TICKET_BYTES: usize = 9;
const SECURITY_TICKET_TTL_SECONDS: i64 = 20 * 60;
const LIMIT_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Serialize, ToSchema)]
pub struct ContactsView {
    pub email_bound: bool,
    pub phone_bound: bool,
    pub email_masked: String,
    pub phone_masked: String,
    pub totp_enabled: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TwoFaStatus {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct TwoFaSetupRequest {
    pub password: String,
    /// Current TOTP code; required when replacing an enrolled secret.
    pub current_code: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct TwoFaCodeRequest {
    pub code: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct Verify2faRequest {
    pub totp_code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SecurityTicketResponse {
    pub security_ticket: String,
    pub expires_in: i64,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ContactSendCodeRequest {
    pub value: String,
    pub current_password: String,
    pub security_ticket: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ContactConfirmRequest {
    pub value: String,
    pub code: String,
    pub security_ticket: String,
}

fn contact_kind(raw: &str) -> ApiResult<ContactKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "email" => Ok(ContactKind::Email),
        "phone" => Ok(ContactKind::Phone),
        _ => Err(ApiError::not_found("not found")),
    }
}

/// Setup gate shared with the admin surface.
///
/// # Errors
/// 403 when 2FA, binding or rebinding is switched off; 400 with the collaborator's message.
pub(crate) async fn setup_totp(
    deps: &HandlerDeps,
    settings: &AuthSettings,
    user: &User,
    payload: &TwoFaSetupRequest,
) -> ApiResult<TotpSetup> {
    if !settings.two_fa_enabled {
        return Err(ApiError::forbidden("2fa disabled"));
    }
    if user.totp_enabled && !settings.two_fa_rebind_enabled {
        return Err(ApiError::forbidden("2fa rebind disabled"));
    }
    if !user.totp_enabled && !settings.two_fa_bind_enabled {
        return Err(ApiError::forbidden("2fa bind disabled"));
    }
    let current = payload.current_code.trim();
    deps.auth
        .setup_totp(
            user.id,
            &payload.password,
            (!current.is_empty()).then_some(current),
        )
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))
}

/// # Errors
/// 400 with the collaborator's message for a wrong code or missing setup.
pub(crate) async fn confirm_totp(deps: &HandlerDeps, user_id: i64, code: &str) -> ApiResult<()> {
    deps.auth
        .confirm_totp(user_id, code.trim())
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    info!(user_id, "2FA enrolled");
    Ok(())
}

/// Live ticket issued to `user_id` for `kind`.
async fn usable_ticket(
    deps: &HandlerDeps,
    user_id: i64,
    kind: ContactKind,
    raw: &str,
) -> ApiResult<Ticket> {
    let token = raw.trim();
    if token.is_empty() {
        return Err(ApiError::bad_request("security ticket required"));
    }
    let now = Utc::now();
    deps.tickets
        .get(token)
        .await?
        .filter(|ticket| {
            ticket.user_id == user_id
                && ticket.purpose == kind.ticket_purpose()
                && ticket.is_usable(now)
        })
        .ok_or_else(|| ApiError::bad_request("security ticket invalid"))
}

fn contact_of(user: &User, kind: ContactKind) -> &str {
    match kind {
        ContactKind::Email => user.email.trim(),
        ContactKind::Phone => user.phone.trim(),
    }
}

fn with_contact(user: &User, kind: ContactKind, value: &str) -> User {
    let mut shadow = user.clone();
    match kind {
        ContactKind::Email => shadow.email = value.to_string(),
        ContactKind::Phone => shadow.phone = value.to_string(),
    }
    shadow
}

fn limited(deps: &HandlerDeps, action: RateLimitAction, key: &str, max: u32) -> bool {
    !deps
        .guards
        .limiters
        .check(action, key, max, LIMIT_WINDOW)
        .is_allowed()
}

#[utoipa::path(
    get,
    path = "/api/v1/me",
    responses(
        (status = 200, description = "Current account.", body = UserView),
        (status = 401, description = "Invalid token."),
    ),
    tag = "security"
)]
pub async fn me(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    headers: HeaderMap,
) -> ApiResult<Json<UserView>> {
    let Principal { user, .. } = require_user(&headers, &deps).await?;
    Ok(Json(UserView::from(&user)))
}

#[utoipa::path(
    get,
    path = "/api/v1/me/security/contacts",
    responses(
        (status = 200, description = "Bound contacts, masked.", body = ContactsView),
        (status = 401, description = "Invalid token."),
    ),
    tag = "security"
)]
pub async fn contacts(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    headers: HeaderMap,
) -> ApiResult<Json<ContactsView>> {
    let Principal { user, .. } = require_user(&headers, &deps).await?;
    Ok(Json(ContactsView {
        email_bound: user.email_bound(),
        phone_bound: user.phone_bound(),
        email_masked: mask_email(&user.email),
        phone_masked: mask_phone(&user.phone),
        totp_enabled: user.totp_enabled,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/me/security/2fa/status",
    responses(
        (status = 200, description = "Whether TOTP is enrolled.", body = TwoFaStatus),
    ),
    tag = "security"
)]
pub async fn two_fa_status(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    headers: HeaderMap,
) -> ApiResult<Json<TwoFaStatus>> {
    let principal = require_user(&headers, &deps).await?;
    Ok(Json(TwoFaStatus {
        enabled: principal.user.totp_enabled,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/me/security/2fa/setup",
    request_body = TwoFaSetupRequest,
    responses(
        (status = 200, description = "Pending TOTP secret.", body = TotpSetup),
        (status = 400, description = "Invalid password or current code."),
        (status = 403, description = "2FA, binding or rebinding disabled."),
    ),
    tag = "security"
)]
pub async fn two_fa_setup(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<TwoFaSetupRequest>,
) -> ApiResult<Json<TotpSetup>> {
    let principal = require_user(&headers, &deps).await?;
    let settings = load_auth_settings(&deps).await?;
    setup_totp(&deps, &settings, &principal.user, &payload)
        .await
        .map(Json)
}

#[utoipa::path(
    post,
    path = "/api/v1/me/security/2fa/confirm",
    request_body = TwoFaCodeRequest,
    responses(
        (status = 200, description = "Secret activated.", body = OkResponse),
        (status = 400, description = "Invalid code."),
    ),
    tag = "security"
)]
pub async fn two_fa_confirm(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<TwoFaCodeRequest>,
) -> ApiResult<Json<OkResponse>> {
    let principal = require_user(&headers, &deps).await?;
    confirm_totp(&deps, principal.user_id(), &payload.code).await?;
    Ok(Json(OkResponse::ok()))
}

#[utoipa::path(
    post,
    path = "/api/v1/me/security/{kind}/verify-2fa",
    params(("kind" = String, Path, description = "`email` or `phone`")),
    request_body = Verify2faRequest,
    responses(
        (status = 200, description = "Security ticket issued.", body = SecurityTicketResponse),
        (status = 400, description = "2FA not enabled or invalid code."),
    ),
    tag = "security"
)]
pub async fn verify_2fa(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    JsonBody(payload): JsonBody<Verify2faRequest>,
) -> ApiResult<Json<SecurityTicketResponse>> {
    let kind = contact_kind(&kind)?;
    let Principal { user, .. } = require_user(&headers, &deps).await?;
    let settings = load_auth_settings(&deps).await?;
    if !(user.totp_enabled && settings.two_fa_enabled) {
        return Err(ApiError::bad_request("2fa not enabled"));
    }
    deps.auth
        .verify_totp(user.id, payload.totp_code.trim())
        .await
        .map_err(|_| ApiError::bad_request("invalid 2fa code"))?;

    let ticket = issue_ticket(
        &deps,
        user.id,
        kind.ticket_purpose(),
        None,
        "-",
        SECURITY_TICKET_BYTES,
        chrono::Duration::seconds(SECURITY_TICKET_TTL_SECONDS),
    )
    .await?;

    Ok(Json(SecurityTicketResponse {
        security_ticket: ticket.token,
        expires_in: SECURITY_TICKET_TTL_SECONDS,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/me/security/{kind}/send-code",
    params(("kind" = String, Path, description = "`email` or `phone`")),
    request_body = ContactSendCodeRequest,
    responses(
        (status = 200, description = "Code sent to the new contact.", body = OkResponse),
        (status = 400, description = "Gate failure or delivery failure."),
        (status = 403, description = "Binding disabled."),
        (status = 429, description = "Too many requests."),
    ),
    tag = "security"
)]
pub async fn contact_send_code(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    JsonBody(payload): JsonBody<ContactSendCodeRequest>,
) -> ApiResult<Json<OkResponse>> {
    let kind = contact_kind(&kind)?;
    let Principal { user, .. } = require_user(&headers, &deps).await?;
    let settings = load_auth_settings(&deps).await?;
    let enabled = match kind {
        ContactKind::Email => settings.email_bind_enabled,
        ContactKind::Phone => settings.phone_bind_enabled,
    };
    if !enabled {
        return Err(ApiError::forbidden(format!("{} bind disabled", kind.as_str())));
    }
    let rebind = !contact_of(&user, kind).is_empty();
    let value = required(&payload.value, "value")?;

    if user.totp_enabled && settings.two_fa_enabled {
        usable_ticket(&deps, user.id, kind, &payload.security_ticket).await?;
    } else {
        let needs_password = if rebind {
            settings.rebind_require_password_when_no_2fa
        } else {
            settings.bind_require_password_when_no_2fa
        };
        if needs_password {
            deps.auth
                .verify_password(user.id, &payload.current_password)
                .await
                .map_err(|_| ApiError::bad_request("invalid password"))?;
        }
    }

    let value_key = match kind {
        ContactKind::Email => value.to_lowercase(),
        ContactKind::Phone => value.to_string(),
    };
    let kind_str = kind.as_str();
    if limited(
        &deps,
        RateLimitAction::ContactCode,
        &format!("contact_bind_send:user:{}:{kind_str}", user.id),
        3,
    ) || limited(
        &deps,
        RateLimitAction::ContactCode,
        &format!("contact_bind_send:{kind_str}:{value_key}"),
        5,
    ) {
        return Err(ApiError::too_many("too many requests"));
    }

    let channel = kind.channel();
    let code = deps
        .auth
        .create_verification_code(
            channel,
            value,
            kind.bind_purpose(),
            settings.code_policy(channel, settings.contact_bind_verify_ttl),
        )
        .await?;
    send_security_message(
        &deps,
        &with_contact(&user, kind, value),
        &[channel],
        &format!("{kind_str}_bind_verify_code"),
        &[("code", code), (kind_str, value.to_string())],
    )
    .await?;

    Ok(Json(OkResponse::ok()))
}

#[utoipa::path(
    post,
    path = "/api/v1/me/security/{kind}/confirm",
    params(("kind" = String, Path, description = "`email` or `phone`")),
    request_body = ContactConfirmRequest,
    responses(
        (status = 200, description = "Contact bound.", body = OkResponse),
        (status = 400, description = "Invalid code, ticket or duplicate contact."),
        (status = 429, description = "Too many requests."),
    ),
    tag = "security"
)]
pub async fn contact_confirm(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    JsonBody(payload): JsonBody<ContactConfirmRequest>,
) -> ApiResult<Json<OkResponse>> {
    let kind = contact_kind(&kind)?;
    let Principal { user, .. } = require_user(&headers, &deps).await?;
    let value = required(&payload.value, "value")?;
    let settings = load_auth_settings(&deps).await?;

    let ticket = if user.totp_enabled && settings.two_fa_enabled {
        Some(usable_ticket(&deps, user.id, kind, &payload.security_ticket).await?)
    } else {
        None
    };
    if limited(
        &deps,
        RateLimitAction::ContactVerify,
        &format!("contact_bind_verify:user:{}:{}", user.id, kind.as_str()),
        10,
    ) {
        return Err(ApiError::too_many("too many requests"));
    }

    deps.auth
        .verify_verification_code(kind.channel(), value, kind.bind_purpose(), &payload.code)
        .await
        .map_err(|_| ApiError::bad_request("invalid verification code"))?;

    let duplicate = || ApiError::bad_request(format!("{} already exists", kind.as_str()));
    let existing = match kind {
        ContactKind::Email => deps.auth.find_user_by_email(value).await?,
        ContactKind::Phone => deps.auth.find_user_by_phone(value).await?,
    };
    if existing.is_some_and(|other| other.id != user.id) {
        return Err(duplicate());
    }
    let old = contact_of(&user, kind).to_string();
    let updated = match deps.auth.update_contact(user.id, kind, value).await {
        Ok(updated) => updated,
        Err(ServiceError::Conflict) => return Err(duplicate()),
        Err(err) => return Err(ApiError::bad_request(err.to_string())),
    };
    info!(user_id = user.id, kind = kind.as_str(), "Contact bound");

    if settings.contact_change_notify_old_enabled {
        notify_old_contact(&deps, &updated, kind, &old, value).await;
    }
    if let Some(ticket) = ticket {
        deps.tickets.mark_used(&ticket.token, Utc::now()).await?;
    }

    Ok(Json(OkResponse::ok()))
}

async fn notify_old_contact(deps: &HandlerDeps, user: &User, kind: ContactKind, old: &str, new: &str) {
    let changed = match kind {
        ContactKind::Email => !old.eq_ignore_ascii_case(new),
        ContactKind::Phone => old != new,
    };
    if old.is_empty() || !changed {
        return;
    }
    let kind_str = kind.as_str();
    let vars = [
        (if kind == ContactKind::Email { "old_email" } else { "old_phone" }, old.to_string()),
        (if kind == ContactKind::Email { "new_email" } else { "new_phone" }, new.to_string()),
        ("time", Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()),
    ];
    if let Err(err) = send_security_message(
        deps,
        &with_contact(user, kind, old),
        &[kind.channel()],
        &format!("{kind_str}_change_alert_old_contact"),
        &vars,
    )
    .await
    {
        warn!(user_id = user.id, kind = kind_str, "Old contact alert not delivered: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_kind_from_path() {
        assert!(matches!(contact_kind("Email"), Ok(ContactKind::Email)));
        assert!(matches!(contact_kind("phone"), Ok(ContactKind::Phone)));
        let err = contact_kind("qq").err();
        assert_eq!(err.map(|e| e.status()), Some(axum::http::StatusCode::NOT_FOUND));
    }
}

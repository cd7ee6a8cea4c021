//! Self-service registration.
//!
//! Flow Overview:
//! 1) Reject when registration is closed; check required fields and the password policy.
//! 2) With verification channels configured: captcha, then the `register` code on the chosen
//!    channel. SMS registration drops the email and email registration drops the phone.
//! 3) Without channels, the captcha alone gates the request when enabled.

use super::{CaptchaFields, required, verify_captcha};
use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{JsonBody, load_auth_settings},
    handlers::dto::OkResponse,
};
use crate::domain::{Channel, RegisterInput};
use crate::guards::RateLimitAction;
use crate::services::OutboundMessage;
use crate::settings::AuthSettings;
use axum::{Json, extract::Extension};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::info;
use utoipa::ToSchema;

const REGISTER_PURPOSE: &str = "register";
const REGISTER_CODE_MAX: u32 = 3;
const REGISTER_CODE_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub phone: String,
    pub qq: String,
    pub password: String,
    pub verify_code: String,
    pub verify_channel: String,
    #[serde(flatten)]
    pub captcha: CaptchaFields,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct RegisterCodeRequest {
    pub channel: String,
    pub email: String,
    pub phone: String,
    #[serde(flatten)]
    pub captcha: CaptchaFields,
}

/// The requested channel, or the only configured one when none was named.
fn resolve_channel(settings: &AuthSettings, raw: &str) -> Option<Channel> {
    let allowed = &settings.register_verify_channels;
    if raw.trim().is_empty() {
        return (allowed.len() == 1).then(|| allowed[0]);
    }
    Channel::parse(raw).filter(|channel| allowed.contains(channel))
}

fn is_required(settings: &AuthSettings, field: &str) -> bool {
    settings
        .register_required_fields
        .iter()
        .any(|configured| configured.trim().eq_ignore_ascii_case(field))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Account created.", body = RegisterResponse),
        (status = 400, description = "Missing field, weak password, captcha or code failure."),
        (status = 403, description = "Registration disabled."),
    ),
    tag = "auth"
)]
pub async fn register(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    let settings = load_auth_settings(&deps).await?;
    if !settings.register_enabled {
        return Err(ApiError::forbidden("registration disabled"));
    }

    let channel = resolve_channel(&settings, &payload.verify_channel);
    let sms_flow = channel == Some(Channel::Sms);

    let username = required(&payload.username, "username")?.to_string();
    let mut email = payload.email.trim().to_string();
    let mut phone = payload.phone.trim().to_string();
    if settings.register_email_required && !sms_flow && email.is_empty() {
        return Err(ApiError::bad_request("email required"));
    }
    if (is_required(&settings, "phone") || sms_flow) && phone.is_empty() {
        return Err(ApiError::bad_request("phone required"));
    }
    if is_required(&settings, "qq") && payload.qq.trim().is_empty() {
        return Err(ApiError::bad_request("qq required"));
    }
    required(&payload.password, "password")?;
    settings.validate_password(&payload.password)?;

    if settings.register_verify_channels.is_empty() {
        if settings.register_captcha_enabled {
            verify_captcha(&deps, &settings, &payload.captcha).await?;
        }
    } else {
        if settings.register_captcha_enabled {
            verify_captcha(&deps, &settings, &payload.captcha).await?;
        }
        if payload.verify_code.trim().is_empty() {
            return Err(ApiError::bad_request("verification code required"));
        }
        let channel = channel.ok_or_else(|| ApiError::bad_request("verify channel not allowed"))?;
        let receiver = match channel {
            Channel::Email => required(&email, "email")?,
            Channel::Sms => required(&phone, "phone")?,
        };
        deps.auth
            .verify_verification_code(channel, receiver, REGISTER_PURPOSE, &payload.verify_code)
            .await
            .map_err(|_| ApiError::bad_request("invalid verification code"))?;
        match channel {
            Channel::Sms => email.clear(),
            Channel::Email => phone.clear(),
        }
    }

    let user = deps
        .auth
        .register(RegisterInput {
            username,
            email,
            phone,
            qq: payload.qq.trim().to_string(),
            password: payload.password,
        })
        .await?;
    info!(user_id = user.id, "Account registered");

    Ok(Json(RegisterResponse {
        id: user.id,
        username: user.username,
        email: user.email,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/register/code",
    request_body = RegisterCodeRequest,
    responses(
        (status = 200, description = "Verification code sent.", body = OkResponse),
        (status = 400, description = "Channel not enabled, missing receiver or delivery failure."),
        (status = 403, description = "Registration disabled."),
        (status = 429, description = "Too many requests for this receiver."),
    ),
    tag = "auth"
)]
pub async fn register_code(
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<RegisterCodeRequest>,
) -> ApiResult<Json<OkResponse>> {
    let settings = load_auth_settings(&deps).await?;
    if !settings.register_enabled {
        return Err(ApiError::forbidden("registration disabled"));
    }
    if settings.register_captcha_enabled {
        verify_captcha(&deps, &settings, &payload.captcha).await?;
    }
    let channel = resolve_channel(&settings, &payload.channel)
        .ok_or_else(|| ApiError::bad_request("channel not enabled"))?;
    let receiver = match channel {
        Channel::Email => required(&payload.email, "email")?,
        Channel::Sms => required(&payload.phone, "phone")?,
    };

    let key = format!("register_code:{channel}:{}", receiver.to_lowercase());
    if !deps
        .guards
        .limiters
        .check(
            RateLimitAction::RegisterCode,
            &key,
            REGISTER_CODE_MAX,
            REGISTER_CODE_WINDOW,
        )
        .is_allowed()
    {
        return Err(ApiError::too_many("too many requests"));
    }

    let ttl = settings.register_verify_ttl;
    let code = deps
        .auth
        .create_verification_code(
            channel,
            receiver,
            REGISTER_PURPOSE,
            settings.code_policy(channel, ttl),
        )
        .await?;
    let message = OutboundMessage::new(receiver, "register_verify_code")
        .var("code", code)
        .var("ttl_minutes", (ttl.as_secs() / 60).to_string());
    deps.sender(channel).send(&message).await?;

    Ok(Json(OkResponse::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsSnapshot;

    fn settings(pairs: &[(&str, &str)]) -> AuthSettings {
        AuthSettings::from_snapshot(&SettingsSnapshot::from_pairs(pairs.iter().copied()))
    }

    #[test]
    fn single_channel_is_the_default() {
        let s = settings(&[("auth_register_verify_channels", r#"["sms"]"#)]);
        assert_eq!(resolve_channel(&s, ""), Some(Channel::Sms));
        assert_eq!(resolve_channel(&s, "SMS"), Some(Channel::Sms));
        assert_eq!(resolve_channel(&s, "email"), None);
    }

    #[test]
    fn ambiguous_channel_needs_a_choice() {
        let s = settings(&[("auth_register_verify_channels", r#"["email","sms"]"#)]);
        assert_eq!(resolve_channel(&s, ""), None);
        assert_eq!(resolve_channel(&s, "email"), Some(Channel::Email));
    }

    #[test]
    fn required_fields_are_case_insensitive() {
        let s = settings(&[("auth_register_required_fields", r#"["username","QQ"]"#)]);
        assert!(is_required(&s, "qq"));
        assert!(!is_required(&s, "phone"));
    }
}

//! End-user authentication and account security.
//!
//! Flow Overview:
//! 1) Registration and login consult captcha, rate limiter and cooldown guards before calling
//!    the auth collaborator.
//! 2) Tokens are minted here; refresh copies the MFA scope forward.
//! 3) Password reset and contact binding exchange verification codes for single-use tickets.
//!
//! Security boundaries:
//! - Codes, passwords and tickets are never logged.
//! - Guards are advisory; the auth collaborator remains authoritative.

pub mod captcha;
pub mod login;
pub mod password_reset;
pub mod register;
pub mod security;

use crate::{
    api::{
        HandlerDeps,
        error::{ApiError, ApiResult},
        gateway::looks_like_phone,
    },
    domain::{Channel, Ticket, TicketPurpose, User, UserRole},
    error::ServiceError,
    services::OutboundMessage,
    settings::{AuthSettings, CaptchaProvider},
    token::TokenPair,
};
use chrono::{Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::ToSchema;

/// Captcha answer fields shared by register, register-code and login bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct CaptchaFields {
    pub captcha_id: String,
    pub captcha_code: String,
    pub lot_number: String,
    pub captcha_output: String,
    pub pass_token: String,
    pub gen_time: String,
}

/// # Errors
/// 400 `captcha failed` for a wrong, expired or unverifiable answer.
pub(crate) async fn verify_captcha(
    deps: &HandlerDeps,
    settings: &AuthSettings,
    fields: &CaptchaFields,
) -> ApiResult<()> {
    match settings.captcha_provider {
        CaptchaProvider::Image => deps
            .auth
            .verify_captcha(&fields.captcha_id, &fields.captcha_code)
            .await
            .map_err(|_| ApiError::bad_request("captcha failed")),
        CaptchaProvider::Geetest => {
            // Geetest answers need a server-side validate call, which this adapter does not make.
            warn!(
                captcha_id = %settings.geetest_captcha_id,
                "Geetest validation unavailable, rejecting captcha"
            );
            Err(ApiError::bad_request("captcha failed"))
        }
    }
}

/// Access/refresh pair for `user` at MFA scope `mfa`.
///
/// # Errors
/// 500 when signing fails.
pub(crate) fn mint_pair(deps: &HandlerDeps, user_id: i64, role: UserRole, mfa: u8) -> ApiResult<TokenPair> {
    deps.tokens.issue_pair(user_id, role, mfa).map_err(|err| {
        error!("Failed to sign tokens: {err}");
        ApiError::internal("token sign failed")
    })
}

/// Deliver `template` through the first usable channels in `channels`.
///
/// Succeeds when any channel delivered; otherwise returns the last failure.
pub(crate) async fn send_security_message(
    deps: &HandlerDeps,
    user: &User,
    channels: &[Channel],
    template: &str,
    vars: &[(&str, String)],
) -> Result<(), ServiceError> {
    let mut sent = false;
    let mut last_err = ServiceError::rejected("no notify channel");
    for channel in channels {
        let to = match channel {
            Channel::Email if user.email_bound() => user.email.clone(),
            Channel::Email => {
                last_err = ServiceError::rejected("email not bound");
                continue;
            }
            Channel::Sms if user.phone_bound() => user.phone.clone(),
            Channel::Sms => {
                last_err = ServiceError::rejected("phone not bound");
                continue;
            }
        };
        let message = vars
            .iter()
            .fold(OutboundMessage::new(to, template), |message, (key, value)| {
                message.var(key, value.clone())
            })
            .var("username", user.username.clone());
        match deps.sender(*channel).send(&message).await {
            Ok(()) => sent = true,
            Err(err) => last_err = err,
        }
    }
    if sent { Ok(()) } else { Err(last_err) }
}

/// Phone-looking accounts are tried as a phone first, then username, then email.
///
/// # Errors
/// Propagates collaborator failures.
pub(crate) async fn find_user_by_account(
    deps: &HandlerDeps,
    account: &str,
) -> ApiResult<Option<User>> {
    let account = account.trim();
    if account.is_empty() {
        return Ok(None);
    }
    if looks_like_phone(account)
        && let Some(user) = deps.auth.find_user_by_phone(account).await?
    {
        return Ok(Some(user));
    }
    if let Some(user) = deps.auth.find_user_by_username(account).await? {
        return Ok(Some(user));
    }
    Ok(deps.auth.find_user_by_email(account).await?)
}

/// Stores a fresh single-use ticket of `bytes` random bytes, hex encoded.
///
/// # Errors
/// 500 when the random source or the ticket store fails.
pub(crate) async fn issue_ticket(
    deps: &HandlerDeps,
    user_id: i64,
    purpose: TicketPurpose,
    channel: Option<Channel>,
    receiver: &str,
    bytes: usize,
    ttl: Duration,
) -> ApiResult<Ticket> {
    let mut raw = vec![0u8; bytes];
    OsRng.try_fill_bytes(&mut raw).map_err(|err| {
        error!("Random source failed: {err}");
        ApiError::internal("ticket generation failed")
    })?;
    let now = Utc::now();
    let ticket = Ticket {
        token: hex::encode(raw),
        user_id,
        purpose,
        channel,
        receiver: receiver.to_string(),
        issued_at: now,
        expires_at: now + ttl,
        used_at: None,
    };
    deps.tickets.insert(ticket.clone()).await?;
    Ok(ticket)
}

/// Trimmed non-empty string or a 400 `<field> required`.
pub(crate) fn required<'a>(value: &'a str, field: &str) -> ApiResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        Err(ApiError::bad_request(format!("{field} required")))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_trims() {
        assert_eq!(required("  bob ", "username").ok(), Some("bob"));
        let err = required("   ", "email").err();
        assert_eq!(err.as_ref().map(ApiError::message), Some("email required"));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use utoipa::ToSchema;

/// Delivery channel for verification codes and security notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }

    /// Case-insensitive, whitespace tolerant parse.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "sms" => Some(Self::Sms),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CodeComplexity {
    Digits,
    Letters,
    Alnum,
}

impl CodeComplexity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Digits => "digits",
            Self::Letters => "letters",
            Self::Alnum => "alnum",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "digits" => Some(Self::Digits),
            "letters" => Some(Self::Letters),
            "alnum" => Some(Self::Alnum),
            _ => None,
        }
    }

    #[must_use]
    pub const fn alphabet(self) -> &'static [u8] {
        match self {
            Self::Digits => b"0123456789",
            Self::Letters => b"ABCDEFGHJKLMNPQRSTUVWXYZ",
            Self::Alnum => b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789",
        }
    }
}

/// Strength and lifetime of an issued secret (verification code or captcha).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePolicy {
    pub ttl: Duration,
    pub length: usize,
    pub complexity: CodeComplexity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Email,
    Phone,
}

impl ContactKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }

    #[must_use]
    pub const fn channel(self) -> Channel {
        match self {
            Self::Email => Channel::Email,
            Self::Phone => Channel::Sms,
        }
    }

    /// Verification-code purpose for binding this contact.
    #[must_use]
    pub const fn bind_purpose(self) -> &'static str {
        match self {
            Self::Email => "bind_email",
            Self::Phone => "bind_phone",
        }
    }

    #[must_use]
    pub const fn ticket_purpose(self) -> TicketPurpose {
        match self {
            Self::Email => TicketPurpose::ContactBindEmail,
            Self::Phone => TicketPurpose::ContactBindPhone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPurpose {
    PasswordReset,
    ContactBindEmail,
    ContactBindPhone,
}

/// Single-use short-lived proof of a recent verification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub token: String,
    pub user_id: i64,
    pub purpose: TicketPurpose,
    pub channel: Option<Channel>,
    pub receiver: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Usable when not consumed and not expired at `now`.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterInput {
    pub username: String,
    pub email: String,
    pub phone: String,
    pub qq: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captcha {
    pub id: String,
    pub image_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TotpSetup {
    pub secret: String,
    pub otpauth_url: String,
}

/// Where a login came from, as shown in security alerts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoLocation {
    pub city: String,
    /// `GMT+08:00` style offset.
    pub tz: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn channel_parse_is_lenient() {
        assert_eq!(Channel::parse(" EMAIL "), Some(Channel::Email));
        assert_eq!(Channel::parse("sms"), Some(Channel::Sms));
        assert_eq!(Channel::parse("qq"), None);
    }

    #[test]
    fn ticket_usability() {
        let now = Utc::now();
        let mut ticket = Ticket {
            token: "t".to_string(),
            user_id: 1,
            purpose: TicketPurpose::PasswordReset,
            channel: Some(Channel::Email),
            receiver: "a@example.com".to_string(),
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(15),
            used_at: None,
        };
        assert!(ticket.is_usable(now));
        assert!(!ticket.is_usable(now + ChronoDuration::minutes(16)));
        ticket.used_at = Some(now);
        assert!(!ticket.is_usable(now));
    }
}

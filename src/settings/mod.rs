//! Settings snapshots consumed by the HTTP handlers.
//!
//! Settings are raw `key -> value` strings owned by the settings collaborator. Handlers load one
//! [`SettingsSnapshot`] per request and derive typed views such as [`AuthSettings`] from it, so
//! a request never observes two different configurations.

pub mod json;

use crate::domain::{Channel, CodeComplexity, CodePolicy};
use crate::error::ServiceError;
use crate::services::SettingsService;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use utoipa::ToSchema;

pub use json::{is_json_setting_key, validate_setting_json_value};

/// Point-in-time copy of every stored setting.
#[derive(Debug, Clone, Default)]
pub struct SettingsSnapshot {
    values: HashMap<String, String>,
}

impl SettingsSnapshot {
    /// Load every setting once.
    ///
    /// # Errors
    /// Propagates the collaborator's failure.
    pub async fn load(settings: &dyn SettingsService) -> Result<Self, ServiceError> {
        let values = settings
            .list()
            .await?
            .into_iter()
            .map(|item| (item.key, item.value))
            .collect();
        Ok(Self { values })
    }

    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Trimmed value; empty values read as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// `Some` only when the key holds a value; `true`, `1` and `yes` are truthy.
    #[must_use]
    pub fn bool_opt(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
    }

    #[must_use]
    pub fn bool(&self, key: &str, default: bool) -> bool {
        self.bool_opt(key).unwrap_or(default)
    }

    #[must_use]
    pub fn int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    /// JSON array of strings; anything else falls back to `default`.
    #[must_use]
    pub fn string_list(&self, key: &str, default: &[&str]) -> Vec<String> {
        self.get(key)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_else(|| default.iter().map(|s| (*s).to_string()).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaProvider {
    Image,
    Geetest,
}

/// Typed view of the `auth_*` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub register_enabled: bool,
    pub register_required_fields: Vec<String>,
    pub register_email_required: bool,
    pub password_min_len: usize,
    pub password_require_upper: bool,
    pub password_require_lower: bool,
    pub password_require_number: bool,
    pub password_require_symbol: bool,
    pub register_verify_channels: Vec<Channel>,
    pub register_verify_ttl: Duration,
    pub register_captcha_enabled: bool,
    pub captcha_provider: CaptchaProvider,
    pub geetest_captcha_id: String,
    pub geetest_api_server: String,
    pub login_captcha_enabled: bool,
    pub login_rate_limit_enabled: bool,
    pub login_rate_limit_window: Duration,
    pub login_rate_limit_max: u32,
    pub login_notify_enabled: bool,
    pub login_notify_on_first: bool,
    pub login_notify_on_ip_change: bool,
    pub login_notify_channels: Vec<Channel>,
    pub password_reset_enabled: bool,
    pub password_reset_channels: Vec<Channel>,
    pub password_reset_verify_ttl: Duration,
    pub sms_code: CodeSettings,
    pub email_code: CodeSettings,
    pub captcha_code: CodeSettings,
    pub email_bind_enabled: bool,
    pub phone_bind_enabled: bool,
    pub contact_change_notify_old_enabled: bool,
    pub contact_bind_verify_ttl: Duration,
    pub bind_require_password_when_no_2fa: bool,
    pub rebind_require_password_when_no_2fa: bool,
    pub two_fa_enabled: bool,
    pub two_fa_bind_enabled: bool,
    pub two_fa_rebind_enabled: bool,
    pub geoip_mmdb_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSettings {
    pub length: usize,
    pub complexity: CodeComplexity,
}

impl CodeSettings {
    #[must_use]
    pub const fn policy(self, ttl: Duration) -> CodePolicy {
        CodePolicy {
            ttl,
            length: self.length,
            complexity: self.complexity,
        }
    }
}

impl AuthSettings {
    /// Load the settings snapshot and derive the auth view from it.
    ///
    /// # Errors
    /// Propagates the collaborator's failure.
    pub async fn load(settings: &dyn SettingsService) -> Result<Self, ServiceError> {
        Ok(Self::from_snapshot(&SettingsSnapshot::load(settings).await?))
    }

    #[must_use]
    pub fn from_snapshot(s: &SettingsSnapshot) -> Self {
        let verify_type = s.string("auth_register_verify_type", "none").to_lowercase();
        let mut verify_channels =
            normalize_channels(&s.string_list("auth_register_verify_channels", &[]));
        if verify_channels.is_empty() {
            if let Some(channel) = Channel::parse(&verify_type) {
                verify_channels.push(channel);
            }
        }
        let captcha_provider = if s.string("auth_captcha_provider", "image").to_lowercase() == "geetest" {
            CaptchaProvider::Geetest
        } else {
            CaptchaProvider::Image
        };

        Self {
            register_enabled: s.bool("auth_register_enabled", true),
            register_required_fields: s
                .string_list("auth_register_required_fields", &["username", "password"]),
            register_email_required: s.bool("auth_register_email_required", true),
            password_min_len: usize::try_from(s.int("auth_password_min_len", 6)).unwrap_or(0),
            password_require_upper: s.bool("auth_password_require_upper", false),
            password_require_lower: s.bool("auth_password_require_lower", false),
            password_require_number: s.bool("auth_password_require_number", false),
            password_require_symbol: s.bool("auth_password_require_symbol", false),
            register_verify_channels: verify_channels,
            register_verify_ttl: seconds(s.int("auth_register_verify_ttl_sec", 600)),
            register_captcha_enabled: s.bool("auth_register_captcha_enabled", true),
            captcha_provider,
            geetest_captcha_id: s.string("auth_geetest_captcha_id", ""),
            geetest_api_server: s
                .string("auth_geetest_api_server", "https://gcaptcha4.geetest.com")
                .trim_end_matches('/')
                .to_string(),
            login_captcha_enabled: s.bool("auth_login_captcha_enabled", false),
            login_rate_limit_enabled: s.bool("auth_login_rate_limit_enabled", true),
            login_rate_limit_window: seconds(s.int("auth_login_rate_limit_window_sec", 300)),
            login_rate_limit_max: u32::try_from(s.int("auth_login_rate_limit_max_attempts", 5))
                .unwrap_or(0),
            login_notify_enabled: s.bool("auth_login_notify_enabled", true),
            login_notify_on_first: s.bool("auth_login_notify_on_first_login", true),
            login_notify_on_ip_change: s.bool("auth_login_notify_on_ip_change", true),
            login_notify_channels: normalize_channels(
                &s.string_list("auth_login_notify_channels", &["email"]),
            ),
            password_reset_enabled: s.bool("auth_password_reset_enabled", true),
            password_reset_channels: normalize_channels(
                &s.string_list("auth_password_reset_channels", &["email"]),
            ),
            password_reset_verify_ttl: seconds(s.int("auth_password_reset_verify_ttl_sec", 600)),
            sms_code: code_settings(s, "auth_sms_code", 6, CodeComplexity::Digits),
            email_code: code_settings(s, "auth_email_code", 6, CodeComplexity::Alnum),
            captcha_code: code_settings(s, "auth_captcha_code", 5, CodeComplexity::Alnum),
            email_bind_enabled: s.bool("auth_email_bind_enabled", true),
            phone_bind_enabled: s.bool("auth_phone_bind_enabled", true),
            contact_change_notify_old_enabled: s
                .bool("auth_contact_change_notify_old_enabled", true),
            contact_bind_verify_ttl: seconds(s.int("auth_contact_bind_verify_ttl_sec", 600)),
            bind_require_password_when_no_2fa: s
                .bool("auth_bind_require_password_when_no_2fa", false),
            rebind_require_password_when_no_2fa: s
                .bool("auth_rebind_require_password_when_no_2fa", true),
            two_fa_enabled: s.bool("auth_2fa_enabled", true),
            two_fa_bind_enabled: s.bool("auth_2fa_bind_enabled", true),
            two_fa_rebind_enabled: s.bool("auth_2fa_rebind_enabled", true),
            geoip_mmdb_path: s.string("auth_geoip_mmdb_path", ""),
        }
    }

    /// Code policy for a delivery channel.
    #[must_use]
    pub const fn code_policy(&self, channel: Channel, ttl: Duration) -> CodePolicy {
        match channel {
            Channel::Email => self.email_code.policy(ttl),
            Channel::Sms => self.sms_code.policy(ttl),
        }
    }

    /// # Errors
    /// Returns [`ServiceError::InvalidInput`] when `password` violates the configured policy.
    pub fn validate_password(&self, password: &str) -> Result<(), ServiceError> {
        if password.trim().is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        if self.password_min_len > 0 && password.len() < self.password_min_len {
            return Err(ServiceError::InvalidInput);
        }
        let (mut upper, mut lower, mut number, mut symbol) = (false, false, false, false);
        for c in password.chars() {
            match c {
                'A'..='Z' => upper = true,
                'a'..='z' => lower = true,
                '0'..='9' => number = true,
                _ => symbol = true,
            }
        }
        let missing = (self.password_require_upper && !upper)
            || (self.password_require_lower && !lower)
            || (self.password_require_number && !number)
            || (self.password_require_symbol && !symbol);
        if missing {
            return Err(ServiceError::InvalidInput);
        }
        Ok(())
    }
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}

fn code_settings(
    s: &SettingsSnapshot,
    prefix: &str,
    default_len: i64,
    default_complexity: CodeComplexity,
) -> CodeSettings {
    let length = s.int(&format!("{prefix}_len"), default_len).clamp(4, 12);
    let complexity = s
        .get(&format!("{prefix}_complexity"))
        .and_then(CodeComplexity::parse)
        .unwrap_or(default_complexity);
    CodeSettings {
        length: usize::try_from(length).unwrap_or(6),
        complexity,
    }
}

/// Parses, dedupes and keeps only known channels, preserving order.
#[must_use]
pub fn normalize_channels(raw: &[String]) -> Vec<Channel> {
    let mut out = Vec::new();
    for channel in raw.iter().filter_map(|value| Channel::parse(value)) {
        if !out.contains(&channel) {
            out.push(channel);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let settings = AuthSettings::from_snapshot(&SettingsSnapshot::default());
        assert!(settings.register_enabled);
        assert!(settings.register_verify_channels.is_empty());
        assert_eq!(settings.login_rate_limit_max, 5);
        assert_eq!(settings.login_rate_limit_window, Duration::from_secs(300));
        assert_eq!(settings.password_reset_channels, vec![Channel::Email]);
        assert_eq!(settings.sms_code.complexity, CodeComplexity::Digits);
        assert_eq!(settings.captcha_code.length, 5);
        assert!(settings.two_fa_enabled);
        assert!(settings.rebind_require_password_when_no_2fa);
        assert!(!settings.bind_require_password_when_no_2fa);
        assert_eq!(settings.captcha_provider, CaptchaProvider::Image);
    }

    #[test]
    fn parses_overrides() {
        let snapshot = SettingsSnapshot::from_pairs([
            ("auth_register_verify_channels", r#"["SMS","email","sms","qq"]"#),
            ("auth_password_reset_channels", r#"["email","sms"]"#),
            ("auth_2fa_enabled", "false"),
            ("auth_sms_code_len", "40"),
            ("auth_email_code_complexity", "digits"),
            ("auth_captcha_provider", "GeeTest"),
            ("auth_geetest_api_server", "https://example.com/"),
        ]);
        let settings = AuthSettings::from_snapshot(&snapshot);
        assert_eq!(
            settings.register_verify_channels,
            vec![Channel::Sms, Channel::Email]
        );
        assert_eq!(
            settings.password_reset_channels,
            vec![Channel::Email, Channel::Sms]
        );
        assert!(!settings.two_fa_enabled);
        assert_eq!(settings.sms_code.length, 12);
        assert_eq!(settings.email_code.complexity, CodeComplexity::Digits);
        assert_eq!(settings.captcha_provider, CaptchaProvider::Geetest);
        assert_eq!(settings.geetest_api_server, "https://example.com");
    }

    #[test]
    fn legacy_verify_type_fills_channels() {
        let snapshot = SettingsSnapshot::from_pairs([("auth_register_verify_type", "email")]);
        let settings = AuthSettings::from_snapshot(&snapshot);
        assert_eq!(settings.register_verify_channels, vec![Channel::Email]);
    }

    #[test]
    fn password_policy() {
        let snapshot = SettingsSnapshot::from_pairs([
            ("auth_password_min_len", "8"),
            ("auth_password_require_upper", "1"),
            ("auth_password_require_symbol", "yes"),
        ]);
        let settings = AuthSettings::from_snapshot(&snapshot);
        assert_eq!(
            settings.validate_password("short"),
            Err(ServiceError::InvalidInput)
        );
        assert_eq!(
            settings.validate_password("longenough!"),
            Err(ServiceError::InvalidInput)
        );
        assert_eq!(settings.validate_password("Longenough!"), Ok(()));
        assert_eq!(
            settings.validate_password("        "),
            Err(ServiceError::InvalidInput)
        );
    }

    #[test]
    fn snapshot_accessors() {
        let snapshot = SettingsSnapshot::from_pairs([
            ("flag", " YES "),
            ("empty", "  "),
            ("num", "12"),
            ("bad_num", "x"),
        ]);
        assert_eq!(snapshot.bool_opt("flag"), Some(true));
        assert_eq!(snapshot.bool_opt("empty"), None);
        assert_eq!(snapshot.int("num", 0), 12);
        assert_eq!(snapshot.int("bad_num", 7), 7);
        assert_eq!(snapshot.string("missing", "dflt"), "dflt");
    }
}

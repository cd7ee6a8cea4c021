//! Guards for settings that store structured JSON.
//!
//! A common client bug is to `JSON.stringify` a value that is already serialized, which stores a
//! JSON string whose content is itself a JSON container. Such values are rejected before they
//! reach the settings store.

use serde_json::Value;

/// Keys listed explicitly in addition to every key ending in `_json`.
const JSON_SETTING_KEYS: &[&str] = &[
    "site_nav_items",
    "auth_register_verify_channels",
    "auth_register_required_fields",
    "auth_login_notify_channels",
    "auth_password_reset_channels",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingJsonError {
    #[error("setting {0} contains double-encoded json")]
    DoubleEncoded(String),
    #[error("setting {0} expects valid json")]
    Invalid(String),
    #[error("setting {0} expects json object/array")]
    NotContainer(String),
}

#[must_use]
pub fn is_json_setting_key(key: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    key.ends_with("_json") || JSON_SETTING_KEYS.contains(&key.as_str())
}

/// Validates `value` when `key` holds structured JSON; other keys and blank values pass.
///
/// # Errors
/// Returns [`SettingJsonError`] when the value is double-encoded, malformed or a scalar.
pub fn validate_setting_json_value(key: &str, value: &str) -> Result<(), SettingJsonError> {
    let raw = value.trim();
    if !is_json_setting_key(key) || raw.is_empty() {
        return Ok(());
    }
    if is_double_encoded_container(raw) {
        return Err(SettingJsonError::DoubleEncoded(key.to_string()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(_) | Value::Array(_)) => Ok(()),
        Ok(_) => Err(SettingJsonError::NotContainer(key.to_string())),
        Err(_) => Err(SettingJsonError::Invalid(key.to_string())),
    }
}

fn is_double_encoded_container(raw: &str) -> bool {
    let Ok(nested) = serde_json::from_str::<String>(raw) else {
        return false;
    };
    matches!(
        serde_json::from_str::<Value>(nested.trim()),
        Ok(Value::Object(_) | Value::Array(_))
    )
}

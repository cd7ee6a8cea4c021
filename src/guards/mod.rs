//! Process-local guards protecting authentication endpoints.
//!
//! Flow Overview:
//! 1) Login handlers consult [`LoginCooldownGuard`] before checking credentials and register a
//!    failure when the credentials are rejected. Reaching the threshold locks the key.
//! 2) Admin 2FA unlock counts consecutive bad codes in [`ConsecutiveFailureGuard`]; the handler
//!    disables the account once [`ADMIN_2FA_FAILURE_THRESHOLD`] is reached.
//! 3) Code issuance and verification endpoints are throttled by [`RateLimiters`], one limiter per
//!    endpoint family.
//!
//! Every guard serializes access through its own mutex, and no guard lock is held across a call
//! to a collaborator. Guards are advisory: the domain services remain authoritative.

pub mod admin_path;
pub mod cooldown;
pub mod failure;
pub mod rate_limit;

pub use admin_path::{AdminPathError, admin_path_matches, effective_admin_path, validate_admin_path};
pub use cooldown::{FailureOutcome, LoginCooldownGuard};
pub use failure::ConsecutiveFailureGuard;
pub use rate_limit::{RateLimitAction, RateLimitDecision, RateLimiter, RateLimiters};

use chrono::Duration;

pub const ADMIN_LOGIN_FAILURE_THRESHOLD: u32 = 10;
pub const USER_LOGIN_FAILURE_THRESHOLD: u32 = 10;
pub const ADMIN_2FA_FAILURE_THRESHOLD: u32 = 5;

#[must_use]
pub fn admin_login_cooldown() -> Duration {
    Duration::minutes(10)
}

#[must_use]
pub fn user_login_cooldown() -> Duration {
    Duration::minutes(10)
}

/// Trimmed, lowercased key shared by every guard.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Cooldown keys for user logins live in their own namespace.
#[must_use]
pub fn user_login_key(account: &str) -> String {
    format!("user:{}", normalize_key(account))
}

#[must_use]
pub fn admin_login_key(account: &str) -> String {
    format!("admin:{}", normalize_key(account))
}

#[must_use]
pub fn admin_2fa_key(user_id: i64) -> String {
    format!("admin_2fa:{user_id}")
}

/// Every guard instance the HTTP layer shares between requests.
#[derive(Debug)]
pub struct SecurityGuards {
    pub login_cooldown: LoginCooldownGuard,
    pub admin_2fa: ConsecutiveFailureGuard,
    pub limiters: RateLimiters,
    pub admin_login_threshold: u32,
    pub admin_login_cooldown: Duration,
}

impl SecurityGuards {
    #[must_use]
    pub fn new() -> Self {
        Self {
            login_cooldown: LoginCooldownGuard::new(),
            admin_2fa: ConsecutiveFailureGuard::new(),
            limiters: RateLimiters::default(),
            admin_login_threshold: ADMIN_LOGIN_FAILURE_THRESHOLD,
            admin_login_cooldown: admin_login_cooldown(),
        }
    }
}

impl Default for SecurityGuards {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(user_login_key(" Alice "), "user:alice");
        assert_eq!(admin_login_key("Admin"), "admin:admin");
        assert_eq!(admin_2fa_key(7), "admin_2fa:7");
    }

    #[test]
    fn new_uses_admin_defaults() {
        let guards = SecurityGuards::new();
        assert_eq!(guards.admin_login_threshold, 10);
        assert_eq!(guards.admin_login_cooldown, Duration::minutes(10));
    }
}

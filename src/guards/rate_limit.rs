//! Sliding-window rate limiting for sensitive endpoint families.
//!
//! Each family owns an independent limiter so a burst against one endpoint never consumes the
//! budget of another. Budgets are supplied per call, which lets handlers read them from settings.

use super::normalize_key;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    ForgotPassword,
    Login,
    RegisterCode,
    ResetCode,
    ResetVerify,
    ContactCode,
    ContactVerify,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

impl RateLimitDecision {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

pub trait RateLimiter: Send + Sync {
    /// Records an attempt for `key` and decides whether it fits `max` attempts per `window`.
    fn check(&self, key: &str, max: u32, window: Duration) -> RateLimitDecision;
}

/// Keeps the instants of accepted attempts per key; rejected attempts are not recorded.
#[derive(Debug, Default)]
pub struct WindowRateLimiter {
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl WindowRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_at(&self, key: &str, max: u32, window: Duration, now: Instant) -> RateLimitDecision {
        let key = normalize_key(key);
        if key.is_empty() || max == 0 || window.is_zero() {
            return RateLimitDecision::Allowed;
        }
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = hits.entry(key).or_default();
        while let Some(first) = entries.front() {
            if now.duration_since(*first) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() >= max as usize {
            return RateLimitDecision::Limited;
        }
        entries.push_back(now);
        RateLimitDecision::Allowed
    }
}

impl RateLimiter for WindowRateLimiter {
    fn check(&self, key: &str, max: u32, window: Duration) -> RateLimitDecision {
        self.check_at(key, max, window, Instant::now())
    }
}

/// One limiter per [`RateLimitAction`].
#[derive(Debug, Default)]
pub struct RateLimiters {
    forgot_password: WindowRateLimiter,
    login: WindowRateLimiter,
    register_code: WindowRateLimiter,
    reset_code: WindowRateLimiter,
    reset_verify: WindowRateLimiter,
    contact_code: WindowRateLimiter,
    contact_verify: WindowRateLimiter,
}

impl RateLimiters {
    #[must_use]
    pub fn get(&self, action: RateLimitAction) -> &WindowRateLimiter {
        match action {
            RateLimitAction::ForgotPassword => &self.forgot_password,
            RateLimitAction::Login => &self.login,
            RateLimitAction::RegisterCode => &self.register_code,
            RateLimitAction::ResetCode => &self.reset_code,
            RateLimitAction::ResetVerify => &self.reset_verify,
            RateLimitAction::ContactCode => &self.contact_code,
            RateLimitAction::ContactVerify => &self.contact_verify,
        }
    }

    pub fn check(
        &self,
        action: RateLimitAction,
        key: &str,
        max: u32,
        window: Duration,
    ) -> RateLimitDecision {
        self.get(action).check(key, max, window)
    }
}

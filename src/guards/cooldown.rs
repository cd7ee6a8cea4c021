//! Login cooldown after repeated credential failures.
//!
//! State is process-local and keyed by the normalized account key. A restart clears every lock,
//! which is acceptable because the authoritative credential checks live in the auth service.

use super::normalize_key;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CooldownState {
    failures: u32,
    locked_until: Option<DateTime<Utc>>,
}

/// Result of [`LoginCooldownGuard::register_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub failures: u32,
}

impl FailureOutcome {
    const NONE: Self = Self {
        locked: false,
        locked_until: None,
        failures: 0,
    };
}

#[derive(Debug, Default)]
pub struct LoginCooldownGuard {
    states: Mutex<HashMap<String, CooldownState>>,
}

impl LoginCooldownGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock expiry when `key` is cooling down at `now`.
    ///
    /// An expired lock is cleared in place; a state with no failures left is evicted.
    pub fn is_cooling_down(&self, key: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let key = normalize_key(key);
        if key.is_empty() {
            return None;
        }
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.get_mut(&key)?;
        match state.locked_until {
            Some(until) if until > now => Some(until),
            _ => {
                if state.failures == 0 {
                    states.remove(&key);
                } else {
                    state.locked_until = None;
                }
                None
            }
        }
    }

    /// Records a failed attempt.
    ///
    /// Reaching `threshold` locks the key until `now + cooldown` and resets the failure count.
    /// While locked, further failures are not counted. Invalid inputs are ignored.
    pub fn register_failure(
        &self,
        key: &str,
        threshold: u32,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let key = normalize_key(key);
        if key.is_empty() || threshold == 0 || cooldown <= Duration::zero() {
            return FailureOutcome::NONE;
        }
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key).or_default();
        if let Some(until) = state.locked_until {
            if until > now {
                return FailureOutcome {
                    locked: true,
                    locked_until: Some(until),
                    failures: state.failures,
                };
            }
        }
        state.failures += 1;
        if state.failures >= threshold {
            let until = now + cooldown;
            state.locked_until = Some(until);
            state.failures = 0;
            return FailureOutcome {
                locked: true,
                locked_until: Some(until),
                failures: threshold,
            };
        }
        state.locked_until = None;
        FailureOutcome {
            locked: false,
            locked_until: None,
            failures: state.failures,
        }
    }

    pub fn reset(&self, key: &str) {
        let key = normalize_key(key);
        if key.is_empty() {
            return;
        }
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    #[cfg(test)]
    fn failures(&self, key: &str) -> u32 {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_key(key))
            .map_or(0, |state| state.failures)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u32 = 10;

    fn cooldown() -> Duration {
        Duration::minutes(10)
    }

    #[test]
    fn failures_below_threshold_never_lock() {
        let guard = LoginCooldownGuard::new();
        let now = Utc::now();
        for expected in 1..THRESHOLD {
            let outcome = guard.register_failure("admin", THRESHOLD, cooldown(), now);
            assert!(!outcome.locked);
            assert_eq!(outcome.failures, expected);
            assert_eq!(guard.is_cooling_down("admin", now), None);
            assert_eq!(guard.failures("admin"), expected);
        }
    }

    #[test]
    fn threshold_failure_locks_for_cooldown() {
        let guard = LoginCooldownGuard::new();
        let now = Utc::now();
        for _ in 1..THRESHOLD {
            guard.register_failure("admin", THRESHOLD, cooldown(), now);
        }
        let outcome = guard.register_failure("admin", THRESHOLD, cooldown(), now);
        assert!(outcome.locked);
        assert_eq!(outcome.failures, THRESHOLD);
        assert_eq!(outcome.locked_until, Some(now + cooldown()));
        assert_eq!(guard.is_cooling_down("admin", now), Some(now + cooldown()));
        // Count is reset when the lock is set.
        assert_eq!(guard.failures("admin"), 0);
    }

    #[test]
    fn failures_while_locked_are_not_counted() {
        let guard = LoginCooldownGuard::new();
        let now = Utc::now();
        for _ in 0..THRESHOLD {
            guard.register_failure("admin", THRESHOLD, cooldown(), now);
        }
        let later = now + Duration::seconds(5);
        let outcome = guard.register_failure("admin", THRESHOLD, cooldown(), later);
        assert!(outcome.locked);
        assert_eq!(outcome.locked_until, Some(now + cooldown()));
        assert_eq!(outcome.failures, 0);
    }

    #[test]
    fn expired_lock_is_evicted() {
        let guard = LoginCooldownGuard::new();
        let now = Utc::now();
        for _ in 0..THRESHOLD {
            guard.register_failure("admin", THRESHOLD, cooldown(), now);
        }
        let after = now + cooldown() + Duration::seconds(1);
        assert_eq!(guard.is_cooling_down("admin", after), None);
        assert_eq!(guard.tracked(), 0);
    }

    #[test]
    fn expired_lock_with_failures_keeps_count() {
        let guard = LoginCooldownGuard::new();
        let now = Utc::now();
        for _ in 0..THRESHOLD {
            guard.register_failure("admin", THRESHOLD, cooldown(), now);
        }
        let after = now + cooldown() + Duration::seconds(1);
        let outcome = guard.register_failure("admin", THRESHOLD, cooldown(), after);
        assert!(!outcome.locked);
        assert_eq!(outcome.failures, 1);
        assert_eq!(guard.is_cooling_down("admin", after), None);
        assert_eq!(guard.failures("admin"), 1);
        assert_eq!(guard.tracked(), 1);
    }

    #[test]
    fn keys_are_normalized() {
        let guard = LoginCooldownGuard::new();
        let now = Utc::now();
        guard.register_failure("  Admin ", THRESHOLD, cooldown(), now);
        assert_eq!(guard.failures("admin"), 1);
        guard.reset("ADMIN");
        assert_eq!(guard.tracked(), 0);
    }

    #[test]
    fn invalid_inputs_are_ignored() {
        let guard = LoginCooldownGuard::new();
        let now = Utc::now();
        assert_eq!(
            guard.register_failure("   ", THRESHOLD, cooldown(), now),
            FailureOutcome::NONE
        );
        assert_eq!(
            guard.register_failure("admin", 0, cooldown(), now),
            FailureOutcome::NONE
        );
        assert_eq!(
            guard.register_failure("admin", THRESHOLD, Duration::zero(), now),
            FailureOutcome::NONE
        );
        assert_eq!(guard.tracked(), 0);
        assert_eq!(guard.is_cooling_down("", now), None);
    }

    #[test]
    fn reset_returns_to_initial_state() {
        let guard = LoginCooldownGuard::new();
        let now = Utc::now();
        for _ in 0..THRESHOLD {
            guard.register_failure("admin", THRESHOLD, cooldown(), now);
        }
        guard.reset("admin");
        assert_eq!(guard.is_cooling_down("admin", now), None);
        let outcome = guard.register_failure("admin", THRESHOLD, cooldown(), now);
        assert_eq!(outcome.failures, 1);
    }
}

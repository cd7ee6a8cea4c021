//! Consecutive failure counter, used to disable admin accounts after repeated bad 2FA codes.

use super::normalize_key;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct ConsecutiveFailureGuard {
    counts: Mutex<HashMap<String, u32>>,
}

impl ConsecutiveFailureGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `key` and returns the new value. Empty keys always yield `0`.
    pub fn register_failure(&self, key: &str) -> u32 {
        let key = normalize_key(key);
        if key.is_empty() {
            return 0;
        }
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn reset(&self, key: &str) {
        let key = normalize_key(key);
        if key.is_empty() {
            return;
        }
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_resets() {
        let guard = ConsecutiveFailureGuard::new();
        assert_eq!(guard.register_failure("admin:1"), 1);
        assert_eq!(guard.register_failure("ADMIN:1"), 2);
        assert_eq!(guard.register_failure("admin:2"), 1);
        guard.reset("admin:1");
        assert_eq!(guard.register_failure("admin:1"), 1);
    }

    #[test]
    fn empty_key_is_ignored() {
        let guard = ConsecutiveFailureGuard::new();
        assert_eq!(guard.register_failure(""), 0);
        assert_eq!(guard.register_failure("   "), 0);
    }
}

//! Per-key request rate limiting.
//!
//! A key with `rate_limit_per_min = L` serves at most L requests within any
//! window aligned to an integer minute (`floor(unix_seconds / 60)`). Counters
//! from previous minutes are discarded on the next hit, so the map stays
//! bounded by the number of active keys.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<i64, (u64, u32)>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit for `key_id` and report whether it is within the limit.
    /// A non-positive limit disables limiting for the key.
    pub fn check(&self, key_id: i64, limit: i32) -> bool {
        let minute = chrono::Utc::now().timestamp() as u64 / 60;
        self.check_at(key_id, limit, minute)
    }

    fn check_at(&self, key_id: i64, limit: i32, minute: u64) -> bool {
        if limit <= 0 {
            return true;
        }
        let mut windows = self.windows.lock().unwrap();
        let entry = windows.entry(key_id).or_insert((minute, 0));
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        entry.1 += 1;
        entry.1 <= limit as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_within_minute() {
        let limiter = RateLimiter::new();
        assert!(limiter.check_at(1, 2, 100));
        assert!(limiter.check_at(1, 2, 100));
        assert!(!limiter.check_at(1, 2, 100));
        assert!(!limiter.check_at(1, 2, 100));
    }

    #[test]
    fn test_window_resets_next_minute() {
        let limiter = RateLimiter::new();
        assert!(limiter.check_at(1, 2, 100));
        assert!(limiter.check_at(1, 2, 100));
        assert!(!limiter.check_at(1, 2, 100));
        assert!(limiter.check_at(1, 2, 101));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.check_at(1, 1, 100));
        assert!(!limiter.check_at(1, 1, 100));
        assert!(limiter.check_at(2, 1, 100));
    }

    #[test]
    fn test_zero_limit_disables() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check_at(1, 0, 100));
        }
    }
}

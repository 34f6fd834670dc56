//! Rate Limiting
//!
//! Per-identity token bucket applied to message sends.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::identity::Identity;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
    last_seen: Instant,
}

impl Bucket {
    fn full(per_minute: u32, now: Instant) -> Self {
        Bucket {
            tokens: per_minute as f64,
            capacity: per_minute as f64,
            refill_rate: per_minute as f64 / 60.0,
            last_seen: now,
        }
    }

    fn take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_seen).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_seen = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Send rate limiter keyed by sender identity.
pub struct RateLimiter {
    buckets: RwLock<HashMap<Identity, Bucket>>,
    per_minute: u32,
}

impl RateLimiter {
    /// `per_minute` is both the burst size and the sustained rate.
    /// Zero disables limiting.
    pub fn new(per_minute: u32) -> Self {
        RateLimiter {
            buckets: RwLock::new(HashMap::new()),
            per_minute,
        }
    }

    /// Takes one send token for `identity`. Returns false when limited.
    pub fn consume(&self, identity: &Identity) -> bool {
        self.consume_at(identity, Instant::now())
    }

    fn consume_at(&self, identity: &Identity, now: Instant) -> bool {
        if self.per_minute == 0 {
            return true;
        }
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(identity.clone())
            .or_insert_with(|| Bucket::full(self.per_minute, now))
            .take(now)
    }

    /// Drops buckets idle for at least `max_idle`. Returns how many were removed.
    pub fn cleanup_inactive(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < max_idle);
        before - buckets.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_allows_burst_then_blocks() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.consume(&id("alice")));
        }
        assert!(!limiter.consume(&id("alice")));
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.consume(&id("alice")));
        assert!(limiter.consume(&id("alice")));
        assert!(!limiter.consume(&id("alice")));
        assert!(limiter.consume(&id("bob")));
    }

    #[test]
    fn test_refills_with_time() {
        let limiter = RateLimiter::new(60);
        let start = Instant::now();
        for _ in 0..60 {
            assert!(limiter.consume_at(&id("alice"), start));
        }
        assert!(!limiter.consume_at(&id("alice"), start));

        // One token per second at 60/min.
        let later = start + Duration::from_millis(1100);
        assert!(limiter.consume_at(&id("alice"), later));
        assert!(!limiter.consume_at(&id("alice"), later));
    }

    #[test]
    fn test_zero_disables_limit() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.consume(&id("alice")));
        }
        assert_eq!(limiter.tracked_count(), 0);
    }

    #[test]
    fn test_cleanup_removes_idle_buckets() {
        let limiter = RateLimiter::new(10);
        limiter.consume(&id("alice"));
        limiter.consume(&id("bob"));
        assert_eq!(limiter.tracked_count(), 2);

        thread::sleep(Duration::from_millis(20));
        limiter.consume(&id("alice"));

        let removed = limiter.cleanup_inactive(Duration::from_millis(10));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_count(), 1);
    }

    #[test]
    fn test_cleanup_keeps_recent_buckets() {
        let limiter = RateLimiter::new(10);
        limiter.consume(&id("alice"));
        assert_eq!(limiter.cleanup_inactive(Duration::from_secs(3600)), 0);
        assert_eq!(limiter.tracked_count(), 1);
    }
}

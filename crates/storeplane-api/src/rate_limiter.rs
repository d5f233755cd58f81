//! Per-identity rate limiting for the write endpoints
//!
//! Token buckets keyed by caller identity, one bucket family per write
//! operation. Buckets refill continuously at the configured per-minute
//! rate and burst up to the full window.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// The write operations with distinct budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Create,
    Delete,
}

/// One caller's token bucket.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = per_minute as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiter for the intent layer's write endpoints.
pub struct WriteRateLimiter {
    create_per_minute: u32,
    delete_per_minute: u32,
    buckets: Mutex<HashMap<(String, WriteOp), TokenBucket>>,
}

impl WriteRateLimiter {
    pub fn new(create_per_minute: u32, delete_per_minute: u32) -> Self {
        Self {
            create_per_minute: create_per_minute.max(1),
            delete_per_minute: delete_per_minute.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `identity` may perform `op` right now.
    pub fn check(&self, identity: &str, op: WriteOp) -> bool {
        self.check_at(identity, op, Instant::now())
    }

    fn check_at(&self, identity: &str, op: WriteOp, now: Instant) -> bool {
        let per_minute = match op {
            WriteOp::Create => self.create_per_minute,
            WriteOp::Delete => self.delete_per_minute,
        };
        let mut buckets = self.buckets.lock();
        buckets
            .entry((identity.to_string(), op))
            .or_insert_with(|| TokenBucket::new(per_minute, now))
            .try_acquire_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_limited() {
        let limiter = WriteRateLimiter::new(3, 30);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_at("alice", WriteOp::Create, now));
        }
        assert!(!limiter.check_at("alice", WriteOp::Create, now));
    }

    #[test]
    fn test_identities_are_isolated() {
        let limiter = WriteRateLimiter::new(1, 30);
        let now = Instant::now();
        assert!(limiter.check_at("alice", WriteOp::Create, now));
        assert!(!limiter.check_at("alice", WriteOp::Create, now));
        assert!(limiter.check_at("bob", WriteOp::Create, now));
    }

    #[test]
    fn test_operations_have_separate_budgets() {
        let limiter = WriteRateLimiter::new(1, 1);
        let now = Instant::now();
        assert!(limiter.check_at("alice", WriteOp::Create, now));
        assert!(limiter.check_at("alice", WriteOp::Delete, now));
        assert!(!limiter.check_at("alice", WriteOp::Create, now));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let limiter = WriteRateLimiter::new(60, 30); // one token per second
        let start = Instant::now();
        assert!(limiter.check_at("alice", WriteOp::Create, start));
        // Drain the rest of the burst.
        for _ in 0..59 {
            assert!(limiter.check_at("alice", WriteOp::Create, start));
        }
        assert!(!limiter.check_at("alice", WriteOp::Create, start));
        // Two seconds later two tokens are back.
        let later = start + Duration::from_secs(2);
        assert!(limiter.check_at("alice", WriteOp::Create, later));
        assert!(limiter.check_at("alice", WriteOp::Create, later));
        assert!(!limiter.check_at("alice", WriteOp::Create, later));
    }
}

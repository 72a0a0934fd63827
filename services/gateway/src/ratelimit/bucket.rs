use std::time::Duration;

use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-9;

/// Outcome of one consumption attempt against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionProbe {
    pub consumed: bool,
    pub remaining: u64,
    /// Milliseconds until the next token is available; zero when consumed.
    pub wait_millis: u64,
}

/// Token bucket with continuous refill: `capacity` tokens accrue evenly over
/// `refill_period_ms`, so tokens come back proportionally to elapsed time
/// rather than in one jump at a window boundary.
///
/// Serializable because the distributed backend stores it as opaque bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub capacity: u64,
    pub tokens: f64,
    pub refill_period_ms: u64,
    pub last_refill_ms: u64,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u64, refill_period: Duration, now_ms: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tokens: capacity as f64,
            refill_period_ms: (refill_period.as_millis() as u64).max(1),
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }
        let elapsed = (now_ms - self.last_refill_ms) as f64;
        let accrued = elapsed * self.capacity as f64 / self.refill_period_ms as f64;
        self.tokens = (self.tokens + accrued).min(self.capacity as f64);
        self.last_refill_ms = now_ms;
    }

    pub fn try_consume(&mut self, now_ms: u64) -> ConsumptionProbe {
        self.refill(now_ms);

        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return ConsumptionProbe {
                consumed: true,
                remaining: self.available(),
                wait_millis: 0,
            };
        }

        let deficit = 1.0 - self.tokens;
        ConsumptionProbe {
            consumed: false,
            remaining: 0,
            wait_millis: (deficit * self.refill_period_ms as f64 / self.capacity as f64).ceil() as u64,
        }
    }

    /// Whole tokens currently in the bucket.
    pub fn available(&self) -> u64 {
        (self.tokens + EPSILON).floor() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn capacity_one_allows_one_per_period() {
        let mut bucket = TokenBucket::new(1, MINUTE, 0);

        assert!(bucket.try_consume(0).consumed);
        let denied = bucket.try_consume(0);
        assert!(!denied.consumed);
        assert_eq!(denied.wait_millis, 60_000);

        assert!(bucket.try_consume(60_000).consumed);
        assert!(!bucket.try_consume(60_000).consumed);
    }

    #[test]
    fn refill_is_proportional_to_elapsed_time() {
        let mut bucket = TokenBucket::new(10, MINUTE, 0);
        for _ in 0..10 {
            assert!(bucket.try_consume(0).consumed);
        }
        assert!(!bucket.try_consume(0).consumed);

        // Half the period brings back half the capacity.
        bucket.refill(30_000);
        assert_eq!(bucket.available(), 5);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(3, MINUTE, 0);
        bucket.try_consume(0);
        bucket.refill(10 * 60_000);
        assert_eq!(bucket.available(), 3);
    }

    #[test]
    fn clock_going_backwards_does_not_refill() {
        let mut bucket = TokenBucket::new(1, MINUTE, 5_000);
        assert!(bucket.try_consume(5_000).consumed);
        assert!(!bucket.try_consume(1_000).consumed);
        assert_eq!(bucket.last_refill_ms, 5_000);
    }

    #[test]
    fn remaining_counts_whole_tokens() {
        let mut bucket = TokenBucket::new(5, MINUTE, 0);
        let probe = bucket.try_consume(0);
        assert_eq!(probe.remaining, 4);
    }
}

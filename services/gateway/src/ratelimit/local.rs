use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::config::RateLimitConfig;

use super::backend::RateLimitBackend;
use super::bucket::{ConsumptionProbe, TokenBucket};
use super::error::RateLimitError;

/// In-process buckets. Bounded by key count and dropped after a period of
/// inactivity; not shared between instances.
pub struct LocalBackend {
    buckets: Cache<String, Arc<Mutex<TokenBucket>>>,
    refill_period: Duration,
    clock: SharedClock,
}

impl LocalBackend {
    pub fn new(config: &RateLimitConfig, clock: SharedClock) -> Self {
        Self::with_limits(
            config.local_max_keys,
            config.local_idle_expiry,
            config.refill_period,
            clock,
        )
    }

    pub fn with_limits(
        max_keys: u64,
        idle_expiry: Duration,
        refill_period: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            buckets: Cache::builder()
                .max_capacity(max_keys)
                .time_to_idle(idle_expiry)
                .support_invalidation_closures()
                .build(),
            refill_period,
            clock,
        }
    }

    pub fn bucket_count(&self) -> u64 {
        self.buckets.run_pending_tasks();
        self.buckets.entry_count()
    }
}

#[async_trait]
impl RateLimitBackend for LocalBackend {
    async fn try_consume(&self, key: &str, capacity: u64) -> Result<ConsumptionProbe, RateLimitError> {
        let now = self.clock.now_millis();
        let bucket = self.buckets.get_with(key.to_string(), || {
            Arc::new(Mutex::new(TokenBucket::new(capacity, self.refill_period, now)))
        });
        let probe = bucket.lock().try_consume(now);
        Ok(probe)
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.buckets.invalidate(key);
        Ok(())
    }

    async fn reset_prefix(&self, prefix: &str) -> Result<u64, RateLimitError> {
        let removed = self
            .buckets
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .count() as u64;
        let prefix = prefix.to_string();
        self.buckets
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix))
            .map_err(|err| RateLimitError::Backend(err.to_string()))?;
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

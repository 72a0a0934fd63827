use async_trait::async_trait;

use super::bucket::ConsumptionProbe;
use super::error::RateLimitError;

/// Storage strategy behind the rate limiter. Capacity is passed per call so
/// one backend can serve keys with different limits.
///
/// A bucket that already exists keeps the capacity it was created with until
/// it expires or is reset.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn try_consume(&self, key: &str, capacity: u64) -> Result<ConsumptionProbe, RateLimitError>;

    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;

    /// Drops every bucket whose key starts with `prefix`, returning how many
    /// were removed where the backend can tell.
    async fn reset_prefix(&self, prefix: &str) -> Result<u64, RateLimitError>;

    fn name(&self) -> &'static str;
}

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::timeout;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::RateLimitConfig;

use super::backend::RateLimitBackend;
use super::bucket::{ConsumptionProbe, TokenBucket};
use super::error::RateLimitError;

pub const KEY_PREFIX: &str = "ratelimit:";

/// Minimum clock distance between two sweeps of expired buckets.
const SWEEP_INTERVAL_MS: u64 = 1_000;

/// Shared key/value store holding serialized buckets.
///
/// `compare_and_swap` writes `new` only when the stored value equals
/// `expected` (`None` meaning absent or expired) and reports whether it did.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, RateLimitError>;

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, RateLimitError>;

    async fn delete(&self, key: &str) -> Result<(), RateLimitError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RateLimitError>;
}

#[derive(Debug, Clone)]
struct StoredBucket {
    bytes: Vec<u8>,
    expires_at_ms: u64,
}

/// Process-local [`BucketStore`] with per-key TTL. Stands in for an external
/// store in single-node deployments and tests.
///
/// Expired buckets are dropped by writers: at most once per
/// [`SWEEP_INTERVAL_MS`] a `compare_and_swap` first removes every entry whose
/// TTL has passed, so idle keys do not accumulate.
pub struct InMemoryBucketStore {
    entries: DashMap<String, StoredBucket>,
    clock: SharedClock,
    last_sweep_ms: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryBucketStore {
    pub fn new(clock: SharedClock) -> Self {
        let now = clock.now_millis();
        Self {
            entries: DashMap::new(),
            clock,
            last_sweep_ms: AtomicU64::new(now),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every call fail, simulating an unreachable store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RateLimitError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RateLimitError::Backend("bucket store unreachable".into()));
        }
        Ok(())
    }

    /// Number of live (unexpired) buckets.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .iter()
            .filter(|stored| stored.expires_at_ms > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Must not run while a shard guard of `entries` is held.
    fn sweep_expired(&self, now: u64) {
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < SWEEP_INTERVAL_MS {
            return;
        }
        // One writer wins the sweep for this interval.
        if self
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.expires_at_ms > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "expired rate-limit buckets reclaimed");
        }
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, RateLimitError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .get(key)
            .filter(|stored| stored.expires_at_ms > now)
            .map(|stored| stored.bytes.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, RateLimitError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        self.sweep_expired(now);
        let replacement = StoredBucket {
            bytes: new,
            expires_at_ms: now + ttl.as_millis() as u64,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let live = (current.expires_at_ms > now).then_some(current.bytes.as_slice());
                if live != expected {
                    return Ok(false);
                }
                occupied.insert(replacement);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RateLimitError> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RateLimitError> {
        self.check_available()?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }
}

/// Buckets kept in a shared [`BucketStore`] and updated with optimistic
/// compare-and-swap, so several gateway instances can enforce one limit.
///
/// Denials are not written back: the stored bucket already carries enough
/// state to recompute the refill on the next attempt.
pub struct DistributedBackend {
    store: Arc<dyn BucketStore>,
    clock: SharedClock,
    refill_period: Duration,
    bucket_ttl: Duration,
    max_attempts: u32,
    call_timeout: Duration,
}

impl DistributedBackend {
    pub fn new(store: Arc<dyn BucketStore>, config: &RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            refill_period: config.refill_period,
            bucket_ttl: config.bucket_ttl,
            max_attempts: config.cas_max_retries.max(1),
            call_timeout: config.backend_timeout,
        }
    }

    async fn consume_with_retries(
        &self,
        key: &str,
        capacity: u64,
    ) -> Result<ConsumptionProbe, RateLimitError> {
        for attempt in 1..=self.max_attempts {
            let now = self.clock.now_millis();
            let current = self.store.load(key).await?;
            let mut bucket = match &current {
                Some(bytes) => serde_json::from_slice::<TokenBucket>(bytes)?,
                None => TokenBucket::new(capacity, self.refill_period, now),
            };

            let probe = bucket.try_consume(now);
            if !probe.consumed && current.is_some() {
                return Ok(probe);
            }

            let encoded = serde_json::to_vec(&bucket)?;
            if self
                .store
                .compare_and_swap(key, current.as_deref(), encoded, self.bucket_ttl)
                .await?
            {
                return Ok(probe);
            }
            debug!(key, attempt, "bucket changed concurrently, retrying");
        }

        Err(RateLimitError::Contention {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[async_trait]
impl RateLimitBackend for DistributedBackend {
    async fn try_consume(&self, key: &str, capacity: u64) -> Result<ConsumptionProbe, RateLimitError> {
        let storage_key = format!("{KEY_PREFIX}{key}");
        timeout(self.call_timeout, self.consume_with_retries(&storage_key, capacity))
            .await
            .map_err(|_| RateLimitError::Timeout(self.call_timeout))?
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.store.delete(&format!("{KEY_PREFIX}{key}")).await
    }

    async fn reset_prefix(&self, prefix: &str) -> Result<u64, RateLimitError> {
        self.store.delete_prefix(&format!("{KEY_PREFIX}{prefix}")).await
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryBucketStore>, DistributedBackend) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryBucketStore::new(clock.clone()));
        let backend = DistributedBackend::new(store.clone(), &RateLimitConfig::default(), clock.clone());
        (clock, store, backend)
    }

    #[tokio::test]
    async fn capacity_one_allows_once_per_period() {
        let (clock, _, backend) = setup();

        assert!(backend.try_consume("t:ip:/", 1).await.unwrap().consumed);
        let denied = backend.try_consume("t:ip:/", 1).await.unwrap();
        assert!(!denied.consumed);
        assert_eq!(denied.wait_millis, 60_000);

        clock.advance(Duration::from_secs(60));
        assert!(backend.try_consume("t:ip:/", 1).await.unwrap().consumed);
        assert!(!backend.try_consume("t:ip:/", 1).await.unwrap().consumed);
    }

    #[tokio::test]
    async fn cas_rejects_stale_expectation() {
        let (_, store, _) = setup();
        let ttl = Duration::from_secs(10);

        assert!(store.compare_and_swap("k", None, b"one".to_vec(), ttl).await.unwrap());
        assert!(!store.compare_and_swap("k", None, b"two".to_vec(), ttl).await.unwrap());
        assert!(!store
            .compare_and_swap("k", Some(b"zero"), b"two".to_vec(), ttl)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(b"one"), b"two".to_vec(), ttl)
            .await
            .unwrap());
        assert_eq!(store.load("k").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn buckets_expire_after_ttl() {
        let (clock, store, backend) = setup();

        backend.try_consume("t:ip:/", 1).await.unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(RateLimitConfig::default().bucket_ttl + Duration::from_millis(1));
        assert!(store.is_empty());
        assert!(backend.try_consume("t:ip:/", 1).await.unwrap().consumed);
    }

    #[tokio::test]
    async fn expired_buckets_are_reclaimed_by_later_writes() {
        let (clock, store, backend) = setup();

        for i in 0..1_000 {
            backend.try_consume(&format!("t:ip:/page/{i}"), 5).await.unwrap();
        }
        assert_eq!(store.entries.len(), 1_000);

        clock.advance(RateLimitConfig::default().bucket_ttl + Duration::from_millis(1));
        backend.try_consume("t:ip:/fresh", 5).await.unwrap();
        assert_eq!(store.entries.len(), 1);
    }

    #[tokio::test]
    async fn live_buckets_survive_a_sweep() {
        let (clock, store, backend) = setup();

        assert!(backend.try_consume("t:ip:/old", 1).await.unwrap().consumed);
        clock.advance(Duration::from_secs(2));
        backend.try_consume("t:ip:/new", 5).await.unwrap();

        assert_eq!(store.entries.len(), 2);
        assert!(!backend.try_consume("t:ip:/old", 1).await.unwrap().consumed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumers_never_overspend() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryBucketStore::new(clock.clone()));
        let mut config = RateLimitConfig::default();
        config.cas_max_retries = 1_000;
        config.backend_timeout = Duration::from_secs(5);
        let backend = Arc::new(DistributedBackend::new(store, &config, clock));

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move { backend.try_consume("shared", 10).await.unwrap().consumed })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn unreachable_store_is_an_error() {
        let (_, store, backend) = setup();
        store.set_unavailable(true);
        assert!(matches!(
            backend.try_consume("k", 1).await,
            Err(RateLimitError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn reset_prefix_scopes_to_tenant() {
        let (_, _, backend) = setup();
        backend.try_consume("a:ip:/x", 1).await.unwrap();
        backend.try_consume("b:ip:/x", 1).await.unwrap();

        assert_eq!(backend.reset_prefix("a:").await.unwrap(), 1);
        assert!(backend.try_consume("a:ip:/x", 1).await.unwrap().consumed);
        assert!(!backend.try_consume("b:ip:/x", 1).await.unwrap().consumed);
    }
}

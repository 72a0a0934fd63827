//! Token-bucket rate limiting keyed by tenant, client and route.

pub mod backend;
pub mod bucket;
pub mod client_ip;
pub mod distributed;
pub mod error;
pub mod exemption;
pub mod local;
#[cfg(feature = "backend-redis")]
pub mod redis_store;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{HeaderMap, Method};
use tracing::{debug, error};

use crate::clock::SharedClock;
use crate::config::{RateLimitConfig, RateLimitMode};

pub use backend::RateLimitBackend;
pub use bucket::{ConsumptionProbe, TokenBucket};
pub use client_ip::{parse_trusted_proxy, ClientIpResolver};
pub use distributed::{BucketStore, DistributedBackend, InMemoryBucketStore};
pub use error::RateLimitError;
pub use exemption::ExemptionRules;
pub use local::LocalBackend;

/// Tenant segment used when no tenant is bound.
pub const ANONYMOUS_TENANT: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining_tokens: u64,
    /// Seconds until a token is available, rounded up and at least 1 when denied.
    pub retry_after_secs: u64,
    /// The backend failed and the request was let through.
    pub failed_open: bool,
}

impl RateLimitOutcome {
    fn from_probe(probe: ConsumptionProbe) -> Self {
        Self {
            allowed: probe.consumed,
            remaining_tokens: probe.remaining,
            retry_after_secs: if probe.consumed {
                0
            } else {
                probe.wait_millis.div_ceil(1_000).max(1)
            },
            failed_open: false,
        }
    }

    fn fail_open() -> Self {
        Self {
            allowed: true,
            remaining_tokens: 0,
            retry_after_secs: 0,
            failed_open: true,
        }
    }
}

/// `tenant:client:route`. Requests share a bucket only when all three match.
pub fn bucket_key(tenant_id: Option<&str>, client: &str, route: &str) -> String {
    format!("{}:{client}:{route}", tenant_id.unwrap_or(ANONYMOUS_TENANT))
}

/// Facade in front of the configured [`RateLimitBackend`].
///
/// Resolves the capacity for a tenant, applies exemptions, derives the client
/// identity and fails open when the backend errors.
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    enabled: bool,
    default_capacity: u64,
    tenant_capacities: HashMap<String, u64>,
    server_count: u64,
    local: bool,
    client_ips: ClientIpResolver,
    exemptions: ExemptionRules,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, backend: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            backend,
            enabled: config.enabled,
            default_capacity: config.default_capacity,
            tenant_capacities: config.per_tenant_capacities.clone(),
            server_count: u64::from(config.server_count.max(1)),
            local: config.mode == RateLimitMode::Local,
            client_ips: ClientIpResolver::from_entries(&config.trusted_proxies),
            exemptions: ExemptionRules::from_config(config),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn client_ips(&self) -> &ClientIpResolver {
        &self.client_ips
    }

    /// Per-tenant capacity or the default. Local buckets are per instance,
    /// so the limit is split across the configured server count.
    pub fn capacity_for(&self, tenant_id: Option<&str>) -> u64 {
        let configured = tenant_id
            .and_then(|id| self.tenant_capacities.get(id).copied())
            .unwrap_or(self.default_capacity);
        if self.local {
            (configured / self.server_count).max(1)
        } else {
            configured
        }
    }

    /// Consumes one token for `key`. Backend failures allow the request.
    pub async fn try_consume(&self, key: &str, capacity: u64) -> RateLimitOutcome {
        match self.backend.try_consume(key, capacity).await {
            Ok(probe) => {
                if !probe.consumed {
                    debug!(key, wait_ms = probe.wait_millis, "rate limit exceeded");
                }
                RateLimitOutcome::from_probe(probe)
            }
            Err(err) => {
                error!(
                    key,
                    backend = self.backend.name(),
                    error = %err,
                    "rate limit backend failed, allowing request"
                );
                RateLimitOutcome::fail_open()
            }
        }
    }

    /// Admission check for one request. `None` when the request is exempt or
    /// limiting is disabled.
    pub async fn check(
        &self,
        tenant_id: Option<&str>,
        method: &Method,
        path: &str,
        peer: SocketAddr,
        headers: &HeaderMap,
    ) -> Option<RateLimitOutcome> {
        if !self.enabled || self.exemptions.is_exempt(method, path) {
            return None;
        }

        let client = self.client_ips.resolve(peer, headers);
        let key = bucket_key(tenant_id, &client, path);
        let capacity = self.capacity_for(tenant_id);
        Some(self.try_consume(&key, capacity).await)
    }

    pub async fn reset_key(&self, key: &str) -> Result<(), RateLimitError> {
        self.backend.reset(key).await
    }

    /// Drops every bucket of one tenant, e.g. after its capacity changed.
    pub async fn reset_tenant(&self, tenant_id: &str) -> Result<u64, RateLimitError> {
        self.backend.reset_prefix(&format!("{tenant_id}:")).await
    }
}

/// Builds the backend selected by `config.mode`.
pub async fn build_backend(
    config: &RateLimitConfig,
    clock: SharedClock,
) -> Result<Arc<dyn RateLimitBackend>, RateLimitError> {
    let backend: Arc<dyn RateLimitBackend> = match config.mode {
        RateLimitMode::Local => Arc::new(LocalBackend::new(config, clock)),
        RateLimitMode::Distributed => {
            let store = Arc::new(InMemoryBucketStore::new(clock.clone()));
            Arc::new(DistributedBackend::new(store, config, clock))
        }
        RateLimitMode::Redis => redis_backend(config, clock).await?,
    };
    Ok(backend)
}

#[cfg(feature = "backend-redis")]
async fn redis_backend(
    config: &RateLimitConfig,
    clock: SharedClock,
) -> Result<Arc<dyn RateLimitBackend>, RateLimitError> {
    let url = config.redis_url.as_deref().ok_or_else(|| {
        RateLimitError::Config("RATE_LIMIT_REDIS_URL is required when RATE_LIMIT_MODE=redis".into())
    })?;
    let store = redis_store::RedisBucketStore::connect(url).await?;
    Ok(Arc::new(DistributedBackend::new(Arc::new(store), config, clock)))
}

#[cfg(not(feature = "backend-redis"))]
async fn redis_backend(
    _config: &RateLimitConfig,
    _clock: SharedClock,
) -> Result<Arc<dyn RateLimitBackend>, RateLimitError> {
    Err(RateLimitError::Config(
        "RATE_LIMIT_MODE=redis requires the backend-redis feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;

    struct FailingBackend;

    #[async_trait]
    impl RateLimitBackend for FailingBackend {
        async fn try_consume(&self, _: &str, _: u64) -> Result<ConsumptionProbe, RateLimitError> {
            Err(RateLimitError::Backend("connection refused".into()))
        }

        async fn reset(&self, _: &str) -> Result<(), RateLimitError> {
            Ok(())
        }

        async fn reset_prefix(&self, _: &str) -> Result<u64, RateLimitError> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn limiter(config: RateLimitConfig) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(LocalBackend::new(&config, clock.clone()));
        (clock, RateLimiter::new(&config, backend))
    }

    fn peer() -> SocketAddr {
        "198.51.100.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn backend_failure_fails_open() {
        let limiter = RateLimiter::new(&RateLimitConfig::default(), Arc::new(FailingBackend));
        let outcome = limiter.try_consume("t:ip:/", 1).await;
        assert!(outcome.allowed);
        assert!(outcome.failed_open);
    }

    #[tokio::test]
    async fn tenants_have_independent_buckets() {
        let mut config = RateLimitConfig::default();
        config.per_tenant_capacities.insert("a".into(), 1);
        config.per_tenant_capacities.insert("b".into(), 3);
        let (_, limiter) = limiter(config);
        let headers = HeaderMap::new();

        let first = limiter.check(Some("a"), &Method::GET, "/x", peer(), &headers).await.unwrap();
        assert!(first.allowed);
        let denied = limiter.check(Some("a"), &Method::GET, "/x", peer(), &headers).await.unwrap();
        assert!(!denied.allowed);

        let other = limiter.check(Some("b"), &Method::GET, "/x", peer(), &headers).await.unwrap();
        assert!(other.allowed);
        assert_eq!(other.remaining_tokens, 2);
    }

    #[tokio::test]
    async fn retry_after_is_rounded_up() {
        let mut config = RateLimitConfig::default();
        config.default_capacity = 2;
        config.refill_period = Duration::from_secs(3);
        let (_, limiter) = limiter(config);

        limiter.try_consume("k", 2).await;
        limiter.try_consume("k", 2).await;
        let denied = limiter.try_consume("k", 2).await;
        assert!(!denied.allowed);
        // 1.5s until the next token.
        assert_eq!(denied.retry_after_secs, 2);
    }

    #[tokio::test]
    async fn exempt_requests_do_not_consume() {
        let mut config = RateLimitConfig::default();
        config.default_capacity = 1;
        let (_, limiter) = limiter(config);
        let headers = HeaderMap::new();

        for _ in 0..3 {
            assert!(limiter
                .check(Some("a"), &Method::GET, "/static/site.css", peer(), &headers)
                .await
                .is_none());
            assert!(limiter
                .check(Some("a"), &Method::OPTIONS, "/api/x", peer(), &headers)
                .await
                .is_none());
        }
        assert!(limiter.check(Some("a"), &Method::POST, "/api/x", peer(), &headers).await.unwrap().allowed);
    }

    #[test]
    fn local_capacity_is_split_across_servers() {
        let mut config = RateLimitConfig::default();
        config.default_capacity = 100;
        config.server_count = 3;
        config.per_tenant_capacities.insert("tiny".into(), 2);
        let (_, limiter) = limiter(config);

        assert_eq!(limiter.capacity_for(None), 33);
        assert_eq!(limiter.capacity_for(Some("tiny")), 1);
    }

    #[test]
    fn key_uses_anonymous_without_tenant() {
        assert_eq!(bucket_key(None, "1.2.3.4", "/x"), "anonymous:1.2.3.4:/x");
        assert_eq!(bucket_key(Some("shop"), "1.2.3.4", "/x"), "shop:1.2.3.4:/x");
    }

    #[tokio::test]
    async fn reset_tenant_restores_capacity() {
        let mut config = RateLimitConfig::default();
        config.default_capacity = 1;
        let (_, limiter) = limiter(config);

        assert!(limiter.try_consume("shop:ip:/", 1).await.allowed);
        assert!(!limiter.try_consume("shop:ip:/", 1).await.allowed);
        limiter.reset_tenant("shop").await.unwrap();
        assert!(limiter.try_consume("shop:ip:/", 1).await.allowed);
    }

    #[tokio::test]
    async fn redis_mode_without_url_is_a_config_error() {
        let config = RateLimitConfig {
            mode: RateLimitMode::Redis,
            redis_url: None,
            ..RateLimitConfig::default()
        };
        let clock = Arc::new(ManualClock::new(0));
        match build_backend(&config, clock).await {
            Err(RateLimitError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(backend) => panic!("built {} without a redis url", backend.name()),
        }
    }

    #[tokio::test]
    async fn distributed_mode_builds_in_process_store() {
        let config = RateLimitConfig {
            mode: RateLimitMode::Distributed,
            ..RateLimitConfig::default()
        };
        let backend = build_backend(&config, Arc::new(ManualClock::new(0))).await.unwrap();
        assert_eq!(backend.name(), "distributed");
    }
}

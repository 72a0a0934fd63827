use std::sync::Arc;

use cms_admission_gateway::clock::system_clock;
use cms_admission_gateway::config::RateLimitConfig;
use cms_admission_gateway::ratelimit::{
    bucket_key, DistributedBackend, InMemoryBucketStore, LocalBackend, RateLimitBackend,
    RateLimiter,
};
use cms_pattern_match::{AntMatcher, PatternRuleIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub use cms_admission_gateway;
pub use cms_pattern_match;

/// Host index with one exact and one wildcard rule per tenant, plus a
/// deterministic mix of exact hits, wildcard hits and misses to look up.
pub struct HostLookupFixture {
    pub index: PatternRuleIndex<String>,
    pub hosts: Vec<String>,
}

impl HostLookupFixture {
    pub fn new(tenants: usize, samples: usize) -> Self {
        let tenants = tenants.max(1);
        let rules = (0..tenants).flat_map(|i| {
            [
                (format!("www.tenant{i}.com"), format!("tenant-{i}")),
                (format!("*.tenant{i}.com"), format!("tenant-{i}")),
            ]
        });
        let index = PatternRuleIndex::build(AntMatcher::hosts(), rules);

        let mut rng = StdRng::seed_from_u64(7);
        let hosts = (0..samples)
            .map(|_| {
                let i = rng.gen_range(0..tenants);
                match rng.gen_range(0..3) {
                    0 => format!("www.tenant{i}.com"),
                    1 => format!("shop{}.tenant{i}.com", rng.gen_range(0..100)),
                    _ => format!("unknown{i}.example.org"),
                }
            })
            .collect();

        Self { index, hosts }
    }
}

/// Rate limiter backends with a pool of `tenant:client:route` keys.
pub struct RateLimitFixture {
    pub local: Arc<dyn RateLimitBackend>,
    pub distributed: Arc<dyn RateLimitBackend>,
    pub limiter: RateLimiter,
    pub keys: Vec<String>,
    pub capacity: u64,
}

impl RateLimitFixture {
    pub fn new(clients: usize, capacity: u64) -> Self {
        let config = RateLimitConfig {
            default_capacity: capacity,
            ..RateLimitConfig::default()
        };
        let clock = system_clock();

        let local: Arc<dyn RateLimitBackend> = Arc::new(LocalBackend::new(&config, clock.clone()));
        let store = Arc::new(InMemoryBucketStore::new(clock.clone()));
        let distributed: Arc<dyn RateLimitBackend> =
            Arc::new(DistributedBackend::new(store, &config, clock));

        let keys = (0..clients.max(1))
            .map(|i| {
                bucket_key(
                    Some(&format!("tenant-{}", i % 8)),
                    &format!("10.0.{}.{}", i / 256, i % 256),
                    "/board/notice",
                )
            })
            .collect();

        Self {
            limiter: RateLimiter::new(&config, Arc::clone(&local)),
            local,
            distributed,
            keys,
            capacity,
        }
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cms_pattern_match::{normalize_host, AntMatcher, PatternRuleIndex, SharedPatternIndex};
use moka::sync::Cache;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TenantConfig;
use crate::events::{ChangeBus, ChangeEvent};
use crate::store::TenantStore;

use super::error::TenantError;
use super::types::TenantRule;

/// Cached outcome of a host lookup. Misses are cached too so repeated
/// requests for unknown hosts do not hit the matcher every time.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Tenant(String),
    Unknown,
}

/// Maps request hosts to tenant ids.
///
/// Lookups go through a bounded result cache, then the live
/// [`PatternRuleIndex`]. Refreshes rebuild the index off to the side, publish
/// it atomically and purge the result cache. Every cached result is stamped
/// with the rule generation it was computed from, so a lookup that raced a
/// refresh can never reintroduce a stale entry.
pub struct TenantResolver {
    store: Arc<dyn TenantStore>,
    index: SharedPatternIndex<String>,
    results: Cache<String, (u64, Resolution)>,
    generation: AtomicU64,
    refresh_lock: Mutex<()>,
    store_timeout: Duration,
    override_enabled: bool,
}

impl TenantResolver {
    pub fn new(store: Arc<dyn TenantStore>, config: &TenantConfig) -> Self {
        let results = Cache::builder()
            .max_capacity(config.result_cache.max_entries)
            .time_to_live(config.result_cache.ttl)
            .build();

        Self {
            store,
            index: SharedPatternIndex::new(PatternRuleIndex::empty(AntMatcher::hosts())),
            results,
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
            store_timeout: config.store_timeout,
            override_enabled: config.override_enabled,
        }
    }

    /// Resolves the tenant for a request.
    ///
    /// A non-empty override value is returned verbatim without consulting any
    /// rule.
    pub fn resolve(&self, host: &str, override_value: Option<&str>) -> Result<String, TenantError> {
        if self.override_enabled {
            if let Some(value) = override_value.filter(|v| !v.trim().is_empty()) {
                return Ok(value.to_string());
            }
        }

        let host = normalize_host(host);
        let generation = self.generation.load(Ordering::Acquire);

        if let Some((cached_at, resolution)) = self.results.get(&host) {
            if cached_at == generation {
                return resolution.into_result(&host);
            }
        }

        let resolution = match self.index.lookup(&host) {
            Some(tenant_id) => Resolution::Tenant(tenant_id),
            None => Resolution::Unknown,
        };
        debug!(host = %host, ?resolution, "resolved tenant from rules");

        self.results
            .insert(host.clone(), (generation, resolution.clone()));
        resolution.into_result(&host)
    }

    /// Reloads every rule from the store. On failure the current rules stay
    /// in effect.
    pub async fn refresh(&self) -> Result<usize, TenantError> {
        let _guard = self.refresh_lock.lock().await;

        let rules = match timeout(self.store_timeout, self.store.list_all_rules()).await {
            Ok(Ok(rules)) => rules,
            Ok(Err(err)) => {
                warn!(error = %err, "tenant rule refresh failed, keeping last known rules");
                return Err(TenantError::BackingStoreUnavailable(err.to_string()));
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "tenant rule refresh timed out, keeping last known rules"
                );
                return Err(TenantError::Timeout(self.store_timeout));
            }
        };

        let count = rules.len();
        self.install(rules);
        info!(rules = count, "tenant routing rules refreshed");
        Ok(count)
    }

    fn install(&self, rules: Vec<TenantRule>) {
        let index = PatternRuleIndex::build(
            AntMatcher::hosts(),
            rules
                .into_iter()
                .map(|rule| (rule.domain_pattern.to_ascii_lowercase(), rule.tenant_id)),
        );
        self.index.replace(index);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.results.invalidate_all();
    }

    pub fn rule_count(&self) -> usize {
        self.index.len()
    }

    /// Refreshes on a fixed interval and whenever a [`ChangeEvent::TenantRoutes`]
    /// arrives.
    pub fn start_refresh_task(self: &Arc<Self>, bus: &ChangeBus, period: Duration) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        let mut events = bus.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    event = events.recv() => match event {
                        Ok(ChangeEvent::TenantRoutes) => {
                            debug!("tenant routes changed, refreshing");
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "change events lagged, forcing tenant rule refresh");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }

                // Failures are logged inside refresh and the old rules stay active.
                let _ = resolver.refresh().await;
            }
        })
    }
}

impl Resolution {
    fn into_result(self, host: &str) -> Result<String, TenantError> {
        match self {
            Resolution::Tenant(tenant_id) => Ok(tenant_id),
            Resolution::Unknown => Err(TenantError::UnknownTenant(host.to_string())),
        }
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use moka::sync::Cache;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::events::{ChangeBus, ChangeEvent};
use crate::store::TenantStore;

use super::error::TenantError;
use super::types::TenantMetadata;

/// Cache-aside view of tenant metadata.
///
/// Successful loads are also remembered as last-known-good values, which are
/// served when the store is unreachable. `evict` only drops the cached copy.
pub struct TenantMetadataCache {
    store: Arc<dyn TenantStore>,
    cache: Cache<String, Arc<TenantMetadata>>,
    last_known_good: DashMap<String, Arc<TenantMetadata>>,
    evictions: AtomicU64,
    store_timeout: Duration,
}

impl TenantMetadataCache {
    pub fn new(store: Arc<dyn TenantStore>, settings: CacheSettings, store_timeout: Duration) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(settings.max_entries)
                .time_to_live(settings.ttl)
                .build(),
            last_known_good: DashMap::new(),
            evictions: AtomicU64::new(0),
            store_timeout,
        }
    }

    pub async fn get(&self, tenant_id: &str) -> Result<Arc<TenantMetadata>, TenantError> {
        if let Some(metadata) = self.cache.get(tenant_id) {
            return Ok(metadata);
        }

        let evictions_before = self.evictions.load(Ordering::Acquire);
        let loaded = timeout(self.store_timeout, self.store.get_metadata(tenant_id)).await;

        match loaded {
            Ok(Ok(Some(metadata))) => {
                let metadata = Arc::new(metadata);
                // An evict that ran while we were loading may have superseded what we read.
                if self.evictions.load(Ordering::Acquire) == evictions_before {
                    self.cache
                        .insert(tenant_id.to_string(), Arc::clone(&metadata));
                }
                self.last_known_good
                    .insert(tenant_id.to_string(), Arc::clone(&metadata));
                Ok(metadata)
            }
            Ok(Ok(None)) => {
                self.last_known_good.remove(tenant_id);
                Err(TenantError::UnknownTenant(tenant_id.to_string()))
            }
            Ok(Err(err)) => self.stale_or(tenant_id, TenantError::BackingStoreUnavailable(err.to_string())),
            Err(_) => self.stale_or(tenant_id, TenantError::Timeout(self.store_timeout)),
        }
    }

    fn stale_or(&self, tenant_id: &str, err: TenantError) -> Result<Arc<TenantMetadata>, TenantError> {
        match self.last_known_good.get(tenant_id) {
            Some(stale) => {
                warn!(tenant_id, error = %err, "serving last known tenant metadata");
                Ok(Arc::clone(stale.value()))
            }
            None => {
                warn!(tenant_id, error = %err, "tenant metadata unavailable");
                Err(err)
            }
        }
    }

    pub fn evict(&self, tenant_id: &str) {
        self.evictions.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate(tenant_id);
        debug!(tenant_id, "evicted tenant metadata");
    }

    pub fn evict_all(&self) {
        self.evictions.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate_all();
    }

    pub fn start_invalidation_task(self: &Arc<Self>, bus: &ChangeBus) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut events = bus.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChangeEvent::TenantMetadata(tenant_id)) => cache.evict(&tenant_id),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change events lagged, evicting all tenant metadata");
                        cache.evict_all();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryTenantStore, TenantAdminStore};

    fn settings() -> CacheSettings {
        CacheSettings {
            max_entries: 100,
            ttl: Duration::from_secs(600),
        }
    }

    async fn seeded() -> (Arc<MemoryTenantStore>, TenantMetadataCache) {
        let store = Arc::new(MemoryTenantStore::new());
        store
            .insert_tenant(&TenantMetadata::new("shop", "Shop"), &[])
            .await
            .unwrap();
        let cache = TenantMetadataCache::new(store.clone(), settings(), Duration::from_millis(100));
        (store, cache)
    }

    #[tokio::test]
    async fn unknown_tenant_is_an_error() {
        let (_, cache) = seeded().await;
        assert_eq!(
            cache.get("nope").await.unwrap_err(),
            TenantError::UnknownTenant("nope".into())
        );
    }

    #[tokio::test]
    async fn evict_reloads_updated_metadata() {
        let (store, cache) = seeded().await;
        assert_eq!(cache.get("shop").await.unwrap().theme_id, "default");

        let mut updated = TenantMetadata::new("shop", "Shop");
        updated.theme_id = "dark".into();
        store.update_metadata(&updated).await.unwrap();

        assert_eq!(cache.get("shop").await.unwrap().theme_id, "default");
        cache.evict("shop");
        assert_eq!(cache.get("shop").await.unwrap().theme_id, "dark");
    }

    #[tokio::test]
    async fn store_outage_serves_last_known_good() {
        let (store, cache) = seeded().await;
        cache.get("shop").await.unwrap();
        cache.evict("shop");

        store.set_unavailable(true);
        assert_eq!(cache.get("shop").await.unwrap().display_name, "Shop");
        assert!(matches!(
            cache.get("other").await,
            Err(TenantError::BackingStoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn invalidation_task_evicts_on_event() {
        let (store, cache) = seeded().await;
        let cache = Arc::new(cache);
        let bus = ChangeBus::new();
        let task = cache.start_invalidation_task(&bus);

        cache.get("shop").await.unwrap();
        let mut updated = TenantMetadata::new("shop", "Renamed");
        updated.maintenance_mode = true;
        store.update_metadata(&updated).await.unwrap();
        bus.publish(ChangeEvent::TenantMetadata("shop".into()));

        let mut refreshed = false;
        for _ in 0..50 {
            if cache.get("shop").await.unwrap().maintenance_mode {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refreshed);
        task.abort();
    }
}

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
use crate::store::RouteStore;

use super::error::RouteError;
use super::table::RouteTable;
use super::types::RouteRule;

/// Resolves request paths to route rules, caching each tenant's whole rule
/// set as one [`RouteTable`].
///
/// Invalidation drops a tenant's table wholesale. If the store is unreachable
/// the last table loaded for the tenant keeps serving.
pub struct RouteResolver {
    store: Arc<dyn RouteStore>,
    tables: Cache<String, Arc<RouteTable>>,
    last_known_good: DashMap<String, Arc<RouteTable>>,
    invalidations: AtomicU64,
    store_timeout: Duration,
}

impl RouteResolver {
    pub fn new(store: Arc<dyn RouteStore>, settings: CacheSettings, store_timeout: Duration) -> Self {
        Self {
            store,
            tables: Cache::builder()
                .max_capacity(settings.max_entries)
                .time_to_live(settings.ttl)
                .build(),
            last_known_good: DashMap::new(),
            invalidations: AtomicU64::new(0),
            store_timeout,
        }
    }

    pub async fn table(&self, tenant_id: &str) -> Result<Arc<RouteTable>, RouteError> {
        if let Some(table) = self.tables.get(tenant_id) {
            return Ok(table);
        }

        let invalidations_before = self.invalidations.load(Ordering::Acquire);
        let loaded = timeout(self.store_timeout, self.store.list_rules(tenant_id)).await;

        let failure = match loaded {
            Ok(Ok(rules)) => {
                let table = Arc::new(RouteTable::new(rules));
                if self.invalidations.load(Ordering::Acquire) == invalidations_before {
                    self.tables.insert(tenant_id.to_string(), Arc::clone(&table));
                }
                self.last_known_good
                    .insert(tenant_id.to_string(), Arc::clone(&table));
                debug!(tenant_id, routes = table.len(), "loaded route table");
                return Ok(table);
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("timed out after {:?}", self.store_timeout),
        };

        match self.last_known_good.get(tenant_id) {
            Some(stale) => {
                warn!(tenant_id, error = %failure, "serving last known route table");
                Ok(Arc::clone(stale.value()))
            }
            None => {
                warn!(tenant_id, error = %failure, "route table unavailable");
                Err(RouteError::BackingStoreUnavailable(failure))
            }
        }
    }

    pub async fn resolve(&self, tenant_id: &str, path: &str) -> Result<Arc<RouteRule>, RouteError> {
        self.table(tenant_id)
            .await?
            .resolve(path)
            .ok_or_else(|| RouteError::NotFound(path.to_string()))
    }

    pub fn invalidate(&self, tenant_id: &str) {
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        self.tables.invalidate(tenant_id);
        debug!(tenant_id, "invalidated route table");
    }

    pub fn invalidate_all(&self) {
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        self.tables.invalidate_all();
    }

    pub fn start_invalidation_task(self: &Arc<Self>, bus: &ChangeBus) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        let mut events = bus.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChangeEvent::Routes(tenant_id)) => resolver.invalidate(&tenant_id),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change events lagged, invalidating all route tables");
                        resolver.invalidate_all();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

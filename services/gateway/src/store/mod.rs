//! Persistence contracts consumed by the admission core, with in-memory and
//! SQLite implementations.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageBackend, StorageConfig};
use crate::route::{NewRouteRule, RouteRule};
use crate::tenant::{TenantMetadata, TenantRule};

pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use error::StoreError;
pub use memory::{MemoryRouteStore, MemoryTenantStore};
pub use sqlite::SqliteStore;

pub const GATEWAY_DB_FILENAME: &str = "gateway.db";

/// Read side of the tenant store. Assumed eventually consistent.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn list_all_rules(&self) -> Result<Vec<TenantRule>, StoreError>;

    async fn get_metadata(&self, tenant_id: &str) -> Result<Option<TenantMetadata>, StoreError>;
}

#[async_trait]
pub trait TenantAdminStore: TenantStore {
    /// Inserts a tenant together with its domain rules as one unit.
    async fn insert_tenant(
        &self,
        metadata: &TenantMetadata,
        rules: &[TenantRule],
    ) -> Result<(), StoreError>;

    async fn update_metadata(&self, metadata: &TenantMetadata) -> Result<(), StoreError>;

    /// Removes the tenant and every domain rule pointing at it. Backends that
    /// also hold routes drop them in the same unit.
    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), StoreError>;

    async fn insert_domain_rule(&self, rule: &TenantRule) -> Result<(), StoreError>;

    async fn delete_domain_rule(&self, domain_pattern: &str) -> Result<TenantRule, StoreError>;

    /// Repoints the rule at `current` to `replacement` in one step. The
    /// original rule stays in place when the replacement is rejected.
    async fn replace_domain_rule(
        &self,
        current: &str,
        replacement: &str,
    ) -> Result<TenantRule, StoreError>;
}

#[async_trait]
pub trait RouteStore: Send + Sync {
    async fn list_rules(&self, tenant_id: &str) -> Result<Vec<RouteRule>, StoreError>;
}

#[async_trait]
pub trait RouteAdminStore: RouteStore {
    async fn get_rule(&self, id: u64) -> Result<Option<RouteRule>, StoreError>;

    async fn insert_rule(&self, tenant_id: &str, rule: NewRouteRule)
        -> Result<RouteRule, StoreError>;

    async fn update_rule(&self, rule: &RouteRule) -> Result<(), StoreError>;

    async fn delete_rule(&self, id: u64) -> Result<(), StoreError>;

    /// Drops every route owned by `tenant_id`, returning how many went.
    async fn delete_rules_for_tenant(&self, tenant_id: &str) -> Result<u64, StoreError>;

    /// Applies `(id, display_order)` pairs for one tenant atomically.
    async fn set_display_orders(
        &self,
        tenant_id: &str,
        orders: &[(u64, i32)],
    ) -> Result<(), StoreError>;
}

/// Store handles wired into the gateway. Read and write handles point at the
/// same backing store.
#[derive(Clone)]
pub struct Stores {
    pub tenants: Arc<dyn TenantStore>,
    pub tenant_admin: Arc<dyn TenantAdminStore>,
    pub routes: Arc<dyn RouteStore>,
    pub route_admin: Arc<dyn RouteAdminStore>,
}

impl Stores {
    pub fn memory(tenants: Arc<MemoryTenantStore>, routes: Arc<MemoryRouteStore>) -> Self {
        Self {
            tenants: tenants.clone(),
            tenant_admin: tenants,
            routes: routes.clone(),
            route_admin: routes,
        }
    }

    pub fn sqlite(store: Arc<SqliteStore>) -> Self {
        Self {
            tenants: store.clone(),
            tenant_admin: store.clone(),
            routes: store.clone(),
            route_admin: store,
        }
    }

    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::memory(
                Arc::new(MemoryTenantStore::new()),
                Arc::new(MemoryRouteStore::new()),
            )),
            StorageBackend::Sqlite => Ok(Self::sqlite(Arc::new(SqliteStore::open(
                &config.data_dir,
            )?))),
        }
    }
}

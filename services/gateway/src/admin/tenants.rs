use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cms_pattern_match::validate_domain_pattern;
use serde::Deserialize;
use tracing::info;

use crate::events::{ChangeBus, ChangeEvent};
use crate::store::{RouteAdminStore, TenantAdminStore};
use crate::tenant::{TenantMetadata, TenantRule};

use super::error::AdminError;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTenant {
    pub tenant_id: String,
    pub display_name: String,
    #[serde(default)]
    pub theme_id: Option<String>,
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default)]
    pub read_only_mode: bool,
    #[serde(default)]
    pub feature_flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Partial metadata update; absent fields keep their value. Flags are merged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTenant {
    pub display_name: Option<String>,
    pub theme_id: Option<String>,
    pub maintenance_mode: Option<bool>,
    pub read_only_mode: Option<bool>,
    #[serde(default)]
    pub feature_flags: BTreeMap<String, bool>,
}

/// Write path for tenants and their domain rules. Change events go out only
/// after the store call has returned successfully.
pub struct TenantAdmin {
    store: Arc<dyn TenantAdminStore>,
    routes: Arc<dyn RouteAdminStore>,
    bus: ChangeBus,
}

impl TenantAdmin {
    pub fn new(
        store: Arc<dyn TenantAdminStore>,
        routes: Arc<dyn RouteAdminStore>,
        bus: ChangeBus,
    ) -> Self {
        Self { store, routes, bus }
    }

    pub async fn list_rules(&self) -> Result<Vec<TenantRule>, AdminError> {
        Ok(self.store.list_all_rules().await?)
    }

    pub async fn get(&self, tenant_id: &str) -> Result<TenantMetadata, AdminError> {
        self.store
            .get_metadata(tenant_id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("tenant {tenant_id}")))
    }

    pub async fn create(&self, request: CreateTenant) -> Result<TenantMetadata, AdminError> {
        validate_tenant_id(&request.tenant_id)?;
        if request.display_name.trim().is_empty() {
            return Err(AdminError::Validation("display_name must not be empty".into()));
        }

        let mut seen = BTreeSet::new();
        let mut rules = Vec::with_capacity(request.domains.len());
        for domain in &request.domains {
            let pattern = validate_domain_pattern(domain)?;
            if !seen.insert(pattern.clone()) {
                return Err(AdminError::Validation(format!("domain {pattern} listed twice")));
            }
            rules.push(TenantRule {
                domain_pattern: pattern,
                tenant_id: request.tenant_id.clone(),
            });
        }

        let mut metadata = TenantMetadata::new(request.tenant_id.trim(), request.display_name.trim());
        if let Some(theme) = request.theme_id.filter(|t| !t.trim().is_empty()) {
            metadata.theme_id = theme;
        }
        metadata.maintenance_mode = request.maintenance_mode;
        metadata.read_only_mode = request.read_only_mode;
        metadata.feature_flags.extend(request.feature_flags);

        self.store.insert_tenant(&metadata, &rules).await?;
        info!(tenant_id = %metadata.tenant_id, domains = rules.len(), "tenant created");

        if !rules.is_empty() {
            self.bus.publish(ChangeEvent::TenantRoutes);
        }
        Ok(metadata)
    }

    pub async fn update(&self, tenant_id: &str, update: UpdateTenant) -> Result<TenantMetadata, AdminError> {
        let mut metadata = self.get(tenant_id).await?;

        if let Some(name) = update.display_name {
            if name.trim().is_empty() {
                return Err(AdminError::Validation("display_name must not be empty".into()));
            }
            metadata.display_name = name;
        }
        if let Some(theme) = update.theme_id {
            metadata.theme_id = theme;
        }
        if let Some(maintenance) = update.maintenance_mode {
            metadata.maintenance_mode = maintenance;
        }
        if let Some(read_only) = update.read_only_mode {
            metadata.read_only_mode = read_only;
        }
        metadata.feature_flags.extend(update.feature_flags);

        self.store.update_metadata(&metadata).await?;
        info!(tenant_id, "tenant metadata updated");
        self.bus
            .publish(ChangeEvent::TenantMetadata(tenant_id.to_string()));
        Ok(metadata)
    }

    pub async fn add_domain(&self, tenant_id: &str, domain: &str) -> Result<TenantRule, AdminError> {
        let rule = TenantRule {
            domain_pattern: validate_domain_pattern(domain)?,
            tenant_id: tenant_id.to_string(),
        };
        self.store.insert_domain_rule(&rule).await?;
        info!(tenant_id, domain = %rule.domain_pattern, "domain rule added");
        self.bus.publish(ChangeEvent::TenantRoutes);
        Ok(rule)
    }

    pub async fn remove_domain(&self, domain: &str) -> Result<TenantRule, AdminError> {
        let removed = self
            .store
            .delete_domain_rule(&domain.trim().to_ascii_lowercase())
            .await?;
        info!(tenant_id = %removed.tenant_id, domain = %removed.domain_pattern, "domain rule removed");
        self.bus.publish(ChangeEvent::TenantRoutes);
        Ok(removed)
    }

    /// Moves a tenant from one domain pattern to another.
    pub async fn replace_domain(&self, current: &str, replacement: &str) -> Result<TenantRule, AdminError> {
        let current = current.trim().to_ascii_lowercase();
        let replacement = validate_domain_pattern(replacement)?;
        let rule = self.store.replace_domain_rule(&current, &replacement).await?;
        info!(tenant_id = %rule.tenant_id, from = %current, to = %rule.domain_pattern, "domain rule replaced");
        self.bus.publish(ChangeEvent::TenantRoutes);
        Ok(rule)
    }

    pub async fn delete(&self, tenant_id: &str) -> Result<(), AdminError> {
        self.store.delete_tenant(tenant_id).await?;
        let routes = self.routes.delete_rules_for_tenant(tenant_id).await?;
        info!(tenant_id, routes, "tenant deleted");
        self.bus.publish(ChangeEvent::TenantRoutes);
        self.bus
            .publish(ChangeEvent::TenantMetadata(tenant_id.to_string()));
        self.bus.publish(ChangeEvent::Routes(tenant_id.to_string()));
        Ok(())
    }
}

fn validate_tenant_id(tenant_id: &str) -> Result<(), AdminError> {
    let trimmed = tenant_id.trim();
    if trimmed.is_empty() {
        return Err(AdminError::Validation("tenant_id must not be empty".into()));
    }
    if trimmed != tenant_id
        || !tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AdminError::Validation(format!(
            "tenant_id may only contain letters, digits, '-' and '_': {tenant_id}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::route::NewRouteRule;
    use crate::store::{MemoryRouteStore, MemoryTenantStore, RouteStore, TenantStore};

    fn admin() -> (Arc<MemoryTenantStore>, ChangeBus, TenantAdmin) {
        let (store, _, bus, admin) = admin_with_routes();
        (store, bus, admin)
    }

    fn admin_with_routes() -> (Arc<MemoryTenantStore>, Arc<MemoryRouteStore>, ChangeBus, TenantAdmin) {
        let store = Arc::new(MemoryTenantStore::new());
        let routes = Arc::new(MemoryRouteStore::new());
        let bus = ChangeBus::new();
        let admin = TenantAdmin::new(store.clone(), routes.clone(), bus.clone());
        (store, routes, bus, admin)
    }

    fn create(tenant_id: &str, domains: &[&str]) -> CreateTenant {
        CreateTenant {
            tenant_id: tenant_id.into(),
            display_name: tenant_id.to_uppercase(),
            theme_id: None,
            maintenance_mode: false,
            read_only_mode: false,
            feature_flags: BTreeMap::new(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn create_publishes_after_write() {
        let (store, bus, admin) = admin();
        let mut events = bus.subscribe();

        admin.create(create("shop", &["Shop.com", "*.shop.com"])).await.unwrap();

        assert_eq!(events.try_recv().unwrap(), ChangeEvent::TenantRoutes);
        let rules = store.list_all_rules().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|r| r.domain_pattern == "shop.com"));
    }

    #[tokio::test]
    async fn duplicate_tenant_or_domain_is_rejected() {
        let (_, _, admin) = admin();
        admin.create(create("shop", &["shop.com"])).await.unwrap();

        assert!(matches!(
            admin.create(create("shop", &[])).await,
            Err(AdminError::Conflict(_))
        ));
        assert!(matches!(
            admin.create(create("other", &["SHOP.com"])).await,
            Err(AdminError::Conflict(_))
        ));
        assert!(matches!(
            admin.create(create("twice", &["a.com", "a.com"])).await,
            Err(AdminError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected_without_event() {
        let (_, bus, admin) = admin();
        let mut events = bus.subscribe();

        assert!(matches!(
            admin.create(create("shop", &["*.*.shop.com"])).await,
            Err(AdminError::Pattern(_))
        ));
        assert!(matches!(
            admin.create(create("bad id", &[])).await,
            Err(AdminError::Validation(_))
        ));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn metadata_update_only_publishes_metadata_event() {
        let (_, bus, admin) = admin();
        admin.create(create("shop", &["shop.com"])).await.unwrap();
        let mut events = bus.subscribe();

        let updated = admin
            .update(
                "shop",
                UpdateTenant {
                    maintenance_mode: Some(true),
                    theme_id: Some("dark".into()),
                    ..UpdateTenant::default()
                },
            )
            .await
            .unwrap();

        assert!(updated.maintenance_mode);
        assert_eq!(updated.display_name, "SHOP");
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::TenantMetadata("shop".into()));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn replace_domain_moves_rule() {
        let (store, _, admin) = admin();
        admin.create(create("shop", &["shop.com"])).await.unwrap();

        admin.replace_domain("shop.com", "shop.co.kr").await.unwrap();
        let rules = store.list_all_rules().await.unwrap();
        assert_eq!(
            rules,
            vec![TenantRule {
                domain_pattern: "shop.co.kr".into(),
                tenant_id: "shop".into()
            }]
        );
        assert!(matches!(
            admin.replace_domain("missing.com", "x.com").await,
            Err(AdminError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_publishes_all_invalidations() {
        let (_, bus, admin) = admin();
        admin.create(create("shop", &["shop.com"])).await.unwrap();
        let mut events = bus.subscribe();

        admin.delete("shop").await.unwrap();
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::TenantRoutes);
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::TenantMetadata("shop".into()));
        assert_eq!(events.try_recv().unwrap(), ChangeEvent::Routes("shop".into()));
        assert!(matches!(admin.delete("shop").await, Err(AdminError::NotFound(_))));
    }

    #[tokio::test]
    async fn replace_domain_conflict_keeps_original() {
        let (store, bus, admin) = admin();
        admin.create(create("shop", &["shop.com"])).await.unwrap();
        admin.create(create("blog", &["blog.com"])).await.unwrap();
        let mut events = bus.subscribe();

        assert!(matches!(
            admin.replace_domain("shop.com", "blog.com").await,
            Err(AdminError::Conflict(_))
        ));
        let rules = store.list_all_rules().await.unwrap();
        assert!(rules
            .iter()
            .any(|r| r.domain_pattern == "shop.com" && r.tenant_id == "shop"));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn delete_drops_tenant_routes() {
        let (_, routes, _, admin) = admin_with_routes();
        admin.create(create("shop", &["shop.com"])).await.unwrap();
        routes.insert_rule("shop", NewRouteRule::new("Home", "/")).await.unwrap();
        routes.insert_rule("blog", NewRouteRule::new("Home", "/")).await.unwrap();

        admin.delete("shop").await.unwrap();
        admin.create(create("shop", &["shop.com"])).await.unwrap();
        assert!(routes.list_rules("shop").await.unwrap().is_empty());
        assert_eq!(routes.list_rules("blog").await.unwrap().len(), 1);
    }
}

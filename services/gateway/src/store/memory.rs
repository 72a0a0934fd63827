use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{RouteAdminStore, RouteStore, StoreError, TenantAdminStore, TenantStore};
use crate::route::{NewRouteRule, RouteRule};
use crate::tenant::{TenantMetadata, TenantRule};

/// Switches used to simulate an unreachable or slow backing store.
#[derive(Debug, Default)]
struct FaultInjection {
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl FaultInjection {
    async fn check(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryTenantStore {
    tenants: DashMap<String, TenantMetadata>,
    // Serializes multi-map writes so tenant + rules land together.
    rules: Mutex<Vec<TenantRule>>,
    faults: FaultInjection,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn list_all_rules(&self) -> Result<Vec<TenantRule>, StoreError> {
        self.faults.check().await?;
        let mut rules = self.rules.lock().clone();
        rules.sort_by(|a, b| a.domain_pattern.cmp(&b.domain_pattern));
        Ok(rules)
    }

    async fn get_metadata(&self, tenant_id: &str) -> Result<Option<TenantMetadata>, StoreError> {
        self.faults.check().await?;
        Ok(self.tenants.get(tenant_id).map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl TenantAdminStore for MemoryTenantStore {
    async fn insert_tenant(
        &self,
        metadata: &TenantMetadata,
        rules: &[TenantRule],
    ) -> Result<(), StoreError> {
        self.faults.check().await?;
        let mut existing = self.rules.lock();
        if self.tenants.contains_key(&metadata.tenant_id) {
            return Err(StoreError::Conflict(format!("tenant {}", metadata.tenant_id)));
        }
        if let Some(dup) = rules
            .iter()
            .find(|rule| existing.iter().any(|e| e.domain_pattern == rule.domain_pattern))
        {
            return Err(StoreError::Conflict(format!(
                "domain pattern {}",
                dup.domain_pattern
            )));
        }
        self.tenants
            .insert(metadata.tenant_id.clone(), metadata.clone());
        existing.extend(rules.iter().cloned());
        Ok(())
    }

    async fn update_metadata(&self, metadata: &TenantMetadata) -> Result<(), StoreError> {
        self.faults.check().await?;
        match self.tenants.get_mut(&metadata.tenant_id) {
            Some(mut entry) => {
                *entry = metadata.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("tenant {}", metadata.tenant_id))),
        }
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), StoreError> {
        self.faults.check().await?;
        let mut rules = self.rules.lock();
        if self.tenants.remove(tenant_id).is_none() {
            return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
        }
        rules.retain(|rule| rule.tenant_id != tenant_id);
        Ok(())
    }

    async fn insert_domain_rule(&self, rule: &TenantRule) -> Result<(), StoreError> {
        self.faults.check().await?;
        let mut rules = self.rules.lock();
        if !self.tenants.contains_key(&rule.tenant_id) {
            return Err(StoreError::NotFound(format!("tenant {}", rule.tenant_id)));
        }
        if rules.iter().any(|e| e.domain_pattern == rule.domain_pattern) {
            return Err(StoreError::Conflict(format!(
                "domain pattern {}",
                rule.domain_pattern
            )));
        }
        rules.push(rule.clone());
        Ok(())
    }

    async fn delete_domain_rule(&self, domain_pattern: &str) -> Result<TenantRule, StoreError> {
        self.faults.check().await?;
        let mut rules = self.rules.lock();
        match rules.iter().position(|rule| rule.domain_pattern == domain_pattern) {
            Some(at) => Ok(rules.remove(at)),
            None => Err(StoreError::NotFound(format!("domain pattern {domain_pattern}"))),
        }
    }

    async fn replace_domain_rule(
        &self,
        current: &str,
        replacement: &str,
    ) -> Result<TenantRule, StoreError> {
        self.faults.check().await?;
        let mut rules = self.rules.lock();
        let at = rules
            .iter()
            .position(|rule| rule.domain_pattern == current)
            .ok_or_else(|| StoreError::NotFound(format!("domain pattern {current}")))?;
        if current != replacement && rules.iter().any(|e| e.domain_pattern == replacement) {
            return Err(StoreError::Conflict(format!("domain pattern {replacement}")));
        }
        rules[at].domain_pattern = replacement.to_string();
        Ok(rules[at].clone())
    }
}

#[derive(Debug)]
pub struct MemoryRouteStore {
    rules: DashMap<u64, RouteRule>,
    next_id: AtomicU64,
    faults: FaultInjection,
}

impl Default for MemoryRouteStore {
    fn default() -> Self {
        Self {
            rules: DashMap::new(),
            next_id: AtomicU64::new(1),
            faults: FaultInjection::default(),
        }
    }
}

impl MemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::Relaxed);
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn list_rules(&self, tenant_id: &str) -> Result<Vec<RouteRule>, StoreError> {
        self.faults.check().await?;
        let mut rules: Vec<RouteRule> = self
            .rules
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .map(|entry| entry.value().clone())
            .collect();
        rules.sort_by_key(|rule| rule.id);
        Ok(rules)
    }
}

#[async_trait]
impl RouteAdminStore for MemoryRouteStore {
    async fn get_rule(&self, id: u64) -> Result<Option<RouteRule>, StoreError> {
        self.faults.check().await?;
        Ok(self.rules.get(&id).map(|entry| entry.value().clone()))
    }

    async fn insert_rule(
        &self,
        tenant_id: &str,
        rule: NewRouteRule,
    ) -> Result<RouteRule, StoreError> {
        self.faults.check().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rule = rule.into_rule(id, tenant_id);
        self.rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: &RouteRule) -> Result<(), StoreError> {
        self.faults.check().await?;
        match self.rules.get_mut(&rule.id) {
            Some(mut entry) => {
                *entry = rule.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("route {}", rule.id))),
        }
    }

    async fn delete_rule(&self, id: u64) -> Result<(), StoreError> {
        self.faults.check().await?;
        self.rules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("route {id}")))
    }

    async fn delete_rules_for_tenant(&self, tenant_id: &str) -> Result<u64, StoreError> {
        self.faults.check().await?;
        let before = self.rules.len();
        self.rules.retain(|_, rule| rule.tenant_id != tenant_id);
        Ok(before.saturating_sub(self.rules.len()) as u64)
    }

    async fn set_display_orders(
        &self,
        tenant_id: &str,
        orders: &[(u64, i32)],
    ) -> Result<(), StoreError> {
        self.faults.check().await?;
        for (id, _) in orders {
            match self.rules.get(id) {
                Some(rule) if rule.tenant_id == tenant_id => {}
                _ => return Err(StoreError::NotFound(format!("route {id}"))),
            }
        }
        for (id, order) in orders {
            if let Some(mut rule) = self.rules.get_mut(id) {
                rule.display_order = *order;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tenant_insert_rejects_duplicate_pattern() {
        let store = MemoryTenantStore::new();
        let rule = |tenant: &str| TenantRule {
            domain_pattern: "shop.com".into(),
            tenant_id: tenant.into(),
        };
        store
            .insert_tenant(&TenantMetadata::new("a", "A"), &[rule("a")])
            .await
            .unwrap();
        let err = store
            .insert_tenant(&TenantMetadata::new("b", "B"), &[rule("b")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get_metadata("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_tenant_cascades_rules() {
        let store = MemoryTenantStore::new();
        store
            .insert_tenant(
                &TenantMetadata::new("a", "A"),
                &[TenantRule {
                    domain_pattern: "a.com".into(),
                    tenant_id: "a".into(),
                }],
            )
            .await
            .unwrap();
        store.delete_tenant("a").await.unwrap();
        assert!(store.list_all_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_domain_keeps_rule_on_conflict() {
        let store = MemoryTenantStore::new();
        let rule = |pattern: &str, tenant: &str| TenantRule {
            domain_pattern: pattern.into(),
            tenant_id: tenant.into(),
        };
        store
            .insert_tenant(&TenantMetadata::new("a", "A"), &[rule("a.com", "a")])
            .await
            .unwrap();
        store
            .insert_tenant(&TenantMetadata::new("b", "B"), &[rule("b.com", "b")])
            .await
            .unwrap();

        let err = store.replace_domain_rule("a.com", "b.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let moved = store.replace_domain_rule("a.com", "*.a.com").await.unwrap();
        assert_eq!(moved.tenant_id, "a");
        let patterns: Vec<String> = store
            .list_all_rules()
            .await
            .unwrap()
            .into_iter()
            .map(|rule| rule.domain_pattern)
            .collect();
        assert_eq!(patterns, vec!["*.a.com", "b.com"]);
    }

    #[tokio::test]
    async fn tenant_routes_are_dropped_together() {
        let store = MemoryRouteStore::new();
        store.insert_rule("a", NewRouteRule::new("Home", "/")).await.unwrap();
        store.insert_rule("a", NewRouteRule::new("Cart", "/cart")).await.unwrap();
        store.insert_rule("b", NewRouteRule::new("Home", "/")).await.unwrap();

        assert_eq!(store.delete_rules_for_tenant("a").await.unwrap(), 2);
        assert!(store.list_rules("a").await.unwrap().is_empty());
        assert_eq!(store.list_rules("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = MemoryRouteStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_rules("a").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn reorder_rejects_foreign_rule() {
        let store = MemoryRouteStore::new();
        let mine = store
            .insert_rule("a", NewRouteRule::new("Home", "/"))
            .await
            .unwrap();
        let theirs = store
            .insert_rule("b", NewRouteRule::new("Home", "/"))
            .await
            .unwrap();
        let err = store
            .set_display_orders("a", &[(mine.id, 1), (theirs.id, 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.get_rule(mine.id).await.unwrap().unwrap().display_order, 0);
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::events::{ChangeBus, ChangeEvent};
use crate::route::{NewRouteRule, RouteRule, RouteType};
use crate::store::RouteAdminStore;

use super::error::AdminError;

/// Write path for route rules. Every change publishes
/// [`ChangeEvent::Routes`] for the owning tenant once the store has applied it.
pub struct RouteAdmin {
    store: Arc<dyn RouteAdminStore>,
    bus: ChangeBus,
}

impl RouteAdmin {
    pub fn new(store: Arc<dyn RouteAdminStore>, bus: ChangeBus) -> Self {
        Self { store, bus }
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<RouteRule>, AdminError> {
        Ok(self.store.list_rules(tenant_id).await?)
    }

    pub async fn create(&self, tenant_id: &str, mut rule: NewRouteRule) -> Result<RouteRule, AdminError> {
        normalize(&mut rule);
        self.validate(tenant_id, &rule, None).await?;
        let created = self.store.insert_rule(tenant_id, rule).await?;
        info!(tenant_id, route_id = created.id, pattern = %created.url_pattern, "route created");
        self.publish(tenant_id);
        Ok(created)
    }

    pub async fn update(&self, tenant_id: &str, id: u64, mut rule: NewRouteRule) -> Result<RouteRule, AdminError> {
        self.owned_rule(tenant_id, id).await?;
        normalize(&mut rule);
        self.validate(tenant_id, &rule, Some(id)).await?;

        let updated = rule.into_rule(id, tenant_id);
        self.store.update_rule(&updated).await?;
        info!(tenant_id, route_id = id, "route updated");
        self.publish(tenant_id);
        Ok(updated)
    }

    /// Deletes a rule. A rule can only be removed through its own tenant.
    pub async fn delete(&self, tenant_id: &str, id: u64) -> Result<(), AdminError> {
        self.owned_rule(tenant_id, id).await?;
        self.store.delete_rule(id).await?;
        info!(tenant_id, route_id = id, "route deleted");
        self.publish(tenant_id);
        Ok(())
    }

    /// Assigns display order `position + 1` following the order of `ids`.
    pub async fn reorder(&self, tenant_id: &str, ids: &[u64]) -> Result<Vec<RouteRule>, AdminError> {
        let mut seen = HashSet::new();
        if let Some(dup) = ids.iter().find(|id| !seen.insert(**id)) {
            return Err(AdminError::Validation(format!("route {dup} listed twice")));
        }
        for id in ids {
            self.owned_rule(tenant_id, *id).await?;
        }

        let orders: Vec<(u64, i32)> = ids
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position as i32 + 1))
            .collect();
        self.store.set_display_orders(tenant_id, &orders).await?;
        info!(tenant_id, routes = ids.len(), "routes reordered");
        self.publish(tenant_id);
        self.list(tenant_id).await
    }

    async fn owned_rule(&self, tenant_id: &str, id: u64) -> Result<RouteRule, AdminError> {
        let rule = self
            .store
            .get_rule(id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("route {id}")))?;
        if rule.tenant_id != tenant_id {
            return Err(AdminError::Forbidden(format!(
                "route {id} does not belong to tenant {tenant_id}"
            )));
        }
        Ok(rule)
    }

    async fn validate(&self, tenant_id: &str, rule: &NewRouteRule, id: Option<u64>) -> Result<(), AdminError> {
        if rule.name.trim().is_empty() {
            return Err(AdminError::Validation("name must not be empty".into()));
        }
        let pattern = rule.url_pattern.as_str();
        if pattern.is_empty() && rule.route_type != RouteType::Group {
            return Err(AdminError::Validation("url_pattern is required".into()));
        }
        if !pattern.is_empty() && !pattern.starts_with('/') {
            return Err(AdminError::Validation(format!(
                "url_pattern must start with '/': {pattern}"
            )));
        }
        if let Some(parent) = rule.parent_id {
            if Some(parent) == id {
                return Err(AdminError::Validation("a route cannot be its own parent".into()));
            }
            self.owned_rule(tenant_id, parent).await?;
        }
        Ok(())
    }

    fn publish(&self, tenant_id: &str) {
        self.bus.publish(ChangeEvent::Routes(tenant_id.to_string()));
    }
}

/// The pattern that gets validated is the one that gets stored.
fn normalize(rule: &mut NewRouteRule) {
    rule.url_pattern = rule.url_pattern.trim().to_string();
}

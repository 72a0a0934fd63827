use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SessionConfig;

use super::error::SessionError;
use super::policy::{SessionLimit, SessionLimitPolicy};
use super::registry::{PrincipalKey, SessionRegistry};

/// A successful authentication as reported by the login flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    pub identity: String,
    pub tenant_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionGrant {
    pub handle: String,
    /// `None` when the principal is unlimited.
    pub limit: Option<usize>,
    pub evicted: Vec<String>,
}

/// Applies the concurrent-session limit on each login.
pub struct SessionPolicyEngine {
    policy: SessionLimitPolicy,
    registry: Arc<SessionRegistry>,
    reject_when_exceeded: bool,
}

impl SessionPolicyEngine {
    pub fn new(config: &SessionConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            policy: SessionLimitPolicy::from_config(config),
            registry,
            reject_when_exceeded: config.reject_when_exceeded,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn limit_for(&self, tenant_id: &str, roles: &[String]) -> SessionLimit {
        self.policy.resolve(tenant_id, roles)
    }

    pub fn on_authenticated(&self, auth: &Authentication) -> Result<SessionGrant, SessionError> {
        let limit = self.limit_for(&auth.tenant_id, &auth.roles);
        let principal = PrincipalKey::new(auth.identity.clone(), auth.tenant_id.clone());
        let registration = self
            .registry
            .register(principal, limit, self.reject_when_exceeded)?;

        info!(
            identity = %auth.identity,
            tenant_id = %auth.tenant_id,
            ?limit,
            evicted = registration.evicted.len(),
            "session registered"
        );

        Ok(SessionGrant {
            handle: registration.session.handle,
            limit: match limit {
                SessionLimit::Unlimited => None,
                SessionLimit::Max(max) => Some(max),
            },
            evicted: registration
                .evicted
                .into_iter()
                .map(|record| record.handle)
                .collect(),
        })
    }
}

use std::collections::HashMap;

use crate::config::SessionConfig;

/// Configured value meaning "no limit".
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLimit {
    Unlimited,
    Max(usize),
}

impl SessionLimit {
    pub fn from_config(value: i64) -> Self {
        if value == UNLIMITED || value < 0 {
            SessionLimit::Unlimited
        } else {
            SessionLimit::Max(value as usize)
        }
    }

    fn looser(self, other: SessionLimit) -> SessionLimit {
        match (self, other) {
            (SessionLimit::Unlimited, _) | (_, SessionLimit::Unlimited) => SessionLimit::Unlimited,
            (SessionLimit::Max(a), SessionLimit::Max(b)) => SessionLimit::Max(a.max(b)),
        }
    }
}

/// Layered limit lookup: tenant override, then role default, then the
/// global default. The first layer that has a value wins.
#[derive(Debug, Clone)]
pub struct SessionLimitPolicy {
    tenant_limits: HashMap<String, SessionLimit>,
    role_limits: HashMap<String, SessionLimit>,
    default_limit: SessionLimit,
}

impl SessionLimitPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        let convert = |limits: &HashMap<String, i64>| -> HashMap<String, SessionLimit> {
            limits
                .iter()
                .map(|(key, value)| (key.clone(), SessionLimit::from_config(*value)))
                .collect()
        };
        Self {
            tenant_limits: convert(&config.tenant_limits),
            role_limits: convert(&config.role_limits),
            default_limit: SessionLimit::from_config(config.default_limit),
        }
    }

    pub fn resolve<S: AsRef<str>>(&self, tenant_id: &str, roles: &[S]) -> SessionLimit {
        if let Some(limit) = self.tenant_limits.get(tenant_id) {
            return *limit;
        }
        // A principal holding several limited roles gets the most generous one.
        let by_role = roles
            .iter()
            .filter_map(|role| self.role_limits.get(role.as_ref()).copied())
            .reduce(SessionLimit::looser);
        by_role.unwrap_or(self.default_limit)
    }
}

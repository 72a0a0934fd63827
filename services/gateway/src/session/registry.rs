use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::SharedClock;

use super::error::SessionError;
use super::policy::SessionLimit;

/// Sessions are accounted per identity *and* tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PrincipalKey {
    pub identity: String,
    pub tenant_id: String,
}

impl PrincipalKey {
    pub fn new(identity: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub handle: String,
    pub principal: PrincipalKey,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
}

/// Outcome of registering a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub session: SessionRecord,
    pub evicted: Vec<SessionRecord>,
}

/// Live sessions grouped by principal.
///
/// Counting, evicting and inserting for one principal all happen while that
/// principal's map entry is locked, so two concurrent logins cannot both see
/// room for themselves.
pub struct SessionRegistry {
    sessions: DashMap<PrincipalKey, Vec<SessionRecord>>,
    handles: DashMap<String, PrincipalKey>,
    clock: SharedClock,
}

impl SessionRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            sessions: DashMap::new(),
            handles: DashMap::new(),
            clock,
        }
    }

    /// Adds a session for `principal`, evicting the least recently active
    /// sessions until the new one fits within `limit`. With
    /// `reject_when_full` the login is refused instead.
    pub fn register(
        &self,
        principal: PrincipalKey,
        limit: SessionLimit,
        reject_when_full: bool,
    ) -> Result<Registration, SessionError> {
        let now = self.clock.now_millis();
        let session = SessionRecord {
            handle: Uuid::new_v4().to_string(),
            principal: principal.clone(),
            created_at_ms: now,
            last_activity_ms: now,
        };

        let evicted = {
            let mut entry = self.sessions.entry(principal.clone()).or_default();
            let existing = entry.value_mut();
            let mut evicted = Vec::new();

            if let SessionLimit::Max(max) = limit {
                let max = max.max(1);
                if existing.len() >= max {
                    if reject_when_full {
                        return Err(SessionError::MaximumExceeded {
                            identity: principal.identity,
                            limit: max,
                        });
                    }
                    existing.sort_by_key(|record| (record.last_activity_ms, record.created_at_ms));
                    let overflow = existing.len() + 1 - max;
                    evicted.extend(existing.drain(..overflow));
                }
            }

            // Handle bookkeeping stays under the entry lock so an eviction
            // cannot overtake the insert of the handle it removes.
            for record in &evicted {
                self.handles.remove(&record.handle);
            }
            self.handles
                .insert(session.handle.clone(), principal.clone());
            existing.push(session.clone());
            evicted
        };

        for record in &evicted {
            info!(
                identity = %principal.identity,
                tenant_id = %principal.tenant_id,
                handle = %record.handle,
                "evicted least recently active session"
            );
        }

        Ok(Registration { session, evicted })
    }

    /// Records activity on a session.
    pub fn touch(&self, handle: &str) -> Result<SessionRecord, SessionError> {
        let principal = self.principal_of(handle)?;
        let now = self.clock.now_millis();
        let mut entry = self
            .sessions
            .get_mut(&principal)
            .ok_or_else(|| SessionError::UnknownSession(handle.to_string()))?;
        let record = entry
            .iter_mut()
            .find(|record| record.handle == handle)
            .ok_or_else(|| SessionError::UnknownSession(handle.to_string()))?;
        record.last_activity_ms = now.max(record.last_activity_ms);
        Ok(record.clone())
    }

    /// Ends a session (logout).
    pub fn remove(&self, handle: &str) -> Result<SessionRecord, SessionError> {
        let (_, principal) = self
            .handles
            .remove(handle)
            .ok_or_else(|| SessionError::UnknownSession(handle.to_string()))?;

        let mut removed = None;
        self.sessions.remove_if_mut(&principal, |_, records| {
            if let Some(position) = records.iter().position(|record| record.handle == handle) {
                removed = Some(records.remove(position));
            }
            records.is_empty()
        });
        removed.ok_or_else(|| SessionError::UnknownSession(handle.to_string()))
    }

    pub fn get(&self, handle: &str) -> Option<SessionRecord> {
        let principal = self.principal_of(handle).ok()?;
        let records = self.sessions.get(&principal)?;
        records.iter().find(|record| record.handle == handle).cloned()
    }

    /// Sessions of one principal, oldest activity first.
    pub fn sessions_for(&self, principal: &PrincipalKey) -> Vec<SessionRecord> {
        let mut records = self
            .sessions
            .get(principal)
            .map(|records| records.clone())
            .unwrap_or_default();
        records.sort_by_key(|record| record.last_activity_ms);
        records
    }

    /// Session counts per principal.
    pub fn summary(&self) -> HashMap<PrincipalKey, usize> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.handles.len()
    }

    /// Removes sessions idle for longer than `max_idle`.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(max_idle.as_millis() as u64);
        let mut expired = Vec::new();

        self.sessions.retain(|_, records| {
            records.retain(|record| {
                let keep = record.last_activity_ms >= cutoff;
                if !keep {
                    expired.push(record.handle.clone());
                }
                keep
            });
            !records.is_empty()
        });

        for handle in &expired {
            self.handles.remove(handle);
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "expired idle sessions");
        }
        expired.len()
    }

    pub fn start_expiry_task(self: &Arc<Self>, max_idle: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = (max_idle / 4).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.expire_idle(max_idle);
            }
        })
    }

    fn principal_of(&self, handle: &str) -> Result<PrincipalKey, SessionError> {
        self.handles
            .get(handle)
            .map(|principal| principal.clone())
            .ok_or_else(|| SessionError::UnknownSession(handle.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> (Arc<ManualClock>, SessionRegistry) {
        let clock = Arc::new(ManualClock::new(1_000));
        (clock.clone(), SessionRegistry::new(clock))
    }

    #[test]
    fn third_login_evicts_single_oldest() {
        let (clock, registry) = registry();
        let alice = PrincipalKey::new("alice", "shop");
        let limit = SessionLimit::Max(2);

        let first = registry.register(alice.clone(), limit, false).unwrap().session;
        clock.advance(Duration::from_secs(1));
        let second = registry.register(alice.clone(), limit, false).unwrap().session;
        clock.advance(Duration::from_secs(1));
        let third = registry.register(alice.clone(), limit, false).unwrap();

        assert_eq!(third.evicted, vec![first.clone()]);
        let remaining: Vec<_> = registry
            .sessions_for(&alice)
            .into_iter()
            .map(|record| record.handle)
            .collect();
        assert_eq!(remaining, vec![second.handle, third.session.handle]);
        assert!(registry.get(&first.handle).is_none());
    }

    #[test]
    fn eviction_follows_activity_not_creation() {
        let (clock, registry) = registry();
        let alice = PrincipalKey::new("alice", "shop");
        let limit = SessionLimit::Max(2);

        let first = registry.register(alice.clone(), limit, false).unwrap().session;
        clock.advance(Duration::from_secs(1));
        let second = registry.register(alice.clone(), limit, false).unwrap().session;
        clock.advance(Duration::from_secs(1));
        registry.touch(&first.handle).unwrap();
        clock.advance(Duration::from_secs(1));

        let third = registry.register(alice, limit, false).unwrap();
        assert_eq!(third.evicted.len(), 1);
        assert_eq!(third.evicted[0].handle, second.handle);
    }

    #[test]
    fn tenants_have_separate_pools() {
        let (_, registry) = registry();
        let limit = SessionLimit::Max(1);

        registry.register(PrincipalKey::new("alice", "a"), limit, false).unwrap();
        let other = registry
            .register(PrincipalKey::new("alice", "b"), limit, false)
            .unwrap();
        assert!(other.evicted.is_empty());
        assert_eq!(registry.session_count(), 2);
    }

    #[test]
    fn unlimited_never_evicts() {
        let (_, registry) = registry();
        let alice = PrincipalKey::new("alice", "shop");
        for _ in 0..10 {
            let registration = registry
                .register(alice.clone(), SessionLimit::Unlimited, false)
                .unwrap();
            assert!(registration.evicted.is_empty());
        }
        assert_eq!(registry.sessions_for(&alice).len(), 10);
    }

    #[test]
    fn reject_mode_refuses_new_login() {
        let (_, registry) = registry();
        let alice = PrincipalKey::new("alice", "shop");
        registry.register(alice.clone(), SessionLimit::Max(1), true).unwrap();

        assert_eq!(
            registry.register(alice.clone(), SessionLimit::Max(1), true),
            Err(SessionError::MaximumExceeded {
                identity: "alice".into(),
                limit: 1
            })
        );
        assert_eq!(registry.sessions_for(&alice).len(), 1);
    }

    #[test]
    fn remove_and_expire() {
        let (clock, registry) = registry();
        let alice = PrincipalKey::new("alice", "shop");
        let first = registry
            .register(alice.clone(), SessionLimit::Unlimited, false)
            .unwrap()
            .session;
        registry.remove(&first.handle).unwrap();
        assert!(registry.remove(&first.handle).is_err());
        assert_eq!(registry.session_count(), 0);

        registry.register(alice.clone(), SessionLimit::Unlimited, false).unwrap();
        clock.advance(Duration::from_secs(10));
        let fresh = registry
            .register(alice.clone(), SessionLimit::Unlimited, false)
            .unwrap()
            .session;

        assert_eq!(registry.expire_idle(Duration::from_secs(5)), 1);
        assert_eq!(registry.sessions_for(&alice), vec![fresh]);
    }

    #[test]
    fn concurrent_logins_respect_limit() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);
        let alice = PrincipalKey::new("alice", "shop");

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let alice = alice.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry.register(alice.clone(), SessionLimit::Max(3), false).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(registry.sessions_for(&alice).len(), 3);
        assert_eq!(registry.session_count(), 3);
    }
}

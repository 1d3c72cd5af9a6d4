//! Authoritative permission store interface
//!
//! The engine never owns permission data; it caches answers from a
//! `BackingStore`. `InMemoryBackingStore` keeps grants and role assignments
//! in memory and can be scripted to fail or stall, which is how the retry
//! and degradation paths are exercised.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use crate::error::{AuthzError, Result};
use crate::types::{PermissionCheck, PermissionResult, RoleRecord, Scope, ScopeType};

/// Backing store entry points consumed by the engine
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Decide a whole check-set in one round-trip, one result per check, in order
    async fn batch_validate_permissions(
        &self,
        subject_id: &str,
        checks: &[PermissionCheck],
        scope: Option<&Scope>,
    ) -> Result<Vec<PermissionResult>>;

    /// Every `resource:action` the subject holds
    async fn fetch_permissions(&self, subject_id: &str, scope: Option<&Scope>) -> Result<Vec<String>>;

    /// Roles held in one scope type; `scope_id = None` means every instance
    async fn fetch_roles(
        &self,
        subject_id: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
    ) -> Result<Vec<RoleRecord>>;

    async fn assign_role(
        &self,
        subject_id: &str,
        role_id: &str,
        scope_id: Option<&str>,
        scope_type: Option<ScopeType>,
    ) -> Result<()>;

    async fn revoke_role(
        &self,
        subject_id: &str,
        role_id: &str,
        scope_id: Option<&str>,
        scope_type: Option<ScopeType>,
    ) -> Result<()>;
}

/// Store operations, for scripting failures and counting calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    BatchValidate,
    FetchPermissions,
    FetchRoles,
    AssignRole,
    RevokeRole,
}

const GLOBAL: &str = "global";

fn scope_slot(scope: Option<&Scope>) -> String {
    scope.map(Scope::key_segment).unwrap_or_else(|| GLOBAL.to_string())
}

/// In-memory backing store
#[derive(Default)]
pub struct InMemoryBackingStore {
    /// (subject, scope slot) -> granted `resource:action` pairs
    grants: DashMap<(String, String), BTreeSet<String>>,
    /// subject -> role assignments
    roles: DashMap<String, Vec<RoleRecord>>,
    failures: Mutex<HashMap<StoreOp, VecDeque<AuthzError>>>,
    persistent_failures: Mutex<HashMap<StoreOp, AuthzError>>,
    delays: Mutex<HashMap<StoreOp, Duration>>,
    calls: DashMap<StoreOp, usize>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `resource:action`, globally or within a scope
    pub fn grant(&self, subject_id: &str, resource: &str, action: &str, scope: Option<&Scope>) {
        self.grants
            .entry((subject_id.to_string(), scope_slot(scope)))
            .or_default()
            .insert(format!("{}:{}", resource, action));
    }

    pub fn revoke(&self, subject_id: &str, resource: &str, action: &str, scope: Option<&Scope>) {
        if let Some(mut set) = self.grants.get_mut(&(subject_id.to_string(), scope_slot(scope))) {
            set.remove(&format!("{}:{}", resource, action));
        }
    }

    /// Seed a role assignment directly
    pub fn add_role(&self, subject_id: &str, record: RoleRecord) {
        self.roles.entry(subject_id.to_string()).or_default().push(record);
    }

    /// Fail the next `count` calls of `op`
    pub fn fail_next(&self, op: StoreOp, count: usize, error: AuthzError) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Fail every call of `op` until `heal` is called
    pub fn fail_always(&self, op: StoreOp, error: AuthzError) {
        self.persistent_failures.lock().insert(op, error);
    }

    pub fn heal(&self, op: StoreOp) {
        self.persistent_failures.lock().remove(&op);
        self.failures.lock().remove(&op);
    }

    /// Stall every call of `op`
    pub fn set_delay(&self, op: StoreOp, delay: Duration) {
        self.delays.lock().insert(op, delay);
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Current role ids of a subject, for assertions
    pub fn role_ids(&self, subject_id: &str) -> Vec<String> {
        self.roles
            .get(subject_id)
            .map(|records| records.iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }

    async fn enter(&self, op: StoreOp) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;

        let delay = self.delays.lock().get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.persistent_failures.lock().get(&op) {
            return Err(err.clone());
        }

        let scripted = self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => {
                debug!("Scripted {:?} failure: {}", op, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn is_granted(&self, subject_id: &str, check: &PermissionCheck, scope: Option<&Scope>) -> bool {
        let candidates = [
            format!("{}:{}", check.resource, check.action),
            format!("{}:*", check.resource),
            "*:*".to_string(),
        ];

        let mut slots = vec![GLOBAL.to_string()];
        if scope.is_some() {
            slots.push(scope_slot(scope));
        }

        slots.iter().any(|slot| {
            self.grants
                .get(&(subject_id.to_string(), slot.clone()))
                .map(|set| candidates.iter().any(|c| set.contains(c)))
                .unwrap_or(false)
        })
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn batch_validate_permissions(
        &self,
        subject_id: &str,
        checks: &[PermissionCheck],
        scope: Option<&Scope>,
    ) -> Result<Vec<PermissionResult>> {
        self.enter(StoreOp::BatchValidate).await?;

        Ok(checks
            .iter()
            .map(|check| {
                if self.is_granted(subject_id, check, scope) {
                    PermissionResult::allow(check)
                } else {
                    PermissionResult::deny(check, "not granted")
                }
            })
            .collect())
    }

    async fn fetch_permissions(&self, subject_id: &str, scope: Option<&Scope>) -> Result<Vec<String>> {
        self.enter(StoreOp::FetchPermissions).await?;

        let mut permissions = BTreeSet::new();
        let mut slots = vec![GLOBAL.to_string()];
        if scope.is_some() {
            slots.push(scope_slot(scope));
        }

        for slot in slots {
            if let Some(set) = self.grants.get(&(subject_id.to_string(), slot)) {
                permissions.extend(set.iter().cloned());
            }
        }

        Ok(permissions.into_iter().collect())
    }

    async fn fetch_roles(
        &self,
        subject_id: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
    ) -> Result<Vec<RoleRecord>> {
        self.enter(StoreOp::FetchRoles).await?;

        Ok(self
            .roles
            .get(subject_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.scope_type == scope_type)
                    .filter(|r| scope_id.is_none() || r.scope_id.as_deref() == scope_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn assign_role(
        &self,
        subject_id: &str,
        role_id: &str,
        scope_id: Option<&str>,
        scope_type: Option<ScopeType>,
    ) -> Result<()> {
        self.enter(StoreOp::AssignRole).await?;

        let record = RoleRecord::new(
            role_id,
            scope_type.unwrap_or(ScopeType::System),
            scope_id.map(str::to_string),
        );

        let mut records = self.roles.entry(subject_id.to_string()).or_default();
        if !records.contains(&record) {
            records.push(record);
        }
        Ok(())
    }

    async fn revoke_role(
        &self,
        subject_id: &str,
        role_id: &str,
        scope_id: Option<&str>,
        scope_type: Option<ScopeType>,
    ) -> Result<()> {
        self.enter(StoreOp::RevokeRole).await?;

        let scope_type = scope_type.unwrap_or(ScopeType::System);
        if let Some(mut records) = self.roles.get_mut(subject_id) {
            records.retain(|r| !(r.id == role_id && r.scope_type == scope_type && r.scope_id.as_deref() == scope_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_validate_respects_scope() {
        let store = InMemoryBackingStore::new();
        let acme = Scope::organization("acme");
        store.grant("u1", "doc", "read", None);
        store.grant("u1", "doc", "write", Some(&acme));

        let checks = vec![PermissionCheck::new("doc", "read"), PermissionCheck::new("doc", "write")];

        let global = store.batch_validate_permissions("u1", &checks, None).await.unwrap();
        assert!(global[0].allowed);
        assert!(!global[1].allowed);

        let scoped = store.batch_validate_permissions("u1", &checks, Some(&acme)).await.unwrap();
        assert!(scoped.iter().all(|r| r.allowed));
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed() {
        let store = InMemoryBackingStore::new();
        store.fail_next(StoreOp::AssignRole, 1, AuthzError::transient_store("blip"));

        assert!(store.assign_role("u1", "r1", None, None).await.is_err());
        assert!(store.assign_role("u1", "r1", None, None).await.is_ok());
        assert_eq!(store.call_count(StoreOp::AssignRole), 2);
        assert_eq!(store.role_ids("u1"), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_roles_filters_by_scope() {
        let store = InMemoryBackingStore::new();
        store.add_role("u1", RoleRecord::new("admin", ScopeType::Organization, Some("acme".into())));
        store.add_role("u1", RoleRecord::new("viewer", ScopeType::Organization, Some("globex".into())));
        store.add_role("u1", RoleRecord::new("dev", ScopeType::Project, Some("p1".into())));

        let acme = store.fetch_roles("u1", ScopeType::Organization, Some("acme")).await.unwrap();
        assert_eq!(acme.len(), 1);

        let all_orgs = store.fetch_roles("u1", ScopeType::Organization, None).await.unwrap();
        assert_eq!(all_orgs.len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_role() {
        let store = InMemoryBackingStore::new();
        store.assign_role("u1", "r1", Some("p1"), Some(ScopeType::Project)).await.unwrap();
        store.revoke_role("u1", "r1", Some("p1"), Some(ScopeType::Project)).await.unwrap();
        assert!(store.role_ids("u1").is_empty());
    }
}

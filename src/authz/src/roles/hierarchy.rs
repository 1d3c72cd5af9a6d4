//! Role hierarchy cache over the three scope optimizers

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::optimizer::ScopeRoleOptimizer;
use crate::cache::key::{self, Invalidation};
use crate::cache::CacheCoordinator;
use crate::config::RoleSection;
use crate::retry::{retry_transient, with_timeout, BackoffPolicy};
use crate::store::BackingStore;
use crate::types::{RoleHierarchy, Scope, ScopeType};

/// Assembled role hierarchies, cached above the optimizer-level role lists
///
/// Invalidation always clears both layers so they never disagree, and a
/// fill racing an invalidation is dropped rather than resurrecting old roles.
pub struct RoleHierarchyCache {
    organization: ScopeRoleOptimizer,
    project: ScopeRoleOptimizer,
    system: ScopeRoleOptimizer,
    cache: Arc<CacheCoordinator>,
    store: Arc<dyn BackingStore>,
    ttl: Duration,
    backoff: BackoffPolicy,
    backing_timeout: Duration,
}

impl RoleHierarchyCache {
    pub fn new(config: &RoleSection, cache: Arc<CacheCoordinator>, store: Arc<dyn BackingStore>) -> Self {
        let optimizer = |scope_type| ScopeRoleOptimizer::new(scope_type, config, cache.clone(), store.clone());

        Self {
            organization: optimizer(ScopeType::Organization),
            project: optimizer(ScopeType::Project),
            system: optimizer(ScopeType::System),
            ttl: config.hierarchy_ttl(),
            backoff: BackoffPolicy::new(config.backoff_base(), config.max_extra_attempts),
            backing_timeout: config.backing_timeout(),
            cache,
            store,
        }
    }

    pub fn optimizer(&self, scope_type: ScopeType) -> &ScopeRoleOptimizer {
        match scope_type {
            ScopeType::Organization => &self.organization,
            ScopeType::Project => &self.project,
            ScopeType::System => &self.system,
        }
    }

    /// Cached hierarchy if unexpired, else rebuilt from the matching optimizer
    ///
    /// When the store cannot answer, the result has no roles and is not cached.
    pub async fn get_hierarchy(&self, subject_id: &str, scope: ScopeType, scope_id: Option<&str>) -> RoleHierarchy {
        let cache_key = key::hierarchy_key(subject_id, scope, scope_id);

        if let Some(hierarchy) = self.cache.get::<RoleHierarchy>(&cache_key).await {
            if !hierarchy.is_expired() {
                return hierarchy;
            }
            debug!("Hierarchy {} expired; rebuilding", cache_key);
        }

        let since = self.cache.generation();
        let now = Utc::now();
        let mut hierarchy = RoleHierarchy {
            subject_id: subject_id.to_string(),
            scope,
            scope_id: scope_id.map(str::to_string),
            roles: Vec::new(),
            permissions: None,
            cached_at: now,
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };

        match self.optimizer(scope).try_fetch(subject_id, scope_id).await {
            Ok(records) => {
                for record in records {
                    if !hierarchy.has_role(&record.id) {
                        hierarchy.roles.push(record.id);
                    }
                }
                self.cache
                    .set_if_current(&cache_key, &hierarchy, Some(self.ttl), since)
                    .await;
            }
            Err(_) => debug!("Serving empty hierarchy for {} uncached", cache_key),
        }

        hierarchy
    }

    /// Permissions granted in the hierarchy's scope, fetched on first use
    pub async fn permissions_for(&self, subject_id: &str, scope: ScopeType, scope_id: Option<&str>) -> Vec<String> {
        let since = self.cache.generation();
        let mut hierarchy = self.get_hierarchy(subject_id, scope, scope_id).await;
        if let Some(permissions) = hierarchy.permissions {
            return permissions;
        }

        let store_scope = Scope {
            scope_type: scope,
            id: scope_id.map(str::to_string),
        };

        let fetched = retry_transient(&self.backoff, "fetch_permissions", || {
            with_timeout(
                self.backing_timeout,
                "fetch_permissions",
                self.store.fetch_permissions(subject_id, Some(&store_scope)),
            )
        })
        .await;

        match fetched {
            Ok(permissions) => {
                let remaining = (hierarchy.expires_at - Utc::now()).to_std().unwrap_or_default();
                hierarchy.permissions = Some(permissions.clone());
                if !remaining.is_zero() {
                    let cache_key = key::hierarchy_key(subject_id, scope, scope_id);
                    self.cache
                        .set_if_current(&cache_key, &hierarchy, Some(remaining), since)
                        .await;
                }
                permissions
            }
            Err(e) => {
                warn!("Permission lookup for {} in {} failed: {}", subject_id, scope, e);
                Vec::new()
            }
        }
    }

    /// Clear one scope instance, one scope type, or everything for a subject
    pub async fn invalidate_hierarchy(
        &self,
        subject_id: &str,
        scope: Option<ScopeType>,
        scope_id: Option<&str>,
    ) -> usize {
        match (scope, scope_id) {
            (Some(scope), Some(scope_id)) => {
                let mut removed = 0;
                for hierarchy_key in [
                    key::hierarchy_key(subject_id, scope, Some(scope_id)),
                    key::hierarchy_key(subject_id, scope, None),
                ] {
                    removed += self.cache.invalidate(&Invalidation::Exact(hierarchy_key)).await;
                }
                removed + self.optimizer(scope).invalidate(subject_id, Some(scope_id)).await
            }
            (Some(scope), None) => {
                self.cache
                    .invalidate(&Invalidation::Prefix(key::hierarchy_type_prefix(subject_id, scope)))
                    .await
                    + self.optimizer(scope).invalidate_all(subject_id).await
            }
            (None, _) => {
                self.cache
                    .invalidate(&Invalidation::Prefix(key::hierarchy_subject_prefix(subject_id)))
                    .await
                    + self
                        .cache
                        .invalidate(&Invalidation::Prefix(key::role_subject_prefix(subject_id)))
                        .await
            }
        }
    }

    /// Load hierarchies for several scopes concurrently
    pub async fn warm(&self, subject_id: &str, scopes: &[Scope]) -> Vec<RoleHierarchy> {
        join_all(
            scopes
                .iter()
                .map(|scope| self.get_hierarchy(subject_id, scope.scope_type, scope.id.as_deref())),
        )
        .await
    }
}

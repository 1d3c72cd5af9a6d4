//! Per-scope-type role fetcher with caching

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::key::{self, Invalidation};
use crate::cache::CacheCoordinator;
use crate::config::RoleSection;
use crate::error::Result;
use crate::retry::{retry_transient, with_timeout, BackoffPolicy};
use crate::store::BackingStore;
use crate::types::{RoleRecord, ScopeType};

/// Fetches and caches the roles a subject holds in one scope type
///
/// Keys are `role:<subject>:<type>:<id>` for one scope instance and
/// `role:<subject>:<type>:all` for every instance of the type.
pub struct ScopeRoleOptimizer {
    scope_type: ScopeType,
    ttl: Duration,
    backoff: BackoffPolicy,
    backing_timeout: Duration,
    cache: Arc<CacheCoordinator>,
    store: Arc<dyn BackingStore>,
}

impl ScopeRoleOptimizer {
    pub fn new(
        scope_type: ScopeType,
        config: &RoleSection,
        cache: Arc<CacheCoordinator>,
        store: Arc<dyn BackingStore>,
    ) -> Self {
        let ttl_secs = match scope_type {
            ScopeType::Organization => config.organization_ttl_secs,
            ScopeType::Project => config.project_ttl_secs,
            ScopeType::System => config.system_ttl_secs,
        };

        Self {
            scope_type,
            ttl: Duration::from_secs(ttl_secs),
            backoff: BackoffPolicy::new(config.backoff_base(), config.max_extra_attempts),
            backing_timeout: config.backing_timeout(),
            cache,
            store,
        }
    }

    pub fn scope_type(&self) -> ScopeType {
        self.scope_type
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Roles for `(subject, scope_id)`; an empty list when the store cannot answer
    pub async fn fetch(&self, subject_id: &str, scope_id: Option<&str>) -> Vec<RoleRecord> {
        self.try_fetch(subject_id, scope_id).await.unwrap_or_default()
    }

    /// Like `fetch`, but reports store failures so callers can avoid caching them
    pub(crate) async fn try_fetch(&self, subject_id: &str, scope_id: Option<&str>) -> Result<Vec<RoleRecord>> {
        let cache_key = key::role_key(subject_id, self.scope_type, scope_id);

        if let Some(records) = self.cache.get::<Vec<RoleRecord>>(&cache_key).await {
            debug!("Role cache hit for {}", cache_key);
            return Ok(records);
        }

        let since = self.cache.generation();
        let fetched = retry_transient(&self.backoff, "fetch_roles", || {
            with_timeout(
                self.backing_timeout,
                "fetch_roles",
                self.store.fetch_roles(subject_id, self.scope_type, scope_id),
            )
        })
        .await;

        match fetched {
            Ok(records) => {
                let records = self.accept(records, scope_id);
                self.cache.set_if_current(&cache_key, &records, Some(self.ttl), since).await;
                Ok(records)
            }
            Err(e) => {
                warn!(
                    "Role lookup for {} in {} failed: {}; treating as no roles",
                    subject_id, self.scope_type, e
                );
                Err(e)
            }
        }
    }

    /// Clear the specific-scope key and the subject's aggregate key for this type
    pub async fn invalidate(&self, subject_id: &str, scope_id: Option<&str>) -> usize {
        let mut removed = 0;
        if scope_id.is_some() {
            removed += self
                .cache
                .invalidate(&Invalidation::Exact(key::role_key(subject_id, self.scope_type, scope_id)))
                .await;
        }
        removed
            + self
                .cache
                .invalidate(&Invalidation::Exact(key::role_key(subject_id, self.scope_type, None)))
                .await
    }

    /// Clear every instance of this scope type for a subject
    pub async fn invalidate_all(&self, subject_id: &str) -> usize {
        self.cache
            .invalidate(&Invalidation::Prefix(key::role_type_prefix(subject_id, self.scope_type)))
            .await
    }

    /// Drop rows that do not belong to the requested scope
    fn accept(&self, records: Vec<RoleRecord>, scope_id: Option<&str>) -> Vec<RoleRecord> {
        let total = records.len();
        let accepted: Vec<RoleRecord> = records
            .into_iter()
            .filter(|r| !r.id.is_empty())
            .filter(|r| r.scope_type == self.scope_type)
            .filter(|r| scope_id.is_none() || r.scope_id.as_deref() == scope_id)
            .collect();

        if accepted.len() != total {
            warn!(
                "Dropped {} malformed role rows for {} scope",
                total - accepted.len(),
                self.scope_type
            );
        }
        accepted
    }
}

//! Explicitly constructed engine instance
//!
//! ```text
//!               ┌──────────────────────┐
//!               │  CacheCoordinator    │◀── DegradationPolicy
//!               │  local ─▶ remote     │
//!               └──────────────────────┘
//!                  ▲        ▲        ▲
//!   PermissionService  BatchProcessor  RoleHierarchyCache
//!          │               │                 │
//!          └──────── BackingStore ◀──────────┘
//! ```
//!
//! All state lives in the instance; tests build fresh engines instead of
//! resetting shared globals.

use std::sync::Arc;
use tracing::info;

use crate::batch::BatchAuthorizationProcessor;
use crate::cache::{CacheCoordinator, DegradationPolicy, RemoteTier};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::feed::ChangeFeed;
use crate::permissions::PermissionService;
use crate::roles::RoleHierarchyCache;
use crate::store::BackingStore;
use crate::types::BatchResult;

pub struct AuthzEngine {
    cache: Arc<CacheCoordinator>,
    permissions: Arc<PermissionService>,
    batch: Arc<BatchAuthorizationProcessor>,
    roles: Arc<RoleHierarchyCache>,
    config: EngineConfig,
}

impl AuthzEngine {
    /// Wire every component from one configuration
    ///
    /// `remote` is optional; without it the engine runs on the local tier alone.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn BackingStore>,
        remote: Option<Arc<dyn RemoteTier>>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Self> {
        config.validate()?;

        let policy = Arc::new(DegradationPolicy::new(config.degradation.clone()));
        let cache = Arc::new(match remote {
            Some(remote) => CacheCoordinator::with_remote(config.cache.clone(), policy, remote),
            None => CacheCoordinator::new(config.cache.clone(), policy),
        });

        let permissions = PermissionService::new(config.permissions.clone(), cache.clone(), store.clone(), feed);
        let batch = BatchAuthorizationProcessor::new(config.batch.clone(), store.clone(), cache.clone());
        let roles = Arc::new(RoleHierarchyCache::new(&config.roles, cache.clone(), store));

        info!(
            "Authorization engine initialized: remote tier {}, batch size {}, flush timeout {:?}",
            if cache.has_remote() { "enabled" } else { "absent" },
            config.batch.batch_size,
            config.batch.flush_timeout()
        );

        Ok(Self {
            cache,
            permissions,
            batch,
            roles,
            config,
        })
    }

    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    pub fn permissions(&self) -> &Arc<PermissionService> {
        &self.permissions
    }

    pub fn batch(&self) -> &Arc<BatchAuthorizationProcessor> {
        &self.batch
    }

    pub fn roles(&self) -> &Arc<RoleHierarchyCache> {
        &self.roles
    }

    pub fn degradation(&self) -> &Arc<DegradationPolicy> {
        self.cache.degradation()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flush pending writes and close change feeds
    pub async fn shutdown(&self) -> BatchResult {
        let result = self.batch.shutdown().await;
        self.permissions.close_all();
        info!("Authorization engine shut down");
        result
    }
}

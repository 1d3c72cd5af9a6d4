//! # PermGuard Authorization Cache
//!
//! Caching and batch-processing engine that sits between application code
//! and an authoritative permission store.
//!
//! ## Features
//!
//! - **Two-tier cache** (in-process + shared remote) with TTLs and eviction
//! - **Circuit breaker** that bypasses a failing remote tier and recovers on its own
//! - **Batched role writes** with deduplication, retries and outcome caching
//! - **Checksum-keyed batch validation** that degrades to "denied", never to an error
//! - **Scope-aware role hierarchies** (organization, project, system)
//! - **Change subscriptions** that invalidate before notifying
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use permguard_authz::{AuthzEngine, EngineConfig, InMemoryBackingStore, InMemoryChangeFeed, PermissionCheck};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryBackingStore::new());
//!     store.grant("alice", "document", "read", None);
//!
//!     let engine = AuthzEngine::new(
//!         EngineConfig::default(),
//!         store,
//!         None,
//!         Arc::new(InMemoryChangeFeed::new()),
//!     )?;
//!
//!     let checks = [PermissionCheck::new("document", "read")];
//!     let validation = engine.permissions().validate_batch("alice", &checks, None).await;
//!
//!     if validation.all_allowed() {
//!         println!("Access granted!");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod permissions;
pub mod retry;
pub mod roles;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use batch::{BatchAuthorizationProcessor, BatchMetrics};
pub use cache::{
    CacheCoordinator, CoordinatorStats, DegradationPolicy, Generation, InMemoryRemoteTier, Invalidation,
    RecoveryDirective, RemoteTier, SetOutcome, TierHint,
};
pub use config::EngineConfig;
pub use engine::AuthzEngine;
pub use error::{AuthzError, Result};
pub use feed::{ChangeFeed, InMemoryChangeFeed};
pub use permissions::{PermissionService, Subscription};
pub use roles::{RoleHierarchyCache, ScopeRoleOptimizer};
pub use store::{BackingStore, InMemoryBackingStore, StoreOp};
pub use types::{
    BatchAuthorizationRequest, BatchOperation, BatchResult, BatchValidation, ChangeEvent, PermissionChange,
    PermissionCheck, PermissionResult, RoleHierarchy, RoleRecord, Scope, ScopeType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

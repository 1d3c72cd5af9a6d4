//! Role lookups by scope
//!
//! One `ScopeRoleOptimizer` per scope type caches raw role lists with a
//! type-specific TTL (system roles live longest). `RoleHierarchyCache`
//! assembles them into `RoleHierarchy` values and owns invalidation of
//! both layers.

pub mod hierarchy;
pub mod optimizer;

pub use hierarchy::RoleHierarchyCache;
pub use optimizer::ScopeRoleOptimizer;

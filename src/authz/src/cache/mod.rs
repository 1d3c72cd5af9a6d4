//! Two-tier permission cache
//!
//! - `local`: in-process tier with TTLs and insertion-order eviction
//! - `remote`: trait for a shared out-of-process tier
//! - `degradation`: circuit breaker deciding when the remote tier is used
//! - `coordinator`: one get/set/invalidate contract over both
//! - `key`: key grammar and structured invalidation
//! - `generation`: invalidation history guarding read-through fills

pub mod coordinator;
pub mod degradation;
pub mod generation;
pub mod key;
pub mod local;
pub mod remote;
mod stats;

pub use coordinator::{CacheCoordinator, SetOutcome, TierHint};
pub use degradation::{DegradationPolicy, DegradationState, RecoveryDirective};
pub use generation::Generation;
pub use key::Invalidation;
pub use local::{CacheEntry, LocalTier};
pub use remote::{InMemoryRemoteTier, RemoteTier};
pub use stats::CoordinatorStats;

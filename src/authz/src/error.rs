//! Error types for the permission cache engine
//!
//! These errors are internal currency between components. The public
//! façades (`PermissionService`, `BatchAuthorizationProcessor`,
//! `RoleHierarchyCache`, `CacheCoordinator`) convert them into safe defaults
//! or result objects instead of returning them to callers.

use thiserror::Error;

/// Authorization engine errors
#[derive(Debug, Clone, Error)]
pub enum AuthzError {
    /// Remote tier hiccup expected to resolve on its own
    #[error("Transient cache tier error: {0}")]
    TransientTier(String),

    /// Remote tier failing repeatedly
    #[error("Persistent cache tier error: {0}")]
    PersistentTier(String),

    /// Cached payload could not be decoded
    #[error("Corrupted cache entry '{key}': {reason}")]
    Corruption { key: String, reason: String },

    /// Local tier over its size ceiling
    #[error("Local cache capacity exceeded: {0}")]
    Capacity(String),

    /// Value could not be encoded for caching
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The authoritative backing store call failed
    #[error("Backing store error: {message}")]
    BackingStore { message: String, transient: bool },

    /// A bounded call did not complete in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Change feed subscription failure
    #[error("Change feed error: {0}")]
    ChangeFeed(String),

    /// Invalidation pattern could not be compiled
    #[error("Invalid invalidation pattern: {0}")]
    InvalidPattern(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl AuthzError {
    /// Backing store failure that is worth retrying
    pub fn transient_store(message: impl Into<String>) -> Self {
        Self::BackingStore {
            message: message.into(),
            transient: true,
        }
    }

    /// Backing store failure that will not go away on retry
    pub fn store(message: impl Into<String>) -> Self {
        Self::BackingStore {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether a retry has a reasonable chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientTier(_) | Self::Timeout(_) => true,
            Self::BackingStore { transient, .. } => *transient,
            _ => false,
        }
    }
}

impl From<std::io::Error> for AuthzError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AuthzError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, AuthzError>;

//! Engine configuration loading and validation
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. Durations are stored as integer milliseconds or seconds
//! and exposed through `Duration` accessors.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AuthzError, Result};

/// Complete engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheSection,
    pub degradation: DegradationSection,
    pub batch: BatchSection,
    pub permissions: PermissionSection,
    pub roles: RoleSection,
}

/// Cache coordinator settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSection {
    /// Entry ceiling for the local tier
    pub max_local_entries: usize,
    /// Approximate byte ceiling for the local tier (keys + payloads)
    pub max_local_bytes: usize,
    /// Fraction of entries dropped when the ceiling is hit
    pub eviction_ratio: f64,
    /// TTL used when `set` is called without one
    pub default_ttl_secs: u64,
    /// Use the remote tier when one is supplied
    pub remote_enabled: bool,
    /// Bound on each remote tier call
    pub remote_timeout_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_local_entries: 10_000,
            max_local_bytes: 50 * 1024 * 1024,
            eviction_ratio: 0.10,
            default_ttl_secs: 300,
            remote_enabled: true,
            remote_timeout_ms: 1_000,
        }
    }
}

impl CacheSection {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

/// Remote tier circuit breaker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DegradationSection {
    /// Consecutive connection failures before the remote tier is disabled
    pub failure_threshold: u32,
    /// How long the remote tier stays disabled
    pub recovery_window_ms: u64,
    /// Delay suggested for a non-transient failure below the threshold
    pub short_delay_ms: u64,
}

impl Default for DegradationSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_window_ms: 60_000,
            short_delay_ms: 5_000,
        }
    }
}

impl DegradationSection {
    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }

    pub fn short_delay(&self) -> Duration {
        Duration::from_millis(self.short_delay_ms)
    }
}

/// Batch authorization processor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSection {
    /// Pending-set size that triggers an immediate flush
    pub batch_size: usize,
    /// Delay before a timer-driven flush
    pub flush_timeout_ms: u64,
    /// Backing store attempts per request
    pub max_retries: u32,
    /// Requests processed concurrently within a flush
    pub chunk_size: usize,
    /// Skip requests whose outcome is already cached
    pub enable_cache: bool,
    /// TTL of cached outcomes
    pub cache_ttl_secs: u64,
    /// Bound on each backing store attempt
    pub backing_timeout_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_timeout_ms: 100,
            max_retries: 2,
            chunk_size: 10,
            enable_cache: true,
            cache_ttl_secs: 300,
            backing_timeout_ms: 5_000,
        }
    }
}

impl BatchSection {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn backing_timeout(&self) -> Duration {
        Duration::from_millis(self.backing_timeout_ms)
    }
}

/// Permission service settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PermissionSection {
    /// TTL of cached validation results and preloads
    pub ttl_secs: u64,
    /// Bound on each backing store call
    pub backing_timeout_ms: u64,
    /// Buffer of each per-subject change feed channel
    pub feed_buffer: usize,
}

impl Default for PermissionSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            backing_timeout_ms: 5_000,
            feed_buffer: 64,
        }
    }
}

impl PermissionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn backing_timeout(&self) -> Duration {
        Duration::from_millis(self.backing_timeout_ms)
    }
}

/// Role hierarchy cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoleSection {
    pub organization_ttl_secs: u64,
    pub project_ttl_secs: u64,
    /// System roles change least often
    pub system_ttl_secs: u64,
    /// TTL of assembled `RoleHierarchy` entries
    pub hierarchy_ttl_secs: u64,
    /// First backoff delay; doubled for each further attempt
    pub backoff_base_ms: u64,
    /// Attempts after the first one for transient failures
    pub max_extra_attempts: u32,
    /// Bound on each backing store attempt
    pub backing_timeout_ms: u64,
}

impl Default for RoleSection {
    fn default() -> Self {
        Self {
            organization_ttl_secs: 300,
            project_ttl_secs: 600,
            system_ttl_secs: 3_600,
            hierarchy_ttl_secs: 300,
            backoff_base_ms: 100,
            max_extra_attempts: 2,
            backing_timeout_ms: 5_000,
        }
    }
}

impl RoleSection {
    pub fn hierarchy_ttl(&self) -> Duration {
        Duration::from_secs(self.hierarchy_ttl_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backing_timeout(&self) -> Duration {
        Duration::from_millis(self.backing_timeout_ms)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)
            .map_err(|e| AuthzError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_local_entries == 0 || self.cache.max_local_bytes == 0 {
            return Err(AuthzError::Config("Local cache ceilings must be non-zero".into()));
        }

        if !(self.cache.eviction_ratio > 0.0 && self.cache.eviction_ratio <= 1.0) {
            return Err(AuthzError::Config("Eviction ratio must be in (0, 1]".into()));
        }

        if self.degradation.failure_threshold == 0 {
            return Err(AuthzError::Config("Failure threshold must be at least 1".into()));
        }

        if self.batch.batch_size == 0 || self.batch.chunk_size == 0 {
            return Err(AuthzError::Config("Batch and chunk sizes must be non-zero".into()));
        }

        if self.batch.max_retries == 0 {
            return Err(AuthzError::Config("Batch processor needs at least one attempt".into()));
        }

        let roles = &self.roles;
        if roles.system_ttl_secs < roles.organization_ttl_secs || roles.system_ttl_secs < roles.project_ttl_secs {
            return Err(AuthzError::Config(
                "System role TTL must not be shorter than organization/project TTLs".into(),
            ));
        }

        Ok(())
    }
}

//! Remote tier degradation policy
//!
//! A small circuit breaker around the remote cache tier. Tier errors are
//! translated into a `RecoveryDirective`; nothing here ever fails.
//!
//! ```text
//!   enabled ──(failures >= threshold)──▶ disabled
//!      ▲                                     │
//!      └──(recovery window elapsed / success)┘
//! ```

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::DegradationSection;
use crate::error::AuthzError;

/// What the caller should do after a tier error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDirective {
    /// Try the same operation again
    Retry { delay: Duration },
    /// Carry on without the failing component for `delay`
    Degrade { delay: Duration },
    /// Skip the cache for this one operation and go to the backing store
    Bypass,
    /// Nothing sensible to do; surface the failure in a result object
    Fail,
}

/// Snapshot of the breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradationState {
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub is_disabled: bool,
    pub last_failure_time: Option<Instant>,
    pub recovery_window: Duration,
}

#[derive(Debug, Default)]
struct StateData {
    failure_count: u32,
    is_disabled: bool,
    last_failure_time: Option<Instant>,
}

/// Tracks remote tier failures and gates access to it
#[derive(Debug)]
pub struct DegradationPolicy {
    config: DegradationSection,
    state: RwLock<StateData>,
    trips: AtomicU64,
}

impl DegradationPolicy {
    pub fn new(config: DegradationSection) -> Self {
        Self {
            config,
            state: RwLock::new(StateData::default()),
            trips: AtomicU64::new(0),
        }
    }

    /// Translate any engine error into a directive
    pub fn handle(&self, error: &AuthzError) -> RecoveryDirective {
        match error {
            AuthzError::TransientTier(_) | AuthzError::Timeout(_) => self.on_connection_error(true),
            AuthzError::PersistentTier(_) => self.on_connection_error(false),
            AuthzError::Corruption { key, .. } => self.on_corruption(key),
            AuthzError::Capacity(_) => self.on_overflow(),
            AuthzError::Serialization(_) => self.on_serialization_error(),
            other => {
                debug!("No recovery path for error: {}", other);
                RecoveryDirective::Fail
            }
        }
    }

    /// Remote tier connection failure
    pub fn on_connection_error(&self, transient: bool) -> RecoveryDirective {
        let mut state = self.state.write();
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        if state.failure_count >= self.config.failure_threshold {
            if !state.is_disabled {
                state.is_disabled = true;
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Remote cache tier disabled after {} consecutive failures; retrying in {:?}",
                    state.failure_count,
                    self.config.recovery_window()
                );
            }
            return RecoveryDirective::Degrade {
                delay: self.config.recovery_window(),
            };
        }

        debug!(
            "Remote cache tier failure {}/{} (transient={})",
            state.failure_count, self.config.failure_threshold, transient
        );

        if transient {
            RecoveryDirective::Retry { delay: Duration::ZERO }
        } else {
            RecoveryDirective::Degrade {
                delay: self.config.short_delay(),
            }
        }
    }

    /// A cached payload for `key` could not be decoded
    pub fn on_corruption(&self, key: &str) -> RecoveryDirective {
        warn!("Corrupted cache entry {}; refetching from backing store", key);
        RecoveryDirective::Bypass
    }

    /// Local tier hit its ceiling; eviction is the remedy, the remote tier stays up
    pub fn on_overflow(&self) -> RecoveryDirective {
        debug!("Local cache tier over capacity; evicting");
        RecoveryDirective::Degrade { delay: Duration::ZERO }
    }

    /// A single value could not be encoded
    pub fn on_serialization_error(&self) -> RecoveryDirective {
        RecoveryDirective::Bypass
    }

    /// Gate consulted before every remote tier access
    ///
    /// Once the recovery window has elapsed the breaker closes again and the
    /// failure count starts over.
    pub fn should_retry_remote(&self) -> bool {
        {
            let state = self.state.read();
            if !state.is_disabled {
                return true;
            }
            let elapsed = state
                .last_failure_time
                .map(|t| t.elapsed() >= self.config.recovery_window())
                .unwrap_or(true);
            if !elapsed {
                return false;
            }
        }

        let mut state = self.state.write();
        if state.is_disabled {
            state.is_disabled = false;
            state.failure_count = 0;
            info!("Remote cache tier recovery window elapsed; re-enabling");
        }
        true
    }

    /// Called on any successful remote tier round-trip
    pub fn reset_failure_count(&self) {
        let mut state = self.state.write();
        if state.failure_count > 0 || state.is_disabled {
            debug!("Remote cache tier healthy again; clearing {} failures", state.failure_count);
        }
        state.failure_count = 0;
        state.is_disabled = false;
    }

    pub fn is_disabled(&self) -> bool {
        self.state.read().is_disabled
    }

    /// Number of times the breaker has opened
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> DegradationState {
        let state = self.state.read();
        DegradationState {
            failure_count: state.failure_count,
            failure_threshold: self.config.failure_threshold,
            is_disabled: state.is_disabled,
            last_failure_time: state.last_failure_time,
            recovery_window: self.config.recovery_window(),
        }
    }
}

impl Default for DegradationPolicy {
    fn default() -> Self {
        Self::new(DegradationSection::default())
    }
}

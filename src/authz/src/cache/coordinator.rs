//! Two-tier cache coordinator
//!
//! ```text
//! get:  local ──miss──▶ remote (if breaker closed) ──hit──▶ repopulate local
//! set:  encode ──▶ local (evict oldest ~10% on overflow) ──▶ remote, best effort
//! ```
//!
//! Every public method is infallible: tier problems are reported to the
//! `DegradationPolicy` and the caller sees a cold cache.
//!
//! Fills that follow a store round trip go through `set_if_current`, which
//! drops the write when an invalidation covering the key ran in between.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::degradation::{DegradationPolicy, RecoveryDirective};
use super::generation::{Generation, InvalidationLog};
use super::key::Invalidation;
use super::local::{LocalRead, LocalTier};
use super::remote::RemoteTier;
use super::stats::{CoordinatorStats, StatsRecorder};
use crate::config::CacheSection;
use crate::error::{AuthzError, Result};

/// Which tiers a lookup may consult
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TierHint {
    /// Local first, then remote
    #[default]
    Any,
    LocalOnly,
    /// Skip the local tier; a hit still repopulates it
    RemoteOnly,
}

/// What `set` managed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Written to both tiers
    Stored,
    /// Written locally; remote tier absent, disabled or failing
    StoredLocalOnly,
    /// Value could not be encoded; nothing written
    Skipped,
    /// An invalidation since the caller's generation covered the key
    Superseded,
}

/// Invalidations remembered for `set_if_current`
const INVALIDATION_HISTORY: usize = 1024;

/// Unified get/set/invalidate over the local and remote tiers
pub struct CacheCoordinator {
    local: LocalTier,
    remote: Option<Arc<dyn RemoteTier>>,
    policy: Arc<DegradationPolicy>,
    stats: StatsRecorder,
    invalidations: Mutex<InvalidationLog>,
    config: CacheSection,
}

impl CacheCoordinator {
    /// Coordinator with only the local tier
    pub fn new(config: CacheSection, policy: Arc<DegradationPolicy>) -> Self {
        Self {
            local: LocalTier::new(config.max_local_entries, config.max_local_bytes, config.eviction_ratio),
            remote: None,
            policy,
            stats: StatsRecorder::default(),
            invalidations: Mutex::new(InvalidationLog::new(INVALIDATION_HISTORY)),
            config,
        }
    }

    /// Coordinator backed by a remote tier
    pub fn with_remote(config: CacheSection, policy: Arc<DegradationPolicy>, remote: Arc<dyn RemoteTier>) -> Self {
        Self {
            remote: Some(remote),
            ..Self::new(config, policy)
        }
    }

    /// Look up and decode a value from either tier
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with_hint(key, TierHint::Any).await
    }

    pub async fn get_with_hint<T: DeserializeOwned>(&self, key: &str, hint: TierHint) -> Option<T> {
        let start = Instant::now();
        let value = self.lookup(key, hint).await;
        self.stats.record_latency(start.elapsed());

        if value.is_none() {
            self.stats.record_miss();
        }
        value
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str, hint: TierHint) -> Option<T> {
        if hint != TierHint::RemoteOnly {
            match self.local.get(key) {
                LocalRead::Hit(payload) => {
                    return match decode::<T>(key, &payload) {
                        Ok(value) => {
                            debug!("Local cache hit for {}", key);
                            self.stats.record_local_hit();
                            Some(value)
                        }
                        Err(e) => {
                            self.discard_corrupt(key, &e).await;
                            None
                        }
                    };
                }
                LocalRead::Expired => self.stats.record_expiration(),
                LocalRead::Miss => {}
            }
        }

        if hint == TierHint::LocalOnly {
            return None;
        }

        let remote = self.available_remote()?;
        let since = self.generation();
        let payload = self.guarded("get", || remote.get(key)).await??;

        match decode::<T>(key, &payload) {
            Ok(value) => {
                debug!("Remote cache hit for {}; repopulating local tier", key);
                self.store_local_if_current(key, payload, self.config.default_ttl(), since);
                self.stats.record_remote_hit();
                Some(value)
            }
            Err(e) => {
                self.discard_corrupt(key, &e).await;
                None
            }
        }
    }

    /// Encode and store a value; `None` uses the configured default TTL
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> SetOutcome {
        let Some(payload) = self.encode(key, value) else {
            return SetOutcome::Skipped;
        };

        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        self.store_local(key, payload.clone(), ttl);
        self.store_remote(key, &payload, ttl).await
    }

    /// Current point in the invalidation history
    ///
    /// Take it before reading the source of truth, then fill the cache with
    /// `set_if_current`.
    pub fn generation(&self) -> Generation {
        self.invalidations.lock().current()
    }

    /// `set`, unless an invalidation covering `key` ran after `since`
    ///
    /// The check is repeated after the remote write; if an invalidation
    /// slipped in meanwhile the remote copy is deleted again.
    pub async fn set_if_current<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        since: Generation,
    ) -> SetOutcome {
        let Some(payload) = self.encode(key, value) else {
            return SetOutcome::Skipped;
        };

        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        if !self.store_local_if_current(key, payload.clone(), ttl, since) {
            debug!("Dropping stale fill of {}", key);
            return SetOutcome::Superseded;
        }

        let outcome = self.store_remote(key, &payload, ttl).await;

        if outcome == SetOutcome::Stored && self.invalidations.lock().invalidated_since(since, key) {
            debug!("Invalidation raced the remote fill of {}; deleting it", key);
            if let Some(remote) = self.available_remote() {
                self.guarded("delete", || remote.delete(key)).await;
            }
            return SetOutcome::Superseded;
        }
        outcome
    }

    /// Remove entries from both tiers; returns how many local entries went away
    pub async fn invalidate(&self, request: &Invalidation) -> usize {
        let matcher = match request.compile() {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!("Ignoring invalidation: {}", e);
                return 0;
            }
        };

        let removed = {
            let mut log = self.invalidations.lock();
            log.record(matcher.clone());
            match request {
                Invalidation::Exact(key) => usize::from(self.local.remove(key)),
                _ => self.local.remove_matching(&matcher),
            }
        };

        if let Some(remote) = self.available_remote() {
            match request {
                Invalidation::Exact(key) => {
                    self.guarded("delete", || remote.delete(key)).await;
                }
                pattern => {
                    // A regex's glob only narrows the scan; the matcher decides
                    let glob = pattern.remote_glob().unwrap_or_else(|| "*".to_string());
                    let keys = self
                        .guarded("keys", || remote.keys_matching(&glob))
                        .await
                        .map(|keys| keys.into_iter().filter(|k| matcher.is_match(k)).collect::<Vec<_>>());

                    if let Some(keys) = keys.filter(|keys: &Vec<String>| !keys.is_empty()) {
                        self.guarded("delete_many", || remote.delete_many(&keys)).await;
                    }
                }
            }
        }

        debug!("Invalidated {:?}: {} local entries", request, removed);
        removed
    }

    /// Invalidate using the legacy string form (`key`, `prefix*`, `prefix.*`)
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.invalidate(&Invalidation::parse(pattern)).await
    }

    /// Drop everything from both tiers
    pub async fn clear(&self) {
        {
            let mut log = self.invalidations.lock();
            log.record_all();
            self.local.clear();
        }
        if let Some(remote) = self.available_remote() {
            self.guarded("flush_all", || remote.flush_all()).await;
        }
    }

    /// Drop expired local entries
    pub fn purge_expired(&self) -> usize {
        let purged = self.local.purge_expired();
        for _ in 0..purged {
            self.stats.record_expiration();
        }
        purged
    }

    /// Whether a live entry exists in the local tier, without touching stats
    pub fn contains_local(&self, key: &str) -> bool {
        self.local.contains(key)
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.snapshot(self.local.len(), self.local.bytes(), self.policy.is_disabled())
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn degradation(&self) -> &Arc<DegradationPolicy> {
        &self.policy
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    // Private helper methods

    fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(payload) => Some(payload),
            Err(e) => {
                let err = AuthzError::Serialization(e.to_string());
                if self.policy.handle(&err) == RecoveryDirective::Bypass {
                    warn!("Skipping cache write for {}: {}", key, err);
                }
                None
            }
        }
    }

    /// Local write checked against the log under its lock, so no
    /// invalidation can land between the check and the insert
    fn store_local_if_current(&self, key: &str, payload: String, ttl: Duration, since: Generation) -> bool {
        let log = self.invalidations.lock();
        if log.invalidated_since(since, key) {
            return false;
        }
        self.store_local(key, payload, ttl);
        true
    }

    async fn store_remote(&self, key: &str, payload: &str, ttl: Duration) -> SetOutcome {
        let Some(remote) = self.available_remote() else {
            return SetOutcome::StoredLocalOnly;
        };

        match self.guarded("set", || remote.set_with_ttl(key, payload, ttl)).await {
            Some(()) => SetOutcome::Stored,
            None => SetOutcome::StoredLocalOnly,
        }
    }

    fn store_local(&self, key: &str, payload: String, ttl: Duration) {
        let evicted = self.local.insert(key, payload, ttl);
        if evicted > 0 {
            self.stats.record_evictions(evicted);
            self.policy
                .handle(&AuthzError::Capacity(format!("evicted {} entries", evicted)));
        }
    }

    fn available_remote(&self) -> Option<&Arc<dyn RemoteTier>> {
        let remote = self.remote.as_ref()?;
        if !self.config.remote_enabled || !self.policy.should_retry_remote() {
            return None;
        }
        Some(remote)
    }

    /// Run a remote call under the timeout, feeding failures to the policy
    ///
    /// A `Retry` directive gets exactly one immediate second attempt.
    async fn guarded<T, F, Fut>(&self, op: &str, call: F) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 1..=2 {
            let err = match tokio::time::timeout(self.config.remote_timeout(), call()).await {
                Ok(Ok(value)) => {
                    self.policy.reset_failure_count();
                    return Some(value);
                }
                Ok(Err(e)) => e,
                Err(_) => AuthzError::Timeout(format!(
                    "remote {} after {:?}",
                    op,
                    self.config.remote_timeout()
                )),
            };

            self.stats.record_remote_error();
            let directive = self.policy.handle(&err);
            warn!("Remote cache {} failed (attempt {}): {} -> {:?}", op, attempt, err, directive);

            match directive {
                RecoveryDirective::Retry { delay } if attempt == 1 => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                _ => break,
            }
        }
        None
    }

    async fn discard_corrupt(&self, key: &str, err: &AuthzError) {
        self.stats.record_corruption();
        self.policy.handle(err);
        self.local.remove(key);
        if let Some(remote) = self.available_remote() {
            self.guarded("delete", || remote.delete(key)).await;
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, payload: &str) -> Result<T> {
    serde_json::from_str(payload).map_err(|e| AuthzError::Corruption {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

//! Shared out-of-process cache tier
//!
//! The engine only needs a handful of commands from the remote store; any
//! Redis-like service can implement `RemoteTier`. `InMemoryRemoteTier` is a
//! process-local implementation with an availability switch, used by tests
//! and the simulation binary.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::key::glob_to_regex;
use super::local::CacheEntry;
use crate::error::{AuthzError, Result};

/// Commands consumed from the remote tier
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Fetch a raw payload
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a payload with expiry
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete one key
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys matching a glob (`*`, `?`, `[...]`, `\` escapes)
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;

    /// Delete several keys; returns how many existed
    async fn delete_many(&self, keys: &[String]) -> Result<usize>;

    /// Drop everything
    async fn flush_all(&self) -> Result<()>;

    /// Liveness probe
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory remote tier
#[derive(Default)]
pub struct InMemoryRemoteTier {
    entries: DashMap<String, CacheEntry<String>>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryRemoteTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the link going down or coming back
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of commands received, failed ones included
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Write a payload directly, bypassing the engine
    pub fn insert_raw(&self, key: &str, payload: &str, ttl: Duration) {
        self.entries.insert(key.to_string(), CacheEntry::new(payload.to_string(), ttl));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.get(key).map(|e| !e.is_expired()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            Err(AuthzError::TransientTier("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteTier for InMemoryRemoteTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;

        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries.insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let matcher = glob_to_regex(pattern)?;

        Ok(self
            .entries
            .iter()
            .filter(|entry| matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        self.check()?;
        Ok(keys.iter().filter(|key| self.entries.remove(*key).is_some()).count())
    }

    async fn flush_all(&self) -> Result<()> {
        self.check()?;
        self.entries.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

//! In-process cache tier
//!
//! Entries live in an unbounded `LruCache` that is only ever read with
//! `peek`, so its recency order is insertion order. Eviction pops from the
//! old end, which approximates LRU without paying for reordering on reads.

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::time::{Duration, Instant};

/// Fixed per-entry overhead added to key and payload bytes
const ENTRY_OVERHEAD: usize = 48;

/// Cached entry with absolute expiry
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// Cached value
    pub value: T,
    /// When the entry was written
    pub created_at: Instant,
    /// When the entry stops being served
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Result of a local lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalRead {
    Hit(String),
    /// Entry existed but had expired; it has been removed
    Expired,
    Miss,
}

struct Inner {
    entries: LruCache<String, CacheEntry<String>>,
    bytes: usize,
}

impl Inner {
    fn footprint(key: &str, payload: &str) -> usize {
        key.len() + payload.len() + ENTRY_OVERHEAD
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.bytes = self.bytes.saturating_sub(Self::footprint(key, &entry.value));
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            match self.entries.pop_lru() {
                Some((key, entry)) => {
                    self.bytes = self.bytes.saturating_sub(Self::footprint(&key, &entry.value));
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// Local cache tier with entry and byte ceilings
pub struct LocalTier {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: usize,
    eviction_ratio: f64,
}

impl LocalTier {
    pub fn new(max_entries: usize, max_bytes: usize, eviction_ratio: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            max_entries,
            max_bytes,
            eviction_ratio,
        }
    }

    /// Look up a payload, dropping it if expired
    pub fn get(&self, key: &str) -> LocalRead {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.peek(key) {
            Some(entry) if !entry.is_expired() => return LocalRead::Hit(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.remove(key);
            LocalRead::Expired
        } else {
            LocalRead::Miss
        }
    }

    /// Remaining TTL of a live entry
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .entries
            .peek(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.remaining_ttl())
    }

    /// Store a payload, evicting the oldest entries first if a ceiling would be crossed
    ///
    /// Returns how many entries were evicted to make room.
    pub fn insert(&self, key: &str, payload: String, ttl: Duration) -> usize {
        let mut inner = self.inner.lock();

        // Replacing a key frees its old footprint first
        inner.remove(key);

        let incoming = Inner::footprint(key, &payload);
        let mut evicted = 0;

        while !inner.entries.is_empty()
            && (inner.entries.len() + 1 > self.max_entries || inner.bytes + incoming > self.max_bytes)
        {
            let batch = ((inner.entries.len() as f64) * self.eviction_ratio).ceil().max(1.0) as usize;
            evicted += inner.evict_oldest(batch);
        }

        inner.bytes += incoming;
        inner.entries.put(key.to_string(), CacheEntry::new(payload, ttl));

        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    /// Remove every key matching `matcher`; returns the count removed
    pub fn remove_matching(&self, matcher: &Regex) -> usize {
        let mut inner = self.inner.lock();

        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, _)| matcher.is_match(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            inner.remove(key);
        }

        doomed.len()
    }

    /// Drop expired entries; returns the count removed
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }

        expired.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        matches!(self.get(key), LocalRead::Hit(_))
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate memory footprint in bytes
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

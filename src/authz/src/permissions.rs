//! Permission service
//!
//! Cached batch validation over the backing store, plus per-subject change
//! subscriptions. Every lookup degrades to "denied" instead of failing:
//! a backing-store error, timeout, or malformed answer yields deny-all
//! results that are never cached, so the next call asks the store again.
//!
//! Change subscriptions are reference counted per subject. The first
//! listener opens one change-feed subscription; the last one to leave
//! closes it. A change event first invalidates the subject's cached
//! entries, then notifies every listener.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::key::{self, Invalidation};
use crate::cache::CacheCoordinator;
use crate::config::PermissionSection;
use crate::error::Result;
use crate::feed::{ChangeFeed, FeedSubscription};
use crate::retry::with_timeout;
use crate::store::BackingStore;
use crate::types::{
    BatchOperation, BatchValidation, ChangeEvent, PermissionChange, PermissionCheck, PermissionResult, Scope,
};

/// Reason attached to every check denied because the store could not answer
pub const UNAVAILABLE_REASON: &str = "permission check unavailable";

/// Listener invoked synchronously for every change to a subject
pub type ChangeListener = Arc<dyn Fn(&PermissionChange) + Send + Sync>;

#[derive(Default)]
struct SubjectListeners {
    listeners: HashMap<u64, ChangeListener>,
    feed_id: Option<u64>,
    reader: Option<JoinHandle<()>>,
    /// Held while the subject's feed is being opened
    open_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Per-subject listener sets and the feed subscriptions backing them
struct ListenerRegistry {
    feed: Arc<dyn ChangeFeed>,
    subjects: Mutex<HashMap<String, SubjectListeners>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    fn remove(&self, subject_id: &str, listener_id: u64) {
        let mut subjects = self.subjects.lock();
        let Some(entry) = subjects.get_mut(subject_id) else {
            return;
        };

        entry.listeners.remove(&listener_id);
        if !entry.listeners.is_empty() {
            return;
        }

        if let Some(entry) = subjects.remove(subject_id) {
            Self::close(&*self.feed, subject_id, entry);
        }
    }

    fn close(feed: &dyn ChangeFeed, subject_id: &str, entry: SubjectListeners) {
        if let Some(reader) = entry.reader {
            reader.abort();
        }
        if let Some(feed_id) = entry.feed_id {
            feed.unsubscribe(feed_id);
            debug!("Closed change feed for {}", subject_id);
        }
    }

    fn feed_attached(&self, subject_id: &str) -> bool {
        self.subjects
            .lock()
            .get(subject_id)
            .map_or(false, |entry| entry.feed_id.is_some())
    }

    fn listeners(&self, subject_id: &str) -> Vec<ChangeListener> {
        self.subjects
            .lock()
            .get(subject_id)
            .map(|entry| entry.listeners.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Handle for one registered listener
///
/// Dropping the handle unsubscribes; `unsubscribe` may also be called
/// explicitly, any number of times.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    subject_id: String,
    listener_id: u64,
    registry: Weak<ListenerRegistry>,
    active: AtomicBool,
}

impl Subscription {
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.subject_id, self.listener_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject_id", &self.subject_id)
            .field("listener_id", &self.listener_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Cached, degrading front door for permission checks
pub struct PermissionService {
    cache: Arc<CacheCoordinator>,
    store: Arc<dyn BackingStore>,
    registry: Arc<ListenerRegistry>,
    config: PermissionSection,
    self_ref: Weak<Self>,
}

impl PermissionService {
    pub fn new(
        config: PermissionSection,
        cache: Arc<CacheCoordinator>,
        store: Arc<dyn BackingStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            cache,
            store,
            registry: Arc::new(ListenerRegistry {
                feed,
                subjects: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            config,
            self_ref: self_ref.clone(),
        })
    }

    /// Decide a check-set, from cache when possible
    pub async fn validate_batch(
        &self,
        subject_id: &str,
        checks: &[PermissionCheck],
        scope: Option<&Scope>,
    ) -> BatchValidation {
        let start = Instant::now();

        if checks.is_empty() {
            return BatchValidation {
                results: Vec::new(),
                cache_hit: false,
                response_time: start.elapsed(),
            };
        }

        let cache_key = key::permission_batch_key(subject_id, scope, checks);

        if let Some(cached) = self.cache.get::<Vec<PermissionResult>>(&cache_key).await {
            // The checksum ignores order, so line cached answers up with this request
            if let Some(results) = align(checks, &cached) {
                debug!("Permission cache hit for {}", cache_key);
                return BatchValidation {
                    results,
                    cache_hit: true,
                    response_time: start.elapsed(),
                };
            }
            debug!("Cached entry {} does not cover the request; refetching", cache_key);
        }

        let since = self.cache.generation();
        let answer = with_timeout(
            self.config.backing_timeout(),
            "batch_validate_permissions",
            self.store.batch_validate_permissions(subject_id, checks, scope),
        )
        .await;

        let results = match answer {
            Ok(results) if conforms(checks, &results) => {
                self.cache
                    .set_if_current(&cache_key, &results, Some(self.config.ttl()), since)
                    .await;
                results
            }
            Ok(results) => {
                warn!(
                    "Backing store returned {} results for {} checks of {}; denying",
                    results.len(),
                    checks.len(),
                    subject_id
                );
                deny_all(checks)
            }
            Err(e) => {
                warn!("Permission check for {} failed: {}; denying", subject_id, e);
                deny_all(checks)
            }
        };

        BatchValidation {
            results,
            cache_hit: false,
            response_time: start.elapsed(),
        }
    }

    /// Warm the cache with a subject's full permission list; failures are logged
    pub async fn preload(&self, subject_id: &str, scope: Option<&Scope>) {
        let since = self.cache.generation();
        let fetched = with_timeout(
            self.config.backing_timeout(),
            "fetch_permissions",
            self.store.fetch_permissions(subject_id, scope),
        )
        .await;

        match fetched {
            Ok(permissions) => {
                let list_key = key::permission_list_key(subject_id, scope);
                debug!("Preloaded {} permissions into {}", permissions.len(), list_key);
                self.cache
                    .set_if_current(&list_key, &permissions, Some(self.config.ttl()), since)
                    .await;
            }
            Err(e) => warn!("Preload for {} failed: {}", subject_id, e),
        }
    }

    /// Permission list cached by `preload`, if still present
    pub async fn cached_permissions(&self, subject_id: &str, scope: Option<&Scope>) -> Option<Vec<String>> {
        self.cache.get(&key::permission_list_key(subject_id, scope)).await
    }

    pub async fn check(&self, subject_id: &str, resource: &str, action: &str, scope: Option<&Scope>) -> bool {
        let checks = [PermissionCheck::new(resource, action)];
        self.validate_batch(subject_id, &checks, scope)
            .await
            .results
            .first()
            .map(|r| r.allowed)
            .unwrap_or(false)
    }

    pub async fn check_many(
        &self,
        subject_id: &str,
        pairs: &[(&str, &str)],
        scope: Option<&Scope>,
    ) -> Vec<PermissionResult> {
        let checks: Vec<PermissionCheck> = pairs
            .iter()
            .map(|(resource, action)| PermissionCheck::new(*resource, *action))
            .collect();
        self.validate_batch(subject_id, &checks, scope).await.results
    }

    pub async fn has_any(&self, subject_id: &str, pairs: &[(&str, &str)], scope: Option<&Scope>) -> bool {
        self.check_many(subject_id, pairs, scope)
            .await
            .iter()
            .any(|r| r.allowed)
    }

    pub async fn has_all(&self, subject_id: &str, pairs: &[(&str, &str)], scope: Option<&Scope>) -> bool {
        let results = self.check_many(subject_id, pairs, scope).await;
        !results.is_empty() && results.iter().all(|r| r.allowed)
    }

    /// Drop cached permission entries for one scope (`global` when `None`)
    pub async fn invalidate(&self, subject_id: &str, scope: Option<&Scope>) -> usize {
        self.cache
            .invalidate(&Invalidation::Prefix(key::permission_scope_prefix(subject_id, scope)))
            .await
    }

    /// Drop every cached permission, role and hierarchy entry of a subject,
    /// along with its recorded batch outcomes
    pub async fn invalidate_subject(&self, subject_id: &str) -> usize {
        let mut removed = 0;
        for prefix in [
            key::permission_subject_prefix(subject_id),
            key::role_subject_prefix(subject_id),
            key::hierarchy_subject_prefix(subject_id),
        ] {
            removed += self.cache.invalidate(&Invalidation::Prefix(prefix)).await;
        }
        removed + self.forget_batch_outcomes(subject_id).await
    }

    /// Register a listener for changes to `subject_id`
    ///
    /// Opens the subject's feed subscription when none is attached yet.
    /// Listeners arriving while another caller opens it wait for that
    /// attempt, and try again themselves if it failed, so `Ok` always means
    /// a feed is delivering to the listener.
    pub async fn subscribe_to_changes<F>(&self, subject_id: &str, listener: F) -> Result<Subscription>
    where
        F: Fn(&PermissionChange) + Send + Sync + 'static,
    {
        let registry = &self.registry;
        let listener_id = registry.next_id.fetch_add(1, Ordering::SeqCst);

        let (attached, open_lock) = {
            let mut subjects = registry.subjects.lock();
            let entry = subjects.entry(subject_id.to_string()).or_default();
            entry.listeners.insert(listener_id, Arc::new(listener));
            (entry.feed_id.is_some(), entry.open_lock.clone())
        };

        let subscription = Subscription {
            subject_id: subject_id.to_string(),
            listener_id,
            registry: Arc::downgrade(registry),
            active: AtomicBool::new(true),
        };

        if !attached {
            let _opening = open_lock.lock().await;
            if !registry.feed_attached(subject_id) {
                match registry.feed.subscribe(subject_id).await {
                    Ok(feed_subscription) => self.attach_feed(subject_id, feed_subscription),
                    Err(e) => {
                        warn!("Could not open change feed for {}: {}", subject_id, e);
                        subscription.unsubscribe();
                        return Err(e);
                    }
                }
            }
        }

        debug!("Listener {} subscribed to {}", listener_id, subject_id);
        Ok(subscription)
    }

    /// Apply one change: invalidate first, then notify listeners
    ///
    /// Returns the number of listeners notified.
    pub async fn handle_change(&self, event: ChangeEvent) -> usize {
        let subject_id = &event.subject_id;

        let removed = match &event.scope {
            Some(scope) => {
                let mut removed = self.invalidate(subject_id, Some(scope)).await;
                for prefix in [
                    key::role_type_prefix(subject_id, scope.scope_type),
                    key::hierarchy_type_prefix(subject_id, scope.scope_type),
                ] {
                    removed += self.cache.invalidate(&Invalidation::Prefix(prefix)).await;
                }
                // An out-of-band change may undo a recorded write
                removed + self.forget_batch_outcomes(subject_id).await
            }
            None => self.invalidate_subject(subject_id).await,
        };

        let change = PermissionChange::from(&event);
        let listeners = self.registry.listeners(subject_id);

        info!(
            "Change for {} ({}:{}): {} entries invalidated, {} listeners",
            subject_id,
            change.resource,
            change.action,
            removed,
            listeners.len()
        );

        for listener in &listeners {
            listener(&change);
        }
        listeners.len()
    }

    pub fn listener_count(&self, subject_id: &str) -> usize {
        self.registry
            .subjects
            .lock()
            .get(subject_id)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    /// Subjects with an open feed subscription
    pub fn active_feeds(&self) -> usize {
        self.registry
            .subjects
            .lock()
            .values()
            .filter(|entry| entry.feed_id.is_some())
            .count()
    }

    /// Close every feed subscription and forget all listeners
    pub fn close_all(&self) {
        let drained: Vec<(String, SubjectListeners)> = self.registry.subjects.lock().drain().collect();
        for (subject_id, entry) in drained {
            ListenerRegistry::close(&*self.registry.feed, &subject_id, entry);
        }
    }

    // Private helper methods

    async fn forget_batch_outcomes(&self, subject_id: &str) -> usize {
        let mut removed = 0;
        for operation in [BatchOperation::Assign, BatchOperation::Revoke] {
            removed += self
                .cache
                .invalidate(&Invalidation::Prefix(key::batch_subject_prefix(subject_id, operation)))
                .await;
        }
        removed
    }

    fn attach_feed(&self, subject_id: &str, feed_subscription: FeedSubscription) {
        let registry = &self.registry;
        let mut subjects = registry.subjects.lock();

        let Some(entry) = subjects.get_mut(subject_id) else {
            registry.feed.unsubscribe(feed_subscription.id);
            return;
        };

        if entry.feed_id.is_some() {
            // Another open for this subject won
            registry.feed.unsubscribe(feed_subscription.id);
            return;
        }

        if entry.listeners.is_empty() {
            // Everyone left while the feed was opening
            registry.feed.unsubscribe(feed_subscription.id);
            subjects.remove(subject_id);
            return;
        }

        let FeedSubscription { id, mut events } = feed_subscription;
        let service = self.self_ref.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match service.upgrade() {
                    Some(service) => {
                        service.handle_change(event).await;
                    }
                    None => break,
                }
            }
        });

        entry.feed_id = Some(id);
        entry.reader = Some(reader);
        debug!("Opened change feed {} for {}", id, subject_id);
    }
}

impl Drop for PermissionService {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// One result per check, same order, each answering its check
fn conforms(checks: &[PermissionCheck], results: &[PermissionResult]) -> bool {
    checks.len() == results.len() && checks.iter().zip(results).all(|(check, result)| result.answers(check))
}

/// Reorder cached results to match `checks`; `None` when a check is not covered
fn align(checks: &[PermissionCheck], cached: &[PermissionResult]) -> Option<Vec<PermissionResult>> {
    if conforms(checks, cached) {
        return Some(cached.to_vec());
    }
    if checks.len() != cached.len() {
        return None;
    }

    checks
        .iter()
        .map(|check| cached.iter().find(|result| result.answers(check)).cloned())
        .collect()
}

fn deny_all(checks: &[PermissionCheck]) -> Vec<PermissionResult> {
    checks
        .iter()
        .map(|check| PermissionResult::deny(check, UNAVAILABLE_REASON))
        .collect()
}

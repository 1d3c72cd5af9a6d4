//! Change-feed interface
//!
//! A feed delivers out-of-band permission changes for one subject over a
//! channel. The transport behind it is not the engine's concern.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{AuthzError, Result};
use crate::types::ChangeEvent;

/// An open subscription: its id and the event stream
#[derive(Debug)]
pub struct FeedSubscription {
    pub id: u64,
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// Subscribe-by-subject change source
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a stream of changes for one subject
    async fn subscribe(&self, subject_id: &str) -> Result<FeedSubscription>;

    /// Close a subscription; unknown or already-closed ids are ignored
    fn unsubscribe(&self, subscription_id: u64);
}

/// In-process feed; `publish` fans an event out to the subject's subscriptions
pub struct InMemoryChangeFeed {
    subscriptions: DashMap<u64, (String, mpsc::Sender<ChangeEvent>)>,
    next_id: AtomicU64,
    buffer: usize,
    refuse: AtomicBool,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::with_buffer(64)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            refuse: AtomicBool::new(false),
        }
    }

    /// Make subsequent `subscribe` calls fail
    pub fn set_refuse_subscriptions(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Deliver an event; returns how many subscriptions received it
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        for entry in self.subscriptions.iter() {
            let (subject, sender) = entry.value();
            if subject == &event.subject_id && sender.try_send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Open subscriptions for a subject
    pub fn subscription_count(&self, subject_id: &str) -> usize {
        self.subscriptions.iter().filter(|e| e.value().0 == subject_id).count()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(&self, subject_id: &str) -> Result<FeedSubscription> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(AuthzError::ChangeFeed(format!("subscription refused for {}", subject_id)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscriptions.insert(id, (subject_id.to_string(), tx));

        debug!("Opened change feed subscription {} for {}", id, subject_id);
        Ok(FeedSubscription { id, events: rx })
    }

    fn unsubscribe(&self, subscription_id: u64) {
        if self.subscriptions.remove(&subscription_id).is_some() {
            debug!("Closed change feed subscription {}", subscription_id);
        }
    }
}

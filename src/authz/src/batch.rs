//! Batch authorization processor
//!
//! Role assignments and revocations are queued, deduplicated by
//! `(subject, role, scope)` and written to the backing store in batches.
//! A batch is flushed when the queue reaches `batch_size` or when the flush
//! timer fires, whichever comes first.
//!
//! # Guarantees
//!
//! - Enqueuing the same key twice keeps only the latest request.
//! - At most one flush runs at a time; a concurrent `flush` is a no-op.
//! - Each request ends a flush as exactly one of successful, failed, skipped.
//! - Cached role/permission entries of a subject are invalidated before a
//!   write is reported successful.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::key::{self, Invalidation};
use crate::cache::CacheCoordinator;
use crate::config::BatchSection;
use crate::error::{AuthzError, Result};
use crate::retry::with_timeout;
use crate::store::BackingStore;
use crate::types::{BatchAuthorizationRequest, BatchError, BatchOperation, BatchResult};

/// Cumulative processor metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    pub total_batches: u64,
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Enqueues that replaced a pending request with the same key
    pub deduplicated: u64,
    pub queue_depth: usize,
    pub is_processing: bool,
    pub avg_batch_ms: f64,
    pub last_flush: Option<DateTime<Utc>>,
}

/// Cached marker that a write already reached the backing store
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WriteOutcome {
    request: BatchAuthorizationRequest,
    completed_at: DateTime<Utc>,
}

enum Outcome {
    Successful,
    Skipped,
    Failed(BatchError),
}

#[derive(Default)]
struct Pending {
    order: Vec<String>,
    requests: HashMap<String, BatchAuthorizationRequest>,
    timer: Option<(u64, JoinHandle<()>)>,
    timer_generation: u64,
}

impl Pending {
    /// Insert or overwrite; returns true when an existing key was replaced
    fn upsert(&mut self, request: BatchAuthorizationRequest) -> bool {
        let dedup_key = request.dedup_key();
        match self.requests.insert(dedup_key.clone(), request) {
            Some(_) => true,
            None => {
                self.order.push(dedup_key);
                false
            }
        }
    }

    fn drain(&mut self) -> Vec<BatchAuthorizationRequest> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|k| self.requests.remove(&k))
            .collect()
    }

    fn len(&self) -> usize {
        self.requests.len()
    }
}

#[derive(Default)]
struct Totals {
    batches: u64,
    requests: u64,
    successful: u64,
    failed: u64,
    skipped: u64,
    deduplicated: u64,
    batch_millis: f64,
    last_flush: Option<DateTime<Utc>>,
}

/// Resets the processing flag even if a flush future is dropped midway
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Queues, deduplicates and flushes role writes
pub struct BatchAuthorizationProcessor {
    store: Arc<dyn BackingStore>,
    cache: Arc<CacheCoordinator>,
    config: BatchSection,
    pending: Mutex<Pending>,
    is_processing: AtomicBool,
    totals: Mutex<Totals>,
    self_ref: Weak<Self>,
}

impl BatchAuthorizationProcessor {
    pub fn new(config: BatchSection, store: Arc<dyn BackingStore>, cache: Arc<CacheCoordinator>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            cache,
            config,
            pending: Mutex::new(Pending::default()),
            is_processing: AtomicBool::new(false),
            totals: Mutex::new(Totals::default()),
            self_ref: self_ref.clone(),
        })
    }

    /// Queue one request
    ///
    /// Returns the flush result when this enqueue filled the batch.
    pub async fn enqueue(&self, request: BatchAuthorizationRequest) -> Option<BatchResult> {
        self.enqueue_many(vec![request]).await
    }

    /// Queue several requests, flushing at most once
    pub async fn enqueue_many(&self, requests: Vec<BatchAuthorizationRequest>) -> Option<BatchResult> {
        let full = {
            let mut pending = self.pending.lock();
            let mut replaced = 0;
            for request in requests {
                if pending.upsert(request) {
                    replaced += 1;
                }
            }
            if replaced > 0 {
                self.totals.lock().deduplicated += replaced;
            }

            let full = pending.len() >= self.config.batch_size;
            if !full {
                self.arm_timer(&mut pending);
            }
            full
        };

        if full {
            debug!("Batch size {} reached; flushing", self.config.batch_size);
            Some(self.flush().await)
        } else {
            None
        }
    }

    /// Drain and process everything pending
    pub async fn flush(&self) -> BatchResult {
        if self
            .is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Flush already in progress; skipping");
            return BatchResult::empty();
        }
        let guard = ProcessingGuard(&self.is_processing);

        let requests = {
            let mut pending = self.pending.lock();
            if let Some((_, timer)) = pending.timer.take() {
                timer.abort();
            }
            pending.drain()
        };

        let result = self.process(requests).await;
        drop(guard);

        self.record(&result);

        // Requests that arrived mid-flush get their own timer
        {
            let mut pending = self.pending.lock();
            if pending.len() > 0 {
                self.arm_timer(&mut pending);
            }
        }

        result
    }

    /// Flush what is pending and stop the timer
    pub async fn shutdown(&self) -> BatchResult {
        let result = self.flush().await;
        if let Some((_, timer)) = self.pending.lock().timer.take() {
            timer.abort();
        }
        result
    }

    pub fn metrics(&self) -> BatchMetrics {
        let queue_depth = self.pending.lock().len();
        let totals = self.totals.lock();

        BatchMetrics {
            total_batches: totals.batches,
            total_requests: totals.requests,
            successful: totals.successful,
            failed: totals.failed,
            skipped: totals.skipped,
            deduplicated: totals.deduplicated,
            queue_depth,
            is_processing: self.is_processing.load(Ordering::Acquire),
            avg_batch_ms: if totals.batches == 0 {
                0.0
            } else {
                totals.batch_millis / totals.batches as f64
            },
            last_flush: totals.last_flush,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }

    pub fn timer_armed(&self) -> bool {
        self.pending.lock().timer.is_some()
    }

    // Private helper methods

    /// Arm the flush timer unless one is already armed
    fn arm_timer(&self, pending: &mut Pending) {
        if pending.timer.is_some() || pending.len() == 0 {
            return;
        }

        pending.timer_generation += 1;
        let generation = pending.timer_generation;
        let delay = self.config.flush_timeout();
        let weak = self.self_ref.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(processor) = weak.upgrade() {
                processor.on_timer(generation).await;
            }
        });

        pending.timer = Some((generation, handle));
    }

    async fn on_timer(&self, generation: u64) {
        // Claim the slot so no flush can abort this task from here on
        let claimed = {
            let mut pending = self.pending.lock();
            match &pending.timer {
                Some((armed, _)) if *armed == generation => {
                    pending.timer = None;
                    true
                }
                _ => false,
            }
        };

        if claimed {
            debug!("Flush timer fired");
            self.flush().await;
        }
    }

    async fn process(&self, requests: Vec<BatchAuthorizationRequest>) -> BatchResult {
        let start = Instant::now();
        let mut result = BatchResult::empty();

        if requests.is_empty() {
            return result;
        }

        for chunk in requests.chunks(self.config.chunk_size.max(1)) {
            let outcomes = join_all(chunk.iter().map(|request| self.process_one(request))).await;

            for outcome in outcomes {
                match outcome {
                    Outcome::Successful => result.successful += 1,
                    Outcome::Skipped => result.skipped += 1,
                    Outcome::Failed(error) => {
                        result.failed += 1;
                        result.errors.push(error);
                    }
                }
            }
        }

        result.duration = start.elapsed();
        result.timestamp = Utc::now();

        info!(
            "Batch flushed: {} successful, {} failed, {} skipped in {:?}",
            result.successful, result.failed, result.skipped, result.duration
        );

        result
    }

    async fn process_one(&self, request: &BatchAuthorizationRequest) -> Outcome {
        let outcome_key = key::batch_outcome_key(request, request.operation);

        if self.config.enable_cache && self.cache.get::<WriteOutcome>(&outcome_key).await.is_some() {
            debug!("Skipping {} (outcome cached)", outcome_key);
            return Outcome::Skipped;
        }

        let mut last_error = AuthzError::Internal("no attempt made".into());

        for attempt in 1..=self.config.max_retries {
            match with_timeout(self.config.backing_timeout(), request.operation.as_str(), self.write(request)).await {
                Ok(()) => {
                    self.after_write(request, &outcome_key).await;
                    return Outcome::Successful;
                }
                Err(e) => {
                    debug!("{} attempt {} failed: {}", outcome_key, attempt, e);
                    last_error = e;
                }
            }
        }

        warn!(
            "Giving up on {} for {} after {} attempts: {}",
            request.role_id, request.subject_id, self.config.max_retries, last_error
        );

        Outcome::Failed(BatchError {
            request: request.clone(),
            error: last_error.to_string(),
            attempts: self.config.max_retries,
        })
    }

    async fn write(&self, request: &BatchAuthorizationRequest) -> Result<()> {
        let scope_id = request.scope_id.as_deref();
        match request.operation {
            BatchOperation::Assign => {
                self.store
                    .assign_role(&request.subject_id, &request.role_id, scope_id, request.scope_type)
                    .await
            }
            BatchOperation::Revoke => {
                self.store
                    .revoke_role(&request.subject_id, &request.role_id, scope_id, request.scope_type)
                    .await
            }
        }
    }

    /// Invalidate the subject's cached decisions, then record the outcome
    async fn after_write(&self, request: &BatchAuthorizationRequest, outcome_key: &str) {
        let subject = &request.subject_id;
        for prefix in [
            key::permission_subject_prefix(subject),
            key::role_subject_prefix(subject),
            key::hierarchy_subject_prefix(subject),
        ] {
            self.cache.invalidate(&Invalidation::Prefix(prefix)).await;
        }

        let opposite = key::batch_outcome_key(request, request.operation.opposite());
        self.cache.invalidate(&Invalidation::Exact(opposite)).await;

        if self.config.enable_cache {
            let outcome = WriteOutcome {
                request: request.clone(),
                completed_at: Utc::now(),
            };
            self.cache.set(outcome_key, &outcome, Some(self.config.cache_ttl())).await;
        }
    }

    fn record(&self, result: &BatchResult) {
        if result.processed() == 0 {
            return;
        }

        let mut totals = self.totals.lock();
        totals.batches += 1;
        totals.requests += result.processed() as u64;
        totals.successful += result.successful as u64;
        totals.failed += result.failed as u64;
        totals.skipped += result.skipped as u64;
        totals.batch_millis += result.duration.as_secs_f64() * 1000.0;
        totals.last_flush = Some(result.timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DegradationPolicy;
    use crate::config::CacheSection;
    use crate::store::InMemoryBackingStore;

    fn processor(config: BatchSection) -> (Arc<BatchAuthorizationProcessor>, Arc<InMemoryBackingStore>) {
        let store = Arc::new(InMemoryBackingStore::new());
        let cache = Arc::new(CacheCoordinator::new(
            CacheSection::default(),
            Arc::new(DegradationPolicy::default()),
        ));
        (BatchAuthorizationProcessor::new(config, store.clone(), cache), store)
    }

    #[test]
    fn test_pending_upsert_keeps_first_position() {
        let mut pending = Pending::default();
        assert!(!pending.upsert(BatchAuthorizationRequest::assign("u1", "r1")));
        assert!(!pending.upsert(BatchAuthorizationRequest::assign("u2", "r1")));
        assert!(pending.upsert(BatchAuthorizationRequest::revoke("u1", "r1")));

        let drained = pending.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].subject_id, "u1");
        assert_eq!(drained[0].operation, BatchOperation::Revoke);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_arms_timer_once() {
        let (processor, _store) = processor(BatchSection {
            flush_timeout_ms: 10_000,
            ..Default::default()
        });

        assert!(processor.enqueue(BatchAuthorizationRequest::assign("u1", "r1")).await.is_none());
        assert!(processor.timer_armed());
        let generation = processor.pending.lock().timer_generation;

        processor.enqueue(BatchAuthorizationRequest::assign("u2", "r1")).await;
        assert_eq!(processor.pending.lock().timer_generation, generation);

        processor.flush().await;
        assert!(!processor.timer_armed());
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_noop() {
        let (processor, _store) = processor(BatchSection::default());
        processor.is_processing.store(true, Ordering::SeqCst);

        processor.pending.lock().upsert(BatchAuthorizationRequest::assign("u1", "r1"));
        let result = processor.flush().await;

        assert_eq!(result.processed(), 0);
        assert_eq!(processor.queue_depth(), 1);
    }
}

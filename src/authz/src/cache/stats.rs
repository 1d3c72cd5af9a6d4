//! Running counters behind `CacheCoordinator::stats`

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated on every coordinator call
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
    remote_errors: AtomicU64,
    corruptions: AtomicU64,
    latency_micros: AtomicU64,
    timed_requests: AtomicU64,
}

impl StatsRecorder {
    pub fn record_local_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.remote_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_remote_error(&self) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corruption(&self) {
        self.corruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.timed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.local_hits,
            &self.remote_hits,
            &self.expirations,
            &self.evictions,
            &self.remote_errors,
            &self.corruptions,
            &self.latency_micros,
            &self.timed_requests,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, local_entries: usize, local_bytes: usize, remote_disabled: bool) -> CoordinatorStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let timed = self.timed_requests.load(Ordering::Relaxed);

        let (hit_rate, miss_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (hits as f64 / total as f64, misses as f64 / total as f64)
        };

        let avg_response_ms = if timed == 0 {
            0.0
        } else {
            self.latency_micros.load(Ordering::Relaxed) as f64 / timed as f64 / 1000.0
        };

        CoordinatorStats {
            hits,
            misses,
            total_requests: total,
            hit_rate,
            miss_rate,
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
            local_entries,
            local_bytes,
            avg_response_ms,
            remote_disabled,
        }
    }
}

/// Aggregate coordinator statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub remote_errors: u64,
    pub corruptions: u64,
    /// Live entries in the local tier
    pub local_entries: usize,
    /// Approximate local tier footprint in bytes
    pub local_bytes: usize,
    pub avg_response_ms: f64,
    pub remote_disabled: bool,
}

impl CoordinatorStats {
    /// Export in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        format!(
            r#"# HELP permguard_cache_hits_total Cache hits across both tiers
# TYPE permguard_cache_hits_total counter
permguard_cache_hits_total {}

# HELP permguard_cache_misses_total Cache misses
# TYPE permguard_cache_misses_total counter
permguard_cache_misses_total {}

# HELP permguard_cache_evictions_total Local tier evictions
# TYPE permguard_cache_evictions_total counter
permguard_cache_evictions_total {}

# HELP permguard_cache_remote_errors_total Remote tier errors
# TYPE permguard_cache_remote_errors_total counter
permguard_cache_remote_errors_total {}

# HELP permguard_cache_local_bytes Approximate local tier footprint
# TYPE permguard_cache_local_bytes gauge
permguard_cache_local_bytes {}

# HELP permguard_cache_remote_disabled Remote tier circuit open
# TYPE permguard_cache_remote_disabled gauge
permguard_cache_remote_disabled {}
"#,
            self.hits,
            self.misses,
            self.evictions,
            self.remote_errors,
            self.local_bytes,
            u8::from(self.remote_disabled),
        )
    }
}

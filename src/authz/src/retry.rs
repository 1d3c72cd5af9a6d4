//! Bounded retries with exponential backoff, and per-attempt timeouts
//!
//! Only transient errors (`AuthzError::is_transient`) are retried; anything
//! else is returned after the first attempt.

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{AuthzError, Result};

/// Backoff schedule: `base`, `base * multiplier`, ... for `max_extra_attempts` retries
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_extra_attempts: u32,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max_extra_attempts: 2,
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_extra_attempts: u32) -> Self {
        Self {
            base,
            max_extra_attempts,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base * self.multiplier.saturating_pow(retry.saturating_sub(1))
    }
}

/// Run `operation`, retrying transient failures with backoff
pub async fn retry_transient<F, Fut, T>(policy: &BackoffPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < policy.max_extra_attempts => {
                retry += 1;
                let delay = policy.delay_for(retry);
                warn!(
                    operation = %operation_name,
                    retry = retry,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    operation = %operation_name,
                    attempts = retry + 1,
                    error = %e,
                    "Operation failed"
                );
                return Err(e);
            }
        }
    }
}

/// Bound a call; elapsed time becomes `AuthzError::Timeout`
pub async fn with_timeout<Fut, T>(limit: Duration, operation_name: &str, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AuthzError::Timeout(format!("{} exceeded {:?}", operation_name, limit))),
    }
}

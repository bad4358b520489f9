// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry logic, backoff, rate limiting, bulkheads.
//!
//! This module provides the patterns that keep a run polite towards the
//! remote service:
//!
//! - [`RetryConfig`] + [`call_with_retry`]: bounded retries with per-call timeout
//! - [`RateLimiter`]: Token bucket shared by every remote call in a run
//! - [`Bulkhead`]: Semaphore acting as the run's worker pool
//!
//! # Retry Policy
//!
//! ```text
//! Error            Retried   Delay before next attempt
//! -----            -------   -------------------------
//! Throttled        yes       initial * factor^(n-1), capped, at least retry_after
//! Transport        yes       initial * n, capped
//! Timeout          yes       same as Transport
//! Rejected         no        -
//! Authentication   no        - (fatal)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), catalog_replicator::resilience::BulkheadFull> {
//! use catalog_replicator::resilience::{RateLimiter, Bulkhead, RateLimitConfig};
//!
//! // Rate limit: 50 calls/sec with burst of 10
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! // Bulkhead: max 10 concurrent workers
//! let bulkhead = Bulkhead::new(10);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use crate::error::{RemoteError, ReplicationError, Result};
use crate::metrics;
use crate::remote::RemoteResult;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Retry behavior for remote calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for backoff).
    pub max_delay: Duration,

    /// Backoff multiplier for throttling (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Deadline for each individual remote call.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    ///
    /// Fails quickly to avoid slow tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            call_timeout: Duration::from_millis(500),
        }
    }

    /// Exponential delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Linear delay used for transport failures (1-indexed).
    pub fn transport_delay(&self, attempt: usize) -> Duration {
        let factor = attempt.max(1).min(u32::MAX as usize) as u32;
        std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay)
    }

    /// Delay after a throttling response, never shorter than the server's hint.
    pub fn throttle_delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        retry_after.map_or(backoff, |hint| backoff.max(hint))
    }
}

/// Run one remote call under the retry policy.
///
/// Each attempt waits for the rate limiter (if any) and is bounded by
/// `call_timeout`. Non-retryable errors are returned immediately.
pub async fn call_with_retry<T, F, Fut>(
    operation: &str,
    retry: &RetryConfig,
    limiter: Option<&RateLimiter>,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        if let Some(limiter) = limiter {
            limiter.acquire().await;
        }

        let outcome = match tokio::time::timeout(retry.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(retry.call_timeout)),
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            if err.is_fatal() {
                warn!(operation, error = %err, "Remote call failed fatally");
            }
            return Err(ReplicationError::remote(operation, err));
        }

        if attempt >= max_attempts {
            warn!(operation, attempts = attempt, error = %err, "Giving up after retries");
            return Err(match err {
                RemoteError::Throttled { .. } => ReplicationError::Throttled {
                    operation: operation.to_string(),
                    attempts: attempt,
                },
                other => ReplicationError::Transport {
                    operation: operation.to_string(),
                    message: format!("{other} (after {attempt} attempts)"),
                },
            });
        }

        let delay = match &err {
            RemoteError::Throttled { retry_after } => {
                metrics::record_retry(operation, "throttled");
                retry.throttle_delay(attempt, *retry_after)
            }
            _ => {
                metrics::record_retry(operation, "transport");
                retry.transport_delay(attempt)
            }
        };

        debug!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying remote call"
        );
        tokio::time::sleep(delay).await;
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each remote call consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 50 calls/sec with burst of 10.
    fn default() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 50,
        }
    }
}

/// Token bucket rate limiter.
///
/// Thread-safe and async-aware. One instance is shared by every worker of a run.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (worker pool)
// =============================================================================

/// Error when the bulkhead has been closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("worker pool closed: max {max_concurrent} concurrent workers")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

impl From<BulkheadFull> for ReplicationError {
    fn from(e: BulkheadFull) -> Self {
        ReplicationError::Internal(e.to_string())
    }
}

/// Bulkhead pattern: limits concurrent operations.
///
/// A run creates one bulkhead of `number_of_threads` permits and shares it
/// between every batch and datapoint task, so the total number of in-flight
/// remote calls never exceeds the configured pool size.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Release waiters and refuse further permits. Called at run end and
    /// as soon as any worker hits a fatal error.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

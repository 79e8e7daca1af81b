//! Retry with exponential backoff for transient store failures
//!
//! The dispatcher's sweep loop wraps its store calls in this helper so a
//! briefly unreachable store does not abort a whole sweep. Only transient
//! errors are retried; permanent ones (serialization, duplicate ids) return
//! immediately.

use crate::error::OutboxResult;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff behavior for retried store operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Run a fallible async operation, retrying transient failures with backoff
///
/// # Arguments
/// * `operation` - The async operation to retry
/// * `policy` - Backoff policy
/// * `context` - Context string for logging (e.g., "claim_batch")
///
/// # Returns
/// * `Ok(T)` if the operation succeeds within `max_attempts`
/// * `Err(OutboxError)` on a permanent error or once retries are exhausted
pub async fn retry_transient<F, Fut, T>(
    operation: F,
    policy: &RetryPolicy,
    context: &str,
) -> OutboxResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = OutboxResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Transient failure, retrying with backoff"
                );

                sleep(backoff).await;

                // Exponential backoff with cap
                backoff = std::cmp::min(backoff * 2, policy.max_backoff);
            }
        }
    }
}

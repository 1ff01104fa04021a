//! Fixed-interval retry and bounded polling.
//!
//! Store calls that fail transiently are re-invoked a fixed number of times with a
//! constant sleep in between. Eventual-consistency waits (a created model version
//! becoming READY) use [`poll_until`] with an explicit iteration count.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Sleep between two attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent sleeping between attempts.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Retry an async operation with a fixed interval between attempts.
///
/// Returns the final result together with the retry statistics.
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        stats.attempts = attempt;

        match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 1 {
                    debug!("Operation succeeded after {} attempts", attempt);
                }
                return (Ok(value), stats);
            }
            Err(e) => {
                stats.last_error = Some(e.to_string());

                if !should_retry(&e) {
                    debug!("Error is not retryable: {}", e);
                    return (Err(e), stats);
                }

                if attempt >= max_attempts {
                    warn!(
                        "All {} retry attempts exhausted. Last error: {}",
                        max_attempts, e
                    );
                    return (Err(e), stats);
                }

                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, max_attempts, e, policy.interval
                );
                stats.total_delay += policy.interval;
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// Bounded polling contract: at most `iterations` checks, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub iterations: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(iterations: u32, interval: Duration) -> Self {
        Self {
            iterations,
            interval,
        }
    }
}

/// Poll `check` until it reports `true` or the iteration budget runs out.
///
/// Returns `Ok(true)` when the condition was met and `Ok(false)` on timeout. Errors from
/// `check` are returned immediately.
pub async fn poll_until<F, Fut, E>(policy: &PollPolicy, mut check: F) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    for iteration in 0..policy.iterations.max(1) {
        if check().await? {
            return Ok(true);
        }
        if iteration + 1 < policy.iterations {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Ok(false)
}

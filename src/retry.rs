//! Timeout-and-retry wrapper for wiki API calls.
//!
//! Each attempt runs under a hard timeout. Only timeouts are retried, with
//! a linear backoff of `attempt × backoff_step` between attempts. Any other
//! failure (HTTP error status, malformed body, connection refused) is
//! returned immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::FetchError;

/// Per-call timeout and retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Attempts after the first one.
    pub max_retries: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn new(timeout_secs: u64, max_retries: u32) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            max_retries,
            backoff_step: Duration::from_secs(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(60, 3)
    }
}

/// Run `op` until it succeeds, fails with a non-timeout error, or the
/// retry budget is spent.
///
/// `target` names the remote resource (e.g. `"page 123"`) and is carried
/// into the terminal [`FetchError::RetriesExhausted`].
pub async fn with_timeout_retry<T, F, Fut>(
    target: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = policy.max_retries + 1;

    for attempt in 0..attempts {
        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                target: target.to_string(),
            }),
        };

        match outcome {
            Err(e) if e.is_timeout() => {
                warn!(
                    target_id = %target,
                    attempt = attempt + 1,
                    attempts,
                    "request timed out"
                );
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.backoff_step * (attempt + 1)).await;
                }
            }
            other => return other,
        }
    }

    Err(FetchError::RetriesExhausted {
        target: target.to_string(),
        attempts,
    })
}

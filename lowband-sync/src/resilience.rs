//! Shared timeout, retry and backoff policy for every network call
//!
//! Both pipelines and any ad hoc call site go through [`execute_with_retry`]
//! so backoff, jitter and timeout constants live in exactly one place.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::errors::{Result, SyncError};

/// Retry policy for remote operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay ceiling before the first retry
    pub base_delay: Duration,
    /// Growth of the delay ceiling per retry
    pub backoff_multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Hard limit on each individual attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(2000),
            backoff_multiplier: 2.5,
            jitter: true,
            max_delay: Duration::from_secs(120),
            // High-latency, low-bandwidth links
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay ceiling before retry number `retry` (0-based): `base * multiplier^retry`
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let ceiling = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !ceiling.is_finite() || ceiling >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(ceiling.max(0.0))
    }

    /// Actual delay before retry number `retry`, jitter applied
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ceiling = self.backoff_ceiling(retry);
        if !self.jitter {
            return ceiling;
        }
        ceiling.mul_f64(0.5 + fastrand::f64() * 0.5)
    }

    /// Run `operation` under this policy with the default retry predicate
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        execute_with_retry(self, SyncError::is_retryable, operation).await
    }
}

/// Run `operation` until it succeeds, fails terminally, or retries run out.
///
/// `operation` receives the 1-based attempt number. Each attempt is bounded by
/// `policy.attempt_timeout`; an elapsed attempt counts as [`SyncError::Timeout`].
/// Errors rejected by `should_retry` propagate immediately without consuming
/// retry budget. When retries are exhausted the last error is returned.
pub async fn execute_with_retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&SyncError) -> bool,
{
    let mut retry = 0u32;
    loop {
        let attempt = retry + 1;
        let outcome = match timeout(policy.attempt_timeout, operation(attempt)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::Timeout(format!(
                "attempt {} after {:?}",
                attempt, policy.attempt_timeout
            ))),
        };

        let error = match outcome {
            Ok(value) => {
                if retry > 0 {
                    debug!(attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if retry >= policy.max_retries || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for(retry);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying: {}",
            error
        );
        sleep(delay).await;
        retry += 1;
    }
}

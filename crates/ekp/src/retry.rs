//! Exponential-backoff retry harness for KMS calls.
//!
//! Classification is not this module's business: it asks
//! [`EkpError::is_retryable`] and nothing else. Per-call timeouts are the
//! connector's concern; this wrapper only bounds the number of attempts.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use ekp_common::EkpResult;

use crate::config::Config;

/// Attempt budget and delay schedule for one logical KMS operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.kms_connection_retries,
            base_delay: Duration::from_millis(cfg.kms_backoff_base_ms),
            max_delay: Duration::from_millis(cfg.kms_backoff_max_ms),
        }
    }
}

/// Invoke `make_call` until it succeeds, a non-retryable error occurs, or
/// the retry budget is exhausted.
///
/// `on_retry` runs before each backoff sleep, for tracing. After
/// `max_retries + 1` failed attempts the last error is returned.
///
/// # Errors
///
/// Propagates the first non-retryable error immediately, or the last
/// retryable error once the budget is spent.
pub async fn with_backoff<T, Fut>(
    policy: RetryPolicy,
    mut make_call: impl FnMut() -> Fut,
    mut on_retry: impl FnMut(),
    label: &str,
) -> EkpResult<T>
where
    Fut: Future<Output = EkpResult<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt: u32 = 0;

    loop {
        match make_call().await {
            Ok(reply) => return Ok(reply),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                debug!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "KMS call failed; backing off"
                );
                on_retry();
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use ekp_common::EkpError;

    fn test_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let result = with_backoff(
            test_policy(5),
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n <= 2 {
                        Err(EkpError::TimedOut)
                    } else {
                        Ok(n)
                    }
                }
            },
            || {},
            "test",
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_then_propagates() {
        let calls = Cell::new(0u32);
        let retries = Cell::new(0u32);
        let result: EkpResult<()> = with_backoff(
            test_policy(3),
            || {
                calls.set(calls.get() + 1);
                async { Err(EkpError::TimedOut) }
            },
            || retries.set(retries.get() + 1),
            "test",
        )
        .await;
        assert_eq!(result, Err(EkpError::TimedOut));
        // max_retries + 1 total attempts.
        assert_eq!(calls.get(), 4);
        assert_eq!(retries.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_propagates_immediately() {
        let calls = Cell::new(0u32);
        let result: EkpResult<()> = with_backoff(
            test_policy(5),
            || {
                calls.set(calls.get() + 1);
                async { Err(EkpError::KeysFetchFailed) }
            },
            || panic!("on_retry must not run for non-retryable errors"),
            "test",
        )
        .await;
        assert_eq!(result, Err(EkpError::KeysFetchFailed));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_grows_geometrically_up_to_the_cap() {
        let start = tokio::time::Instant::now();
        let _: EkpResult<()> = with_backoff(
            test_policy(4),
            || async { Err(EkpError::ConnectionFailed) },
            || {},
            "test",
        )
        .await;
        // 10 + 20 + 40 + 40 (capped) milliseconds of backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(110));
    }
}

//! Dial retry with exponential backoff and jitter.

use netron_types::config::ConnectConfig;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Minimum delay between retries in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    ///
    /// The actual sleep is `delay * (1 + random_fraction * jitter)`, where
    /// `random_fraction` is in `[0, 1)`.
    pub jitter: f64,
}

impl RetryConfig {
    /// Dial policy: one first try plus `reconnects` retries.
    pub fn for_connect(reconnects: u32, connect: &ConnectConfig) -> Self {
        Self {
            max_attempts: reconnects.saturating_add(1),
            min_delay_ms: connect.min_delay_ms,
            max_delay_ms: connect.max_delay_ms,
            jitter: connect.jitter,
        }
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// The successful result.
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// All retries exhausted without success.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
}

/// Compute the delay before retry `attempt` (0-indexed).
///
/// Formula: `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`,
/// clamped to `max_delay`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);

    if config.jitter <= 0.0 {
        return capped;
    }

    let frac: f64 = rand::random();
    let with_jitter = (capped as f64) * (1.0 + frac * config.jitter);
    (with_jitter as u64).min(config.max_delay_ms)
}

/// Execute an async operation with retry.
///
/// `on_retry(n, delay_ms)` is called before the `n`-th retry (1-based) sleeps.
pub async fn retry_async<F, Fut, T, E, R>(
    config: &RetryConfig,
    mut operation: F,
    mut on_retry: R,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    R: FnMut(u32, u64),
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempt = attempt + 1,
                        "retry succeeded after {} previous failures", attempt
                    );
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                if attempt + 1 >= max {
                    if max > 1 {
                        warn!(max_attempts = max, "all retry attempts exhausted: {err}");
                    }
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }

                let delay_ms = compute_backoff(config, attempt);
                attempt += 1;
                debug!(attempt, delay_ms, "retrying after error: {err}");
                on_retry(attempt, delay_ms);
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            min_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: 0.0,
        };
        assert_eq!(compute_backoff(&config, 0), 100);
        assert_eq!(compute_backoff(&config, 1), 200);
        assert_eq!(compute_backoff(&config, 3), 800);
        assert_eq!(compute_backoff(&config, 4), 1000);
        assert_eq!(compute_backoff(&config, 63), 1000);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = RetryConfig {
            max_attempts: 2,
            min_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = compute_backoff(&config, 0);
            assert!((100..=150).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_for_connect() {
        let config = RetryConfig::for_connect(4, &ConnectConfig::default());
        assert_eq!(config.max_attempts, 5);
        assert_eq!(RetryConfig::for_connect(0, &ConnectConfig::default()).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_reports_each_retry() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let outcome: RetryOutcome<(), String> = retry_async(
            &fast(5),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("refused".to_string()) }
            },
            |n, _| retries.push(n),
        )
        .await;
        match outcome {
            RetryOutcome::Exhausted { last_error, attempts } => {
                assert_eq!(last_error, "refused");
                assert_eq!(attempts, 5);
            }
            RetryOutcome::Success { .. } => panic!("should not succeed"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(retries, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<u32, String> = retry_async(
            &fast(3),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
            |_, _| {},
        )
        .await;
        match outcome {
            RetryOutcome::Success { result, attempts } => {
                assert_eq!(result, 2);
                assert_eq!(attempts, 3);
            }
            RetryOutcome::Exhausted { .. } => panic!("should succeed"),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_never_retries() {
        let mut retried = false;
        let outcome: RetryOutcome<(), String> =
            retry_async(&fast(1), || async { Err("x".to_string()) }, |_, _| retried = true)
                .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert!(!retried);
    }
}

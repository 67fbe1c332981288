//! # Bounded Retry with Backoff
//!
//! Retry helper for data-plane calls that may fail transiently while the
//! cluster is churning (a node still warming up, a peer connection being
//! re-established, content still syncing).
//!
//! ## Design
//!
//! - Bounded: at most `max_attempts` calls, never unbounded polling
//! - Exponential backoff: `delay = initial_delay * multiplier^(attempt-1)`,
//!   clamped to `max_delay`
//! - The caller decides what is retryable through a predicate on the typed
//!   error; everything else short-circuits immediately
//! - Deterministic: no jitter from a random source, so runs with the same
//!   seed make the same number of calls against healthy nodes
//!
//! Membership operations never go through this helper. A timeout there is
//! surfaced immediately so the stage can be aborted.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

// ════════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════════

/// Configuration for retry-with-backoff behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Multiplicative factor applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fixed delay between a fixed number of attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Effective attempt bound.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryResult<T, E> {
    /// The operation succeeded.
    Success {
        value: T,
        /// Number of attempts made (1 = succeeded on first try).
        attempts: u32,
    },
    /// All attempts were used, or the error was not retryable.
    Exhausted {
        last_error: E,
        attempts: u32,
    },
}

impl<T, E> RetryResult<T, E> {
    /// Collapse into a plain `Result`, dropping the attempt count.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success { value, .. } => Ok(value),
            RetryResult::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryResult::Success { attempts, .. } | RetryResult::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// DELAY COMPUTATION
// ════════════════════════════════════════════════════════════════════════════════

/// Delay to wait after the given (1-indexed) failed attempt.
///
/// `min(initial_delay * multiplier^(attempt-1), max_delay)`; NaN, negative
/// and infinite intermediate values clamp into `[0, max_delay]`.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let max = config.max_delay.as_secs_f64();

    let clamped = if base.is_nan() || base < 0.0 {
        0.0
    } else if base > max {
        max
    } else {
        base
    };

    Duration::from_secs_f64(clamped).min(config.max_delay)
}

// ════════════════════════════════════════════════════════════════════════════════
// RETRY LOOP
// ════════════════════════════════════════════════════════════════════════════════

/// Run `operation` until it succeeds, the error is not retryable, or the
/// attempt budget is spent.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    is_retryable: P,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max = config.attempts();
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);

        match operation().await {
            Ok(value) => return RetryResult::Success { value, attempts },
            Err(e) => {
                if !is_retryable(&e) || attempts >= max {
                    return RetryResult::Exhausted {
                        last_error: e,
                        attempts,
                    };
                }

                let delay = compute_delay(config, attempts);
                debug!(attempt = attempts, max, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::fixed(max_attempts, Duration::ZERO)
    }

    fn transient(e: &String) -> bool {
        e.contains("timeout")
    }

    #[tokio::test]
    async fn success_without_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&fast_config(3), transient, || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok::<i32, String>(42) }
        })
        .await;

        assert_eq!(result, RetryResult::Success { value: 42, attempts: 1 });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&fast_config(5), transient, || {
            let count = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err::<&str, String>("connection timeout".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, RetryResult::Success { value: "done", attempts: 3 });
    }

    #[tokio::test]
    async fn budget_is_bounded() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&fast_config(4), transient, || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), String>("timeout".to_string()) }
        })
        .await;

        assert_eq!(result.attempts(), 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(result.into_result(), Err("timeout".to_string()));
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&fast_config(10), transient, || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), String>("not found".to_string()) }
        })
        .await;

        assert_eq!(result.attempts(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_calls_once() {
        let result = retry_with_backoff(&fast_config(0), transient, || async {
            Ok::<u8, String>(1)
        })
        .await;
        assert_eq!(result.attempts(), 1);
    }

    #[test]
    fn delay_grows_and_clamps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };
        assert_eq!(compute_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(compute_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(compute_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(compute_delay(&config, 4), Duration::from_millis(500));
        assert_eq!(compute_delay(&config, 50), Duration::from_millis(500));
    }

    #[test]
    fn delay_nan_multiplier_is_zero() {
        let config = RetryConfig {
            backoff_multiplier: f64::NAN,
            ..RetryConfig::default()
        };
        assert_eq!(compute_delay(&config, 2), Duration::ZERO);
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential-backoff retry for L2 connection setup and commands.
//!
//! # Example
//!
//! ```
//! use tiered_cache::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, Some(5));
//!
//! // Delay before the second attempt, then doubled per failure
//! let query = RetryConfig::query();
//! assert_eq!(query.delay_before(1), Duration::from_millis(50));
//! assert_eq!(query.delay_before(2), Duration::from_millis(100));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff policy for a retried operation.
///
/// - [`RetryConfig::startup()`]: bounded, for connecting at boot
/// - [`RetryConfig::daemon()`]: unbounded, for background reconnection
/// - [`RetryConfig::query()`]: short, for a single L2 command on the request path
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// 5 attempts, 200ms doubling to 2s. A misconfigured L2 URL fails boot
    /// in a few seconds instead of hanging.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: Some(5),
        }
    }

    /// Unbounded, capped at 5 minutes between attempts.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
            max_attempts: None,
        }
    }

    /// 2 attempts with a 50ms pause. The cache already treats L2 failure as
    /// a miss, so request latency matters more than persistence here.
    #[must_use]
    pub fn query() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
            max_attempts: Some(2),
        }
    }

    /// Single attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            max_attempts: Some(1),
        }
    }

    /// Pause before attempt `failures + 1`, given `failures >= 1` so far.
    #[must_use]
    pub fn delay_before(&self, failures: usize) -> Duration {
        let exp = failures.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, failures: usize) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Run `operation` until it succeeds or the policy gives up, returning the
/// last error in that case.
pub async fn retry<F, Fut, T, E>(name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0usize;

    loop {
        match operation().await {
            Ok(value) => {
                if failures > 0 {
                    info!(operation = name, failures, "Operation recovered after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                failures += 1;
                if config.exhausted(failures) {
                    warn!(operation = name, attempts = failures, error = %e, "Giving up");
                    return Err(e);
                }

                let delay = config.delay_before(failures);
                warn!(
                    operation = name,
                    attempt = failures,
                    max_attempts = ?config.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast(max: usize) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts: Some(max),
        }
    }

    fn flaky(succeed_on: usize) -> (Arc<AtomicUsize>, impl FnMut() -> futures::future::Ready<Result<u32, String>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let op = move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            futures::future::ready(if n >= succeed_on {
                Ok(7)
            } else {
                Err(format!("attempt {n} failed"))
            })
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_try() {
        let (calls, op) = flaky(1);
        assert_eq!(retry("op", &fast(3), op).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers() {
        let (calls, op) = flaky(3);
        assert_eq!(retry("op", &fast(3), op).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_error() {
        let (calls, op) = flaky(10);
        let err = retry("op", &fast(3), op).await.unwrap_err();
        assert_eq!(err, "attempt 3 failed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_none_is_single_attempt() {
        let (calls, op) = flaky(2);
        assert!(retry("op", &RetryConfig::none(), op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            factor: 2.0,
            max_attempts: None,
        };
        assert_eq!(config.delay_before(1), Duration::from_millis(100));
        assert_eq!(config.delay_before(2), Duration::from_millis(200));
        assert_eq!(config.delay_before(3), Duration::from_millis(350));
        assert_eq!(config.delay_before(40), Duration::from_millis(350));
    }

    #[test]
    fn test_presets() {
        assert_eq!(RetryConfig::startup().max_attempts, Some(5));
        assert_eq!(RetryConfig::daemon().max_attempts, None);
        assert_eq!(RetryConfig::query().max_attempts, Some(2));
    }
}

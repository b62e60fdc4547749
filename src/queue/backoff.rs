// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry backoff policy with full jitter.
//!
//! The sync queue retries transient delivery failures with exponential
//! backoff: base delay 1s, doubling per attempt, capped at 5 minutes, with
//! full jitter so a fleet of reconnecting devices does not thundering-herd
//! the server.
//!
//! # Example
//!
//! ```
//! use study_sync::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::default();
//! assert_eq!(policy.raw_delay(1), Duration::from_secs(1));
//! assert_eq!(policy.raw_delay(2), Duration::from_secs(2));
//! // Jittered delay never exceeds the deterministic ceiling
//! assert!(policy.delay_for(4) <= policy.raw_delay(4));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::EngineConfig;

/// Exponential backoff configuration for transient failures.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Total delivery attempts before giving up (failed-terminal)
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(300), // 5 minutes
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            factor: config.backoff_factor,
            cap: Duration::from_millis(config.backoff_cap_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Fast-fail policy for startup work (store connect, schema init).
    #[must_use]
    pub fn startup() -> Self {
        Self {
            base: Duration::from_millis(200),
            factor: 2.0,
            cap: Duration::from_secs(2),
            max_attempts: 5,
        }
    }

    /// Minimal delays for tests.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            base: Duration::from_millis(1),
            factor: 2.0,
            cap: Duration::from_millis(10),
            max_attempts: 3,
        }
    }

    /// Deterministic (pre-jitter) delay before retry `attempt` (1-based).
    #[must_use]
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.cap);
        }
        delay.min(self.cap)
    }

    /// Full-jitter delay: uniform over `[0, raw_delay(attempt)]`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.raw_delay(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Whether the attempt budget is spent.
    #[must_use]
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Retry an async operation under a policy, sleeping a jittered backoff
/// between attempts. Used for local startup work; the sync queue drives its
/// own per-mutation retry state machine instead.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &BackoffPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;
    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(
                        operation = operation_name,
                        attempts, "operation succeeded after retries"
                    );
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if policy.exhausted(attempts) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempts);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = policy.max_attempts,
                    error = %err,
                    ?delay,
                    "operation failed, retrying"
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

    #[test]
    fn test_raw_delay_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.raw_delay(1), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(2), Duration::from_secs(2));
        assert_eq!(policy.raw_delay(3), Duration::from_secs(4));
        assert_eq!(policy.raw_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_raw_delay_caps_at_five_minutes() {
        let policy = BackoffPolicy::default();
        // 2^20 seconds would be ~12 days uncapped
        assert_eq!(policy.raw_delay(20), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_bounded_by_raw_delay() {
        let policy = BackoffPolicy::default();
        for attempt in 1..6 {
            for _ in 0..50 {
                assert!(policy.delay_for(attempt) <= policy.raw_delay(attempt));
            }
        }
    }

    #[test]
    fn test_exhausted() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(!policy.exhausted(0));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn test_from_config() {
        let config = EngineConfig {
            backoff_base_ms: 500,
            backoff_factor: 3.0,
            backoff_cap_ms: 10_000,
            max_attempts: 4,
            ..Default::default()
        };
        let policy = BackoffPolicy::from_config(&config);
        assert_eq!(policy.base, Duration::from_millis(500));
        assert_eq!(policy.raw_delay(2), Duration::from_millis(1_500));
        assert_eq!(policy.cap, Duration::from_secs(10));
        assert_eq!(policy.max_attempts, 4);
    }

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> =
            retry("op", &BackoffPolicy::test(), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<i32, TestError> = retry("op", &BackoffPolicy::test(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                    Err(TestError("not yet".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<i32, TestError> = retry("op", &BackoffPolicy::test(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}

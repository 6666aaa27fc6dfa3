//! Bounded exponential backoff for remote operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use scanroute_core::{PipelineError, PipelineResult};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry settings injected into the uploader.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Fraction of the delay added at random (0.0 disables jitter).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy with the default 20% jitter.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.2,
        }
    }

    /// Policy that retries immediately, for tests and local adapters.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let spread = backoff.mul_f64(self.jitter.min(1.0));
        let extra = rand::rng().random_range(Duration::ZERO..=spread);
        backoff.saturating_add(extra).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the ceiling is reached.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or
    /// [`PipelineError::AttemptsExhausted`] wrapping the last transient one.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        self.run_observed(operation, &CancellationToken::new(), |_, _| {}, op)
            .await
    }

    /// Like [`RetryPolicy::run`], reporting each retry and honouring cancellation
    /// while waiting between attempts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] when `cancel` fires during a backoff.
    pub async fn run_observed<T, F, Fut, R>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut on_retry: R,
        mut op: F,
    ) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
        R: FnMut(u32, &PipelineError),
    {
        let ceiling = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= ceiling {
                return Err(PipelineError::AttemptsExhausted {
                    operation,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = self.delay_for(attempt);
            warn!(
                operation,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err.detail(),
                "retrying transient failure"
            );
            on_retry(attempt, &err);
            tokio::select! {
                () = cancel.cancelled() => return Err(PipelineError::Cancelled { operation }),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn three_transient_failures_exhaust_a_ceiling_of_three() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(3);
        let counter = Arc::clone(&calls);
        let result: PipelineResult<()> = policy
            .run("put_file", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::transient("put_file", "timeout"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            result,
            Err(PipelineError::AttemptsExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn success_after_retry_returns_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let seen = Arc::clone(&retries);
        let result = RetryPolicy::immediate(5)
            .run_observed(
                "exists",
                &CancellationToken::new(),
                move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(PipelineError::transient("exists", "reset"))
                        } else {
                            Ok(42)
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: PipelineResult<()> = RetryPolicy::immediate(5)
            .run("search", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::unavailable("search", "401"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(PipelineError::RemoteUnavailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_between_attempts() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10))
        };
        let started = tokio::time::Instant::now();
        let result: PipelineResult<()> = policy
            .run("put_file", || async {
                Err(PipelineError::transient("put_file", "timeout"))
            })
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::AttemptsExhausted { attempts: 3, .. })
        ));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3), "{waited:?}");
        assert!(waited < Duration::from_secs(4), "{waited:?}");
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let result: PipelineResult<()> = policy
            .run_observed("put_file", &cancel, |_, _| {}, || async {
                Err(PipelineError::transient("put_file", "timeout"))
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled { .. })));
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1_000))
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(120));
        }
    }
}

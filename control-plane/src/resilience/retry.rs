//! Bounded retry with exponential backoff and jitter.
//!
//! ```text
//! attempt 0: call
//! attempt 1: wait min(initial × base^0, max) × jitter, call
//! attempt 2: wait min(initial × base^1, max) × jitter, call
//! ...
//! last attempt fails → RetriesExhausted(last error)
//! ```
//!
//! Each attempt runs under a per-call deadline; a missed deadline is a
//! [`CallError::Timeout`]. The executor knows nothing about circuit state.
//! Wrap it in a breaker with [`guarded_call`], never the other way round.

use crate::error::{CallError, ControlPlaneError, ControlPlaneResult};
use crate::resilience::circuit_breaker::CircuitBreaker;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Backoff multiplier (e.g. 2.0 for doubling).
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after failed attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay actually slept, with jitter applied when enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if self.jitter {
            base.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            base
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Runs an operation under a [`RetryPolicy`] with per-attempt deadlines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryExecutor {
    pub policy: RetryPolicy,
    /// Deadline for each individual attempt.
    pub call_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            policy,
            call_timeout,
        }
    }

    /// Call `op` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// `op` receives the 0-indexed attempt number. On cancellation the
    /// executor stops at once and returns [`ControlPlaneError::Cancelled`]
    /// carrying the last error seen.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> ControlPlaneResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<CallError> = None;
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ControlPlaneError::Cancelled {
                    attempts: attempt,
                    last_error,
                });
            }

            let timeout = self.call_timeout;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ControlPlaneError::Cancelled {
                        attempts: attempt + 1,
                        last_error,
                    });
                }
                result = tokio::time::timeout(timeout, op(attempt)) => {
                    result.unwrap_or(Err(CallError::Timeout(timeout)))
                }
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= max_attempts {
                tracing::warn!(
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(ControlPlaneError::RetriesExhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.policy.backoff(attempt - 1);
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                timeout = error.is_timeout(),
                error = %error,
                "Call failed, retrying"
            );
            last_error = Some(error);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ControlPlaneError::Cancelled {
                        attempts: attempt,
                        last_error,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Breaker wraps retry wraps the raw call.
///
/// An open circuit short-circuits before any retry delay; a whole retried
/// sequence counts as one breaker outcome.
pub async fn guarded_call<T, F, Fut>(
    breaker: &CircuitBreaker,
    executor: &RetryExecutor,
    cancel: &CancellationToken,
    op: F,
) -> ControlPlaneResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    breaker
        .call(|| executor.execute(cancel, op))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{BreakerSettings, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_delay_sequence_without_jitter() {
        let p = policy(10, false);
        let delays: Vec<u64> = (0..8).map(|n| p.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(p.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_saturates_on_huge_attempts() {
        let p = policy(10, false);
        assert_eq!(p.delay_for(10_000), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy(10, true);
        for n in 0..6 {
            let base = p.delay_for(n);
            for _ in 0..50 {
                let d = p.backoff(n);
                assert!(d <= base);
                assert!(d >= base.mul_f64(0.5));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let exec = RetryExecutor::new(policy(3, false), Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        let result = exec
            .execute(&cancel, move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CallError::backend("503"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let exec = RetryExecutor::new(policy(3, false), Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let err = exec
            .execute(&cancel, |n| async move {
                Err::<(), _>(CallError::backend(format!("fail {}", n)))
            })
            .await
            .unwrap_err();

        match err {
            ControlPlaneError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, CallError::backend("fail 2"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_tagged() {
        let exec = RetryExecutor::new(policy(2, false), Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let err = exec
            .execute(&cancel, |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, CallError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.code(), "RETRIES_EXHAUSTED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let exec = RetryExecutor::new(policy(5, false), Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = exec
            .execute(&cancel, |_| async { Err::<(), _>(CallError::backend("down")) })
            .await
            .unwrap_err();

        match err {
            ControlPlaneError::Cancelled {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(last_error, Some(CallError::backend("down")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_call() {
        let exec = RetryExecutor::new(policy(3, false), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let err = exec
            .execute(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CallError>(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_retries() {
        let breaker = CircuitBreaker::new(
            "cloud",
            BreakerSettings {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(600),
            },
        );
        let exec = RetryExecutor::new(policy(3, false), Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let first = guarded_call(&breaker, &exec, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(CallError::backend("boom")) }
        })
        .await
        .unwrap_err();
        assert_eq!(first.code(), "RETRIES_EXHAUSTED");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // One exhausted sequence is one breaker failure
        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        let start = tokio::time::Instant::now();
        let second = guarded_call(&breaker, &exec, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, CallError>(()) }
        })
        .await
        .unwrap_err();
        assert_eq!(second.code(), "CIRCUIT_OPEN");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_not_counted_by_breaker() {
        let breaker = CircuitBreaker::new(
            "local",
            BreakerSettings {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(600),
            },
        );
        let exec = RetryExecutor::new(policy(3, false), Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = guarded_call(&breaker, &exec, &cancel, |_| async {
            Err::<(), _>(CallError::backend("x"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}

//! Retrying invoker
//!
//! Wraps one logical collaborator call with bounded attempts, a per-attempt
//! deadline and exponential backoff. The circuit breaker is consulted before every
//! attempt; an open circuit ends the call immediately.

use moodpulse_common::config::ResilienceConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::circuit_breaker::{CallOutcome, CircuitBreaker};
use crate::error::{PipelineError, PipelineResult};

/// Attempt and backoff limits for one logical call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Deadline for each individual attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_initial: Duration::from_secs(config.backoff_initial_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
            attempt_timeout: config.stage_timeout(),
        }
    }

    /// Delay after the given failed attempt (1-based): initial, doubled, ..., capped
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_initial
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

/// Retries transient failures of collaborator calls
#[derive(Clone)]
pub struct RetryingInvoker {
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryingInvoker {
    pub fn new(breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self {
            breaker,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort attempts and backoff sleeps once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` against `collaborator` with retries
    ///
    /// Only `TransientIo` is retried (attempt timeouts become `TransientIo`).
    /// Every other error returns at once; after the last attempt the final
    /// transient error is returned.
    pub async fn invoke<F, Fut, T>(&self, collaborator: &str, mut operation: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let permit = self.breaker.try_acquire(collaborator)?;

            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
                timed = tokio::time::timeout(self.policy.attempt_timeout, operation()) => {
                    timed.unwrap_or_else(|_| {
                        Err(PipelineError::TransientIo(format!(
                            "{} call timed out after {:?}",
                            collaborator, self.policy.attempt_timeout
                        )))
                    })
                }
            };
            permit.settle(CallOutcome::of(&result));

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(collaborator = %collaborator, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() || attempt >= self.policy.max_attempts {
                if err.is_transient() {
                    warn!(
                        collaborator = %collaborator,
                        attempts = attempt,
                        error = %err,
                        "Retries exhausted"
                    );
                }
                return Err(err);
            }

            let delay = self.policy.backoff_after(attempt);
            warn!(
                collaborator = %collaborator,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn invoker(fail_max: u32) -> RetryingInvoker {
        let breaker = Arc::new(CircuitBreaker::new(fail_max, Duration::from_secs(60)));
        RetryingInvoker::new(breaker, RetryPolicy::default())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(8));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(10));
        assert_eq!(policy.backoff_after(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retried_until_success() {
        let invoker = invoker(5);
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = invoker
            .invoke("fetch", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::TransientIo("connection reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 4s + 8s of backoff
        assert!(started.elapsed() >= Duration::from_secs(12));
        assert!(started.elapsed() < Duration::from_secs(13));
        assert_eq!(invoker.breaker().failure_count("fetch"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let invoker = invoker(10);
        let calls = &AtomicU32::new(0);

        let result: PipelineResult<()> = invoker
            .invoke("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::TransientIo("timeout".into()))
            })
            .await;

        assert!(matches!(result, Err(PipelineError::TransientIo(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(invoker.breaker().failure_count("fetch"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let invoker = invoker(5);
        let calls = &AtomicU32::new(0);

        let result: PipelineResult<()> = invoker
            .invoke("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Permanent("malformed entity".into()))
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_aborts_without_calling() {
        let invoker = invoker(2);
        let calls = &AtomicU32::new(0);

        // Two transient failures open the circuit mid-retry
        let result: PipelineResult<()> = invoker
            .invoke("classify", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::TransientIo("unreachable".into()))
            })
            .await;

        assert!(matches!(result, Err(PipelineError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(invoker.breaker().state("classify"), CircuitState::Open);

        let result: PipelineResult<()> = invoker
            .invoke("classify", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(PipelineError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
        let policy = RetryPolicy {
            max_attempts: 1,
            attempt_timeout: Duration::from_secs(2),
            ..RetryPolicy::default()
        };
        let invoker = RetryingInvoker::new(breaker, policy);

        let result: PipelineResult<()> = invoker
            .invoke("fetch", move || async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PipelineError::TransientIo(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let invoker = invoker(5).with_cancellation(cancel.clone());

        let task = tokio::spawn(async move {
            invoker
                .invoke("fetch", move || async move {
                    Err::<(), _>(PipelineError::TransientIo("reset".into()))
                })
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}

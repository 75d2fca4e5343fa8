//! Guards around calls to the sandbox service: a per-call deadline, bounded
//! retries with exponential backoff, and a breaker shared by every attempt
//! that goes through one client.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{SandboxError, SandboxResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionControls {
    /// Deadline for one submit call (milliseconds).
    pub timeout_ms: u64,
    /// Extra submits after the first one fails transiently.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff_base_ms * 2^(n-1)`.
    pub backoff_base_ms: u64,
    /// Consecutive transient failures after which submits are refused.
    pub breaker_threshold: u32,
}

impl Default for ExecutionControls {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            backoff_base_ms: 500,
            breaker_threshold: 5,
        }
    }
}

impl ExecutionControls {
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Counts consecutive transient failures of the sandbox service.
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn is_open(&self) -> bool {
        self.failures.load(Ordering::Relaxed) >= self.threshold
    }

    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    fn refusal(&self) -> SandboxError {
        SandboxError::CircuitBreakerOpen {
            consecutive_failures: self.failure_count(),
            threshold: self.threshold,
        }
    }
}

/// Drive `call` until it succeeds, fails permanently, or runs out of retries.
///
/// Errors for which [`SandboxError::is_transient`] is false are returned as
/// they are, without a retry and without counting against the breaker.
pub async fn execute_with_controls<T, F, Fut>(
    controls: &ExecutionControls,
    breaker: &CircuitBreaker,
    call: F,
) -> SandboxResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = SandboxResult<T>>,
{
    let deadline = Duration::from_millis(controls.timeout_ms);
    let attempts = controls.max_retries + 1;
    let mut last = None;

    for attempt in 1..=attempts {
        if breaker.is_open() {
            return Err(breaker.refusal());
        }
        let error = match tokio::time::timeout(deadline, call()).await {
            Ok(Ok(value)) => {
                breaker.record_success();
                return Ok(value);
            }
            Ok(Err(e)) if !e.is_transient() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => SandboxError::Timeout {
                elapsed_ms: controls.timeout_ms,
                limit_ms: controls.timeout_ms,
            },
        };
        breaker.record_failure();

        if attempt < attempts {
            let delay = controls.backoff(attempt);
            warn!(attempt, error = %error, delay_ms = delay.as_millis() as u64, "sandbox submit failed, retrying");
            tokio::time::sleep(delay).await;
        }
        last = Some(error);
    }

    match last {
        Some(SandboxError::Timeout { .. }) if attempts == 1 => Err(SandboxError::Timeout {
            elapsed_ms: controls.timeout_ms,
            limit_ms: controls.timeout_ms,
        }),
        Some(error) => Err(SandboxError::ExecutionFailed {
            attempts,
            reason: error.to_string(),
        }),
        None => Err(breaker.refusal()),
    }
}

//! Failure classification and bounded retries for collaborator calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

use crate::error::StepError;

/// Result of a single collaborator attempt.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Retryable(String),
    Fatal(StepError),
}

impl<T> From<Result<T, StepError>> for Outcome<T> {
    fn from(result: Result<T, StepError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) if err.is_retryable() => Self::Retryable(err.to_string()),
            Err(err) => Self::Fatal(err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempt(s): {last_reason}")]
    Exhausted { attempts: u32, last_reason: String },
    #[error(transparent)]
    Fatal(StepError),
}

/// Fixed-delay retry policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `op` until it succeeds, fails fatally, or runs out of attempts.
    /// `unit` and `op_name` only feed the log trail.
    pub async fn run<T, F, Fut>(&self, op_name: &str, unit: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut last_reason = String::new();
        for attempt in 1..=self.max_attempts {
            match Outcome::from(op().await) {
                Outcome::Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(op = op_name, unit, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Outcome::Fatal(err) => {
                    tracing::warn!(op = op_name, unit, attempt, reason = %err, "fatal failure; not retrying");
                    return Err(RetryError::Fatal(err));
                }
                Outcome::Retryable(reason) => {
                    tracing::warn!(
                        op = op_name,
                        unit,
                        attempt,
                        attempts = self.max_attempts,
                        %reason,
                        "transient failure"
                    );
                    last_reason = reason;
                    if attempt < self.max_attempts && !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        tracing::warn!(
            op = op_name,
            unit,
            attempts = self.max_attempts,
            reason = %last_reason,
            "retries exhausted"
        );
        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            last_reason,
        })
    }
}

/// Delay applied once every extraction backend reported a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitBackoff {
    pub base: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl RateLimitBackoff {
    /// `base * 2^(rate_limited - 1)`, capped at `max`, plus jitter.
    pub fn delay(&self, rate_limited: u32) -> Duration {
        let exponent = rate_limited.saturating_sub(1).min(16);
        let scaled = self.base.saturating_mul(1u32 << exponent).min(self.max);
        scaled + jitter(self.max_jitter)
    }
}

/// Uniform random delay in `0..=max`, so concurrent runs retrying the same
/// unit do not wake up together.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

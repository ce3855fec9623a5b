//! Explicit retry policies.
//!
//! Two layers use this module:
//! - the orchestrator retries a whole fetch → parse → store sequence
//!   ([`RetryPolicy::orchestrator`]: 5 attempts, 2s base, 30s cap)
//! - adapters retry single network calls inside `fetch`
//!   ([`RetryPolicy::network`]: 3 attempts, 1s base, 30s cap)
//!
//! Both use exponential backoff with full jitter and only retry errors the
//! policy's predicate accepts (by default [`HarvestError::is_transient`]).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::traits::HarvestError;

/// Serializable retry parameters, as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::orchestrator()
    }
}

impl RetrySettings {
    pub fn orchestrator() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }

    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// Backoff policy with a retryable-error predicate.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,

    /// Full jitter: the actual delay is uniform in `[0, backoff]`
    pub jitter: bool,

    pub retryable: fn(&HarvestError) -> bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
            retryable: HarvestError::is_transient,
        }
    }

    pub fn orchestrator() -> Self {
        Self::from_settings(&RetrySettings::orchestrator())
    }

    pub fn network() -> Self {
        Self::from_settings(&RetrySettings::network())
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::immediate(1)
        }
    }

    /// Retries without sleeping. Meant for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            retryable: HarvestError::is_transient,
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter && !backoff.is_zero() {
            let millis = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64);
            Duration::from_millis(millis)
        } else {
            backoff
        }
    }

    /// Whether a failure on attempt `attempt` (1-based) should be retried.
    pub fn should_retry(&self, error: &HarvestError, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.retryable)(error)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are exhausted. The last error is returned.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if self.should_retry(&err, attempt) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

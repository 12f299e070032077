//! Exponential backoff and the retry driver shared by the supervisors and
//! the publish path.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RideMeshError, Result};

/// Retry tuning for one call site
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
}

impl RetryPolicy {
    pub const fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Reconnecting to the broker: 10 attempts, 1s doubling up to 30s
    pub const fn connection() -> Self {
        Self::new(10, Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }

    /// Recreating a channel on a live connection: 5 attempts, 1s doubling up to 10s
    pub const fn channel() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(10), 2.0)
    }

    /// A single publish: 3 attempts, 100ms doubling up to 2s
    pub const fn publish() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(2), 2.0)
    }

    /// `min(initial * multiplier^attempt, max)`, saturating instead of overflowing.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Sum of every sleep the driver can perform before giving up
    pub fn total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay(attempt))
            .sum()
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RideMeshError::config_error(format!(
                "{name}: max_attempts must be at least 1"
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RideMeshError::config_error(format!(
                "{name}: multiplier must be a finite value >= 1.0"
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(RideMeshError::config_error(format!(
                "{name}: initial_delay exceeds max_delay"
            )));
        }
        Ok(())
    }
}

/// Run `op` under `policy`.
///
/// Each attempt and each sleep is raced against `cancel`; cancellation drops
/// the in-flight attempt and returns [`RideMeshError::Cancelled`]. Errors that
/// are not [recoverable](RideMeshError::is_recoverable) stop the loop at once
/// and are returned unwrapped.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RideMeshError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RideMeshError::Cancelled),
            outcome = op(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempts = attempt + 1, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if !e.is_recoverable() => return Err(e),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= policy.max_attempts {
            return Err(RideMeshError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempt,
                source: Box::new(error),
            });
        }

        let delay = policy.delay(attempt - 1);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RideMeshError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns false when cancelled.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Serde adapter reading durations as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

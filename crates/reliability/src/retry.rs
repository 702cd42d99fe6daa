//! Retry with a fixed backoff table.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::classify::{ClassifiedError, classify};

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{label} failed with a non-retryable {} error: {error}", .classified.kind)]
    NonRetryable {
        label: String,
        classified: ClassifiedError,
        error: E,
    },

    #[error("{label} failed after {attempts} attempt(s): {error}")]
    Exhausted {
        label: String,
        attempts: u32,
        classified: ClassifiedError,
        error: E,
    },
}

impl<E> RetryError<E> {
    pub fn classified(&self) -> &ClassifiedError {
        match self {
            Self::NonRetryable { classified, .. } | Self::Exhausted { classified, .. } => classified,
        }
    }

    /// The error from the final attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::NonRetryable { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }
}

/// Delay before retry number `attempt` (0-based), clamped to the last entry.
pub(crate) fn backoff_delay(delays: &[Duration], attempt: u32) -> Duration {
    let idx = (attempt as usize).min(delays.len().saturating_sub(1));
    delays.get(idx).copied().unwrap_or_default()
}

/// Run `operation` up to `max_attempts` times (at least once).
///
/// Every failure is classified; a non-retryable classification stops at
/// once. Retryable failures sleep for the table entry of their attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut operation: F,
    label: &str,
    max_attempts: u32,
    delays: &[Duration],
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let classified = classify(&error);
        if !classified.retryable {
            debug!(label, kind = %classified.kind, error = %error, "Non-retryable failure");
            return Err(RetryError::NonRetryable {
                label: label.to_string(),
                classified,
                error,
            });
        }
        if attempt >= max_attempts {
            warn!(label, attempts = attempt, error = %error, "Retries exhausted");
            return Err(RetryError::Exhausted {
                label: label.to_string(),
                attempts: attempt,
                classified,
                error,
            });
        }

        let delay = backoff_delay(delays, attempt - 1);
        warn!(
            label,
            attempt,
            max_attempts,
            kind = %classified.kind,
            delay_ms = delay.as_millis() as u64,
            "Retryable failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::context::CallContext;
use crate::error::{Classify, ErrorClass};

/// Why a retried call gave up.
///
/// Both `NonRetryable` and `Exhausted` carry the last error; they are kept
/// apart because operators alert on them differently.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("non-retryable failure on attempt {attempts}: {source}")]
    NonRetryable { attempts: u32, source: E },

    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    /// Number of attempts actually made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NonRetryable { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last error returned by the operation, if any attempt ran.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::NonRetryable { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

/// Backoff and retry budget for one dependency class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Error classes worth another attempt.
    pub retry_on: Vec<ErrorClass>,
    /// Add up to 10% random jitter to each delay, never beyond `max_delay_ms`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            retry_on: vec![ErrorClass::Transient, ErrorClass::RateLimited],
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `NonRetryable` errors are never retried, whatever `retry_on` lists.
    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        class != ErrorClass::NonRetryable && self.retry_on.contains(&class)
    }

    /// Delay slept before retry `attempt` (1-based):
    /// `min(base_delay * multiplier^(attempt - 1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() && raw < self.max_delay_ms as f64 {
            raw.max(0.0) as u64
        } else {
            self.max_delay_ms
        };

        let jitter = if self.jitter && capped >= 10 {
            rand::thread_rng().gen_range(0..capped / 10)
        } else {
            0
        };

        Duration::from_millis((capped + jitter).min(self.max_delay_ms))
    }

    /// Full delay sequence, one entry per retry.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// runs out of attempts, or the context is cancelled.
    ///
    /// No delay precedes the first attempt.
    pub async fn run<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        dependency: &str,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if ctx.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: 0,
                last: None,
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(dependency, event = "retry_recovered", attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.class();
            if !self.is_retryable(class) {
                warn!(dependency, event = "retry_aborted", attempt, class = %class, error = %err, "non-retryable failure");
                return Err(RetryError::NonRetryable {
                    attempts: attempt,
                    source: err,
                });
            }
            if attempt > self.max_retries {
                warn!(dependency, event = "retry_exhausted", attempt, class = %class, error = %err, "retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                dependency,
                event = "retry_scheduled",
                attempt,
                max_attempts = self.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );
            if !ctx.sleep(delay).await {
                debug!(dependency, event = "retry_cancelled", attempt, "retry cancelled during backoff");
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last: Some(err),
                });
            }
        }
    }
}

//! Breaker-guarded, retried calls into a dependency.
//!
//! The breaker check runs before any retry attempt, so an open breaker never
//! pays backoff latency. Once admitted, the whole retry sequence reports a
//! single success or failure back to the breaker.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::breaker::{BreakerState, CircuitBreaker};
use super::context::CallContext;
use super::retry::{RetryError, RetryPolicy};
use crate::error::Classify;

#[derive(Debug, Error)]
pub enum ProtectedError<E> {
    /// The breaker is open; the dependency was not called.
    #[error("dependency '{dependency}' unavailable: circuit open (retry in {}ms)", retry_in.as_millis())]
    Unavailable {
        dependency: String,
        retry_in: Duration,
    },

    #[error("'{dependency}' failed after {attempts} attempts (breaker {breaker}): {source}")]
    Exhausted {
        dependency: String,
        attempts: u32,
        breaker: BreakerState,
        source: E,
    },

    #[error("'{dependency}' failed with a non-retryable error on attempt {attempts} (breaker {breaker}): {source}")]
    NonRetryable {
        dependency: String,
        attempts: u32,
        breaker: BreakerState,
        source: E,
    },

    #[error("call to '{dependency}' cancelled after {attempts} attempt(s)")]
    Cancelled {
        dependency: String,
        attempts: u32,
        last: Option<E>,
    },
}

impl<E> ProtectedError<E> {
    pub fn dependency(&self) -> &str {
        match self {
            ProtectedError::Unavailable { dependency, .. }
            | ProtectedError::Exhausted { dependency, .. }
            | ProtectedError::NonRetryable { dependency, .. }
            | ProtectedError::Cancelled { dependency, .. } => dependency,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ProtectedError::Unavailable { .. } => 0,
            ProtectedError::Exhausted { attempts, .. }
            | ProtectedError::NonRetryable { attempts, .. }
            | ProtectedError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProtectedError::Unavailable { .. })
    }

    /// The underlying error from the last attempt, if one ran.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            ProtectedError::Exhausted { source, .. } | ProtectedError::NonRetryable { source, .. } => {
                Some(source)
            }
            ProtectedError::Cancelled { last, .. } => last.as_ref(),
            ProtectedError::Unavailable { .. } => None,
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            ProtectedError::Exhausted { source, .. } | ProtectedError::NonRetryable { source, .. } => {
                Some(source)
            }
            ProtectedError::Cancelled { last, .. } => last,
            ProtectedError::Unavailable { .. } => None,
        }
    }
}

/// How [`ProtectedOperation::execute_batch`] slices its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Items run concurrently within one batch.
    pub batch_size: usize,
    /// Pause between consecutive batches, in milliseconds.
    pub pacing_ms: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            pacing_ms: 0,
        }
    }
}

impl BatchOptions {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

/// A breaker and a retry policy for one dependency. Cheap to clone; clones
/// share the same breaker.
#[derive(Debug, Clone)]
pub struct ProtectedOperation {
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryPolicy>,
}

impl ProtectedOperation {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            breaker,
            retry: Arc::new(retry),
        }
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `work` through the breaker and the retry policy.
    pub async fn execute<T, E, F, Fut>(&self, ctx: &CallContext, work: F) -> Result<T, ProtectedError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let dependency = self.name();
        if let Err(open) = self.breaker.try_acquire() {
            debug!(dependency, event = "rejected", "breaker open, failing fast");
            return Err(ProtectedError::Unavailable {
                dependency: open.dependency,
                retry_in: open.retry_in,
            });
        }

        match self.retry.run(ctx, dependency, work).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(RetryError::Exhausted { attempts, source }) => {
                self.breaker.record_failure();
                Err(ProtectedError::Exhausted {
                    dependency: dependency.to_string(),
                    attempts,
                    breaker: self.breaker.state(),
                    source,
                })
            }
            Err(RetryError::NonRetryable { attempts, source }) => {
                self.breaker.record_failure();
                Err(ProtectedError::NonRetryable {
                    dependency: dependency.to_string(),
                    attempts,
                    breaker: self.breaker.state(),
                    source,
                })
            }
            // The caller gave up; that says nothing about the dependency.
            Err(RetryError::Cancelled { attempts, last }) => Err(ProtectedError::Cancelled {
                dependency: dependency.to_string(),
                attempts,
                last,
            }),
        }
    }

    /// Run `work`; on any failure log it and return the fallback's value.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        ctx: &CallContext,
        work: F,
        fallback: G,
    ) -> T
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(ProtectedError<E>) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.execute(ctx, work).await {
            Ok(value) => value,
            Err(err) => {
                warn!(dependency = self.name(), event = "fallback", attempts = err.attempts(), error = %err, "serving fallback");
                fallback(err).await
            }
        }
    }

    /// Run `work` once per item, `batch_size` items at a time.
    ///
    /// Results come back in input order. A failed item never aborts the
    /// batch; cancellation marks every item not yet started as cancelled.
    pub async fn execute_batch<I, T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        items: &[I],
        options: &BatchOptions,
        work: F,
    ) -> Vec<Result<T, ProtectedError<E>>>
    where
        E: Classify + fmt::Display,
        F: Fn(&I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let batch_size = options.batch_size.max(1);
        let total = items.len().div_ceil(batch_size);
        let mut results = Vec::with_capacity(items.len());

        for (index, batch) in items.chunks(batch_size).enumerate() {
            let paced = index == 0 || options.pacing_ms == 0 || ctx.sleep(options.pacing()).await;
            if !paced || ctx.is_cancelled() {
                debug!(dependency = self.name(), event = "batch_cancelled", batch = index + 1, of = total);
                break;
            }

            debug!(dependency = self.name(), event = "batch", batch = index + 1, of = total, size = batch.len());
            let work = &work;
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|item| self.execute(ctx, move || work(item))),
            )
            .await;
            results.extend(outcomes);
        }

        let remaining = items.len() - results.len();
        results.extend((0..remaining).map(|_| {
            Err(ProtectedError::Cancelled {
                dependency: self.name().to_string(),
                attempts: 0,
                last: None,
            })
        }));
        results
    }
}

//! Per-dependency circuit breaker.
//!
//! ```text
//! Closed   → Open:     failure_count >= failure_threshold
//! Open     → HalfOpen: recovery_timeout elapsed since the last failure (checked on the next call)
//! HalfOpen → Closed:   success_count >= success_threshold
//! HalfOpen → Open:     any failure
//! ```
//!
//! All counters live behind one mutex so a threshold comparison and the
//! counter update it depends on are a single step. The lock is never held
//! across an `.await`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Thresholds for one breaker. Immutable once the breaker is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures in `Closed` that trip the breaker.
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is let through, in milliseconds.
    pub recovery_timeout_ms: u64,
    /// Probe successes in `HalfOpen` needed to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 2,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// The call was rejected without touching the dependency.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker for '{dependency}' is open (retry in {}ms)", retry_in.as_millis())]
pub struct BreakerOpen {
    pub dependency: String,
    pub retry_in: Duration,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] BreakerOpen),

    #[error(transparent)]
    Failed(E),
}

/// Read-only snapshot for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub calls: u64,
    pub failures: u64,
    pub rejections: u64,
    pub trips: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    calls: u64,
    failures: u64,
    rejections: u64,
    trips: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_at: None,
            calls: 0,
            failures: 0,
            rejections: 0,
            trips: 0,
        }
    }

    fn mark_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.success_count = 0;
        self.trips += 1;
        self.mark_failure();
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            calls: inner.calls,
            failures: inner.failures,
            rejections: inner.rejections,
            trips: inner.trips,
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// An `Open` breaker whose recovery timeout has elapsed moves to
    /// `HalfOpen` here and admits the call as a probe.
    pub fn try_acquire(&self) -> Result<(), BreakerOpen> {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            let timeout = self.config.recovery_timeout();
            let elapsed = inner.last_failure.map_or(timeout, |at| at.elapsed());
            if elapsed < timeout {
                inner.rejections += 1;
                return Err(BreakerOpen {
                    dependency: self.name.clone(),
                    retry_in: timeout - elapsed,
                });
            }
            inner.state = BreakerState::HalfOpen;
            inner.success_count = 0;
            info!(dependency = %self.name, event = "breaker_half_open", from = %BreakerState::Open, to = %BreakerState::HalfOpen, "recovery timeout elapsed, probing");
        }
        inner.calls += 1;
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.failure_count = 0;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.success_count = 0;
                    info!(dependency = %self.name, event = "breaker_closed", from = %BreakerState::HalfOpen, to = %BreakerState::Closed, "dependency recovered");
                }
            }
            BreakerState::Open => {
                // Admitted before the trip; does not count as a probe.
                debug!(dependency = %self.name, event = "late_success", "success reported while open");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open();
                    warn!(
                        dependency = %self.name,
                        event = "breaker_open",
                        from = %BreakerState::Closed,
                        to = %BreakerState::Open,
                        failures = inner.failure_count,
                        "failure threshold reached"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.open();
                warn!(dependency = %self.name, event = "breaker_open", from = %BreakerState::HalfOpen, to = %BreakerState::Open, "probe failed");
            }
            BreakerState::Open => inner.mark_failure(),
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        info!(dependency = %self.name, event = "breaker_reset", from = %from, to = %BreakerState::Closed, "breaker reset by operator");
    }

    /// Run `operation` under breaker accounting.
    ///
    /// When the breaker is open the operation is not invoked.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Failed(err))
            }
        }
    }

    /// Like [`execute`](Self::execute), but any error is handed to `fallback`
    /// whose value is returned instead.
    pub async fn execute_or_else<T, E, F, Fut, G, GFut>(&self, operation: F, fallback: G) -> T
    where
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(BreakerError<E>) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.execute(operation).await {
            Ok(value) => value,
            Err(err) => {
                let reason = match &err {
                    BreakerError::Open(open) => open.to_string(),
                    BreakerError::Failed(e) => e.to_string(),
                };
                warn!(dependency = %self.name, event = "fallback", error = %reason, "serving fallback");
                fallback(err).await
            }
        }
    }
}

//! Per-request cancellation and deadline carried into every protected call.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The caller's request scope.
///
/// Backoff sleeps and batch pacing race against both the cancellation token
/// and the deadline; whichever fires first stops further attempts.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context driven by an existing token (e.g. a request's shutdown signal).
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Attach a deadline measured from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Sleep for `delay` unless the context is cancelled first.
    ///
    /// Returns `false` when the sleep was cut short.
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let wake_at = Instant::now() + delay;
        match self.deadline {
            Some(deadline) if deadline <= wake_at => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                false
            }
            _ => {
                tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    _ = tokio::time::sleep_until(wake_at) => true,
                }
            }
        }
    }
}

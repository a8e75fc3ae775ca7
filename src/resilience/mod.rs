//! Guarding calls to external dependencies.
//!
//! ```text
//! caller → ProtectedOperation::execute
//!            → CircuitBreaker::try_acquire   (fail fast when open)
//!            → RetryPolicy::run              (backoff between attempts)
//!            → CircuitBreaker::record_*      (one outcome per call)
//! ```

mod breaker;
mod context;
mod protected;
mod registry;
mod retry;

pub use breaker::{BreakerConfig, BreakerError, BreakerMetrics, BreakerOpen, BreakerState, CircuitBreaker};
pub use context::CallContext;
pub use protected::{BatchOptions, ProtectedError, ProtectedOperation};
pub use registry::{DependencyClass, DependencyProfile, DependencyRegistry};
pub use retry::{RetryError, RetryPolicy};

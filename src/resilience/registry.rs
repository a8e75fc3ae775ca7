//! One breaker and retry policy per named dependency, shared by every caller.
//!
//! The registry is an ordinary value: build it once at start-up and hand
//! clones to whoever needs it. Clones share the same entries.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::breaker::{BreakerConfig, BreakerMetrics, CircuitBreaker};
use super::protected::ProtectedOperation;
use super::retry::RetryPolicy;
use crate::error::{ErrorClass, FramewrightError};

/// Kinds of dependency with distinct failure behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyClass {
    Database,
    AiProvider,
    Payment,
    Sms,
    ExternalApi,
}

impl DependencyClass {
    pub const ALL: [DependencyClass; 5] = [
        DependencyClass::Database,
        DependencyClass::AiProvider,
        DependencyClass::Payment,
        DependencyClass::Sms,
        DependencyClass::ExternalApi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyClass::Database => "database",
            DependencyClass::AiProvider => "ai_provider",
            DependencyClass::Payment => "payment",
            DependencyClass::Sms => "sms",
            DependencyClass::ExternalApi => "external_api",
        }
    }

    /// Hand-tuned defaults for this class.
    ///
    /// Databases retry quickly on connection trouble; AI providers back off
    /// longer and also retry rate limits; payments never retry rate limits.
    pub fn profile(self) -> DependencyProfile {
        use ErrorClass::{RateLimited, Transient};

        let (breaker, retry) = match self {
            DependencyClass::Database => (
                BreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout_ms: 30_000,
                    success_threshold: 2,
                },
                RetryPolicy {
                    max_retries: 4,
                    base_delay_ms: 100,
                    max_delay_ms: 2_000,
                    backoff_multiplier: 2.0,
                    retry_on: vec![Transient],
                    jitter: false,
                },
            ),
            DependencyClass::AiProvider => (
                BreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout_ms: 60_000,
                    success_threshold: 1,
                },
                RetryPolicy {
                    max_retries: 2,
                    base_delay_ms: 2_000,
                    max_delay_ms: 10_000,
                    backoff_multiplier: 2.0,
                    retry_on: vec![Transient, RateLimited],
                    jitter: true,
                },
            ),
            DependencyClass::Payment => (
                BreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout_ms: 60_000,
                    success_threshold: 2,
                },
                RetryPolicy {
                    max_retries: 2,
                    base_delay_ms: 500,
                    max_delay_ms: 4_000,
                    backoff_multiplier: 2.0,
                    retry_on: vec![Transient],
                    jitter: false,
                },
            ),
            DependencyClass::Sms => (
                BreakerConfig {
                    failure_threshold: 5,
                    recovery_timeout_ms: 30_000,
                    success_threshold: 1,
                },
                RetryPolicy {
                    max_retries: 3,
                    base_delay_ms: 1_000,
                    max_delay_ms: 8_000,
                    backoff_multiplier: 2.0,
                    retry_on: vec![Transient, RateLimited],
                    jitter: false,
                },
            ),
            DependencyClass::ExternalApi => (BreakerConfig::default(), RetryPolicy::default()),
        };

        DependencyProfile {
            class: self,
            breaker,
            retry,
        }
    }
}

impl fmt::Display for DependencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyClass {
    type Err = FramewrightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| FramewrightError::Config(format!("unknown dependency class '{s}'")))
    }
}

/// Breaker thresholds and retry policy for one dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyProfile {
    pub class: DependencyClass,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
}

#[derive(Debug)]
struct Entry {
    class: DependencyClass,
    operation: ProtectedOperation,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with one dependency per class, named after the class.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for class in DependencyClass::ALL {
            registry.register(class.as_str(), class.profile());
        }
        registry
    }

    /// Register `name` with `profile`, or return the existing operation if
    /// the name is already taken. The first registration wins.
    pub fn register(&self, name: &str, profile: DependencyProfile) -> ProtectedOperation {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            debug!(dependency = name, "dependency already registered");
            return existing.operation.clone();
        }

        let breaker = Arc::new(CircuitBreaker::new(name, profile.breaker));
        let operation = ProtectedOperation::new(breaker, profile.retry);
        info!(dependency = name, class = %profile.class, event = "registered", "dependency registered");
        entries.insert(
            name.to_string(),
            Entry {
                class: profile.class,
                operation: operation.clone(),
            },
        );
        operation
    }

    pub fn get(&self, name: &str) -> Option<ProtectedOperation> {
        self.entries.read().get(name).map(|e| e.operation.clone())
    }

    /// Look up `name`, registering it with the class defaults on first use.
    pub fn get_or_register(&self, name: &str, class: DependencyClass) -> ProtectedOperation {
        if let Some(operation) = self.get(name) {
            return operation;
        }
        self.register(name, class.profile())
    }

    /// Like [`get`](Self::get), but a missing name is an error.
    pub fn require(&self, name: &str) -> Result<ProtectedOperation, FramewrightError> {
        self.get(name)
            .ok_or_else(|| FramewrightError::UnknownDependency(name.to_string()))
    }

    /// The effective profile of a registered dependency.
    pub fn profile(&self, name: &str) -> Option<DependencyProfile> {
        self.entries.read().get(name).map(|e| DependencyProfile {
            class: e.class,
            breaker: e.operation.breaker().config().clone(),
            retry: e.operation.retry_policy().clone(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Breaker snapshots for health reporting, sorted by name.
    pub fn metrics(&self) -> Vec<BreakerMetrics> {
        let mut metrics: Vec<BreakerMetrics> = self
            .entries
            .read()
            .values()
            .map(|e| e.operation.breaker().metrics())
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}

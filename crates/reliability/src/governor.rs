//! The governor object shared by the orchestrator.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_config::ReliabilityConfig;
use parley_core::EphemeralStore;

use crate::circuit::{CircuitBreakers, CircuitState};
use crate::rate_limit::RateLimiter;
use crate::recovery::RecoveryStore;
use crate::retry::{RetryError, retry_with_backoff};

/// Retry policy, circuit breakers, rate limiter and recovery store.
///
/// Construct once per process and share behind an `Arc`.
pub struct ReliabilityGovernor {
    retry_delays: Vec<Duration>,
    breakers: CircuitBreakers,
    limiter: RateLimiter,
    recovery: RecoveryStore,
}

impl ReliabilityGovernor {
    pub fn new(config: &ReliabilityConfig, store: Arc<dyn EphemeralStore>) -> Self {
        Self {
            retry_delays: config
                .retry_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            breakers: CircuitBreakers::new(config.failure_threshold, config.breaker_timeout()),
            limiter: RateLimiter::new(),
            recovery: RecoveryStore::new(store, config.recovery_key.clone()),
        }
    }

    /// Run `operation` with classification-aware retries on the configured backoff table.
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: F,
        label: &str,
        max_attempts: u32,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        retry_with_backoff(operation, label, max_attempts, &self.retry_delays).await
    }

    pub fn check_circuit_breaker(&self, key: &str) -> bool {
        self.breakers.check(key)
    }

    pub fn record_success(&self, key: &str) {
        self.breakers.record_success(key);
    }

    pub fn record_failure(&self, key: &str) {
        self.breakers.record_failure(key);
    }

    pub fn circuit_state(&self, key: &str) -> CircuitState {
        self.breakers.state(key)
    }

    pub fn reset_circuit(&self, key: &str) {
        self.breakers.reset(key);
    }

    pub fn check_limit(&self, key: &str, max_calls: u32, window: Duration) -> bool {
        self.limiter.check_limit(key, max_calls, window)
    }

    pub fn recovery(&self) -> &RecoveryStore {
        &self.recovery
    }
}

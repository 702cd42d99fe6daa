//! Per-key circuit breakers.
//!
//! A key names a logical operation (`llm.complete`, `tool.search`, ...).
//! Breakers are created lazily on first use and live behind one mutex.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow; failures are counted
    Closed,
    /// Requests are blocked until the timeout passes
    Open,
    /// One probe request has been let through; another is admitted if it
    /// reports nothing within the timeout
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_admitted: Option<Instant>,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            probe_admitted: None,
        }
    }
}

/// Keyed circuit breakers sharing one threshold and timeout.
#[derive(Debug)]
pub struct CircuitBreakers {
    threshold: u32,
    timeout: Duration,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request for `key` may proceed.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and
    /// admits the caller that observed the transition. Every other check
    /// while half-open is refused until that probe is recorded. If the
    /// timeout passes with no result, the next caller is admitted instead.
    pub fn check(&self, key: &str) -> bool {
        let Ok(mut breakers) = self.breakers.lock() else {
            return true;
        };
        let breaker = breakers.entry(key.to_string()).or_default();

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = breaker
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.timeout);
                if cooled {
                    info!(key, "Circuit half-open, allowing probe request");
                    breaker.state = CircuitState::HalfOpen;
                    breaker.probe_admitted = Some(Instant::now());
                }
                cooled
            }
            CircuitState::HalfOpen => {
                let abandoned = breaker
                    .probe_admitted
                    .is_none_or(|at| at.elapsed() >= self.timeout);
                if abandoned {
                    info!(key, "Half-open request never reported, allowing another");
                    breaker.probe_admitted = Some(Instant::now());
                }
                abandoned
            }
        }
    }

    /// Reset `key` to closed with no failures, whatever its state.
    pub fn record_success(&self, key: &str) {
        let Ok(mut breakers) = self.breakers.lock() else {
            return;
        };
        let breaker = breakers.entry(key.to_string()).or_default();
        if breaker.state != CircuitState::Closed {
            info!(key, from = %breaker.state, "Circuit closed");
        }
        *breaker = Breaker::default();
    }

    pub fn record_failure(&self, key: &str) {
        let Ok(mut breakers) = self.breakers.lock() else {
            return;
        };
        let breaker = breakers.entry(key.to_string()).or_default();
        breaker.failures += 1;
        breaker.last_failure = Some(Instant::now());

        match breaker.state {
            CircuitState::Closed if breaker.failures >= self.threshold => {
                warn!(
                    key,
                    failures = breaker.failures,
                    timeout_secs = self.timeout.as_secs(),
                    "Circuit opened"
                );
                breaker.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                debug!(key, failures = breaker.failures, threshold = self.threshold, "Failure recorded");
            }
            CircuitState::HalfOpen => {
                warn!(key, "Half-open probe failed, circuit re-opened");
                breaker.state = CircuitState::Open;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of `key`, without triggering the half-open transition.
    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers
            .lock()
            .ok()
            .and_then(|breakers| breakers.get(key).map(|b| b.state))
            .unwrap_or(CircuitState::Closed)
    }

    /// Forget everything about `key`.
    pub fn reset(&self, key: &str) {
        if let Ok(mut breakers) = self.breakers.lock() {
            breakers.remove(key);
        }
    }
}

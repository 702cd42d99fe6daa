//! Reliability governor for Parley.
//!
//! Everything the orchestration core needs to survive a flaky dependency:
//! error classification, retry with a fixed backoff table, a per-key
//! circuit breaker, a per-key rate limiter and the crash-recovery snapshot.
//! [`ReliabilityGovernor`] bundles them behind one `Arc`-shareable object.

pub mod circuit;
pub mod classify;
pub mod governor;
pub mod rate_limit;
pub mod recovery;
pub mod retry;

pub use circuit::{CircuitBreakers, CircuitState};
pub use classify::{ClassifiedError, ErrorKind, UNAVAILABLE_MESSAGE, classify};
pub use governor::ReliabilityGovernor;
pub use rate_limit::RateLimiter;
pub use recovery::{RecoverySnapshot, RecoveryStore};
pub use retry::{RetryError, retry_with_backoff};

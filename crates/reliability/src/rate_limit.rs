//! Per-key call counting over a resettable window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Keyed rate limiter. Independent of the circuit breakers.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a call against `key`.
    ///
    /// The window restarts once `window` has passed since it began. Returns
    /// false, without counting, when the call would exceed `max_calls`.
    pub fn check_limit(&self, key: &str, max_calls: u32, window: Duration) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return true;
        };
        let now = Instant::now();
        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.started) >= window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= max_calls {
            debug!(key, max_calls, "Rate limit reached");
            return false;
        }
        entry.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn allows_up_to_max_then_refuses() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(1);
        assert!(limiter.check_limit("send", 3, window));
        assert!(limiter.check_limit("send", 3, window));
        assert!(limiter.check_limit("send", 3, window));
        assert!(!limiter.check_limit("send", 3, window));
        assert!(!limiter.check_limit("send", 3, window));
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_restores_capacity() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(10);
        assert!(limiter.check_limit("send", 1, window));
        assert!(!limiter.check_limit("send", 1, window));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!limiter.check_limit("send", 1, window));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check_limit("send", 1, window));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_do_not_share_counters() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(1);
        assert!(limiter.check_limit("a", 1, window));
        assert!(limiter.check_limit("b", 1, window));
        assert!(!limiter.check_limit("a", 1, window));
    }
}

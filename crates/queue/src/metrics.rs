//! Queue counters and rolling latency samples.

use std::collections::VecDeque;
use std::time::Duration;

/// Samples kept per latency window.
pub const LATENCY_SAMPLES: usize = 100;

/// A bounded window of recent latency samples.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sample, evicting the oldest when full.
    pub fn record(&mut self, sample: Duration) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the retained samples (zero when empty).
    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().copied().max().unwrap_or_default()
    }

    pub fn last(&self) -> Option<Duration> {
        self.samples.back().copied()
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(LATENCY_SAMPLES)
    }
}

/// Cumulative counters for one queue instance.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    /// Tasks admitted to the pending list
    pub submitted: u64,
    /// Tasks that resolved with a value
    pub succeeded: u64,
    /// Tasks rejected after exhausting retries or timing out
    pub failed: u64,
    /// Retry attempts scheduled
    pub retried: u64,
    /// Executions cut off by the timeout (also counted in `failed`)
    pub timed_out: u64,
    /// Calls turned away (queue full) or dropped by `clear`
    pub rejected: u64,
    /// Time from (re-)enqueue to dispatch
    pub wait: LatencyWindow,
    /// Time from dispatch to completion
    pub execution: LatencyWindow,
}

impl QueueMetrics {
    pub fn avg_wait(&self) -> Duration {
        self.wait.average()
    }

    pub fn avg_execution(&self) -> Duration {
        self.execution.average()
    }
}

//! Priority request queue for Parley.
//!
//! Every outbound call the orchestration core makes (completions, tool
//! executions) goes through one shared [`RequestQueue`]. The queue:
//!
//! - orders pending work by priority (higher first, FIFO within a priority)
//! - caps how many tasks execute at once
//! - caps dispatches per fixed rate window, deferring rather than rejecting
//! - bounds each execution with a timeout
//! - retries failures on a backoff schedule at the task's original priority
//! - keeps cumulative counters and rolling latency samples
//!
//! A single dispatcher task owns all queue state. Handles talk to it over
//! a command channel, so no lock guards the pending list.

mod dispatcher;
pub mod error;
pub mod metrics;
pub mod queue;
mod task;

pub use error::{BoxError, QueueError};
pub use metrics::{LatencyWindow, QueueMetrics};
pub use queue::{Enqueued, QueueConfigUpdate, QueueStatus, RequestQueue};
pub use task::EnqueueOptions;

//! Queue error types.

use thiserror::Error;

/// The boxed error a task may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a queued task did not produce a value.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue full: {max} tasks already pending")]
    QueueFull { max: usize },

    #[error("queue cleared before task {id} was dispatched")]
    Cleared { id: String },

    #[error("task {id} timed out after {after_ms}ms")]
    Timeout { id: String, after_ms: u64 },

    #[error("task {id} failed after {attempts} attempt(s): {source}")]
    Failed {
        id: String,
        attempts: u32,
        source: BoxError,
    },

    #[error("request queue is shut down")]
    Closed,

    #[error("internal queue error: {0}")]
    Internal(String),
}

impl QueueError {
    /// The error reported by the task itself, if the task ran and failed.
    pub fn task_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Failed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

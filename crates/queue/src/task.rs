//! Queued task representation.
//!
//! Tasks of any result type share one pending list, so the executable and
//! the result channel are type-erased here and restored in
//! [`RequestQueue::enqueue`](crate::RequestQueue::enqueue).

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{BoxError, QueueError};

pub(crate) type AnyValue = Box<dyn Any + Send>;

/// Produces one attempt of the task. Called again for every retry.
pub(crate) type RunFn = Box<dyn FnMut() -> BoxFuture<'static, Result<AnyValue, BoxError>> + Send>;

/// Delivers the final outcome to the caller.
pub(crate) type ReplyFn = Box<dyn FnOnce(Result<AnyValue, QueueError>) + Send>;

/// Per-call options for [`RequestQueue::enqueue`](crate::RequestQueue::enqueue).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first
    pub priority: i32,
    /// Retries after the first attempt; queue default when `None`
    pub max_retries: Option<u32>,
    /// Identifier used in logs and errors; generated when `None`
    pub id: Option<String>,
    /// Execution timeout; queue default when `None`
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A deferred unit of work owned by the dispatcher.
pub(crate) struct QueueTask {
    pub id: String,
    pub priority: i32,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    /// Queue default applies when `None`
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub run: RunFn,
    reply: Option<ReplyFn>,
}

impl QueueTask {
    pub fn new(
        id: String,
        priority: i32,
        max_retries: Option<u32>,
        timeout: Option<Duration>,
        run: RunFn,
        reply: ReplyFn,
    ) -> Self {
        Self {
            id,
            priority,
            enqueued_at: Instant::now(),
            retry_count: 0,
            max_retries,
            timeout,
            run,
            reply: Some(reply),
        }
    }

    /// Hand the final outcome to the caller. Later calls are no-ops.
    pub fn settle(&mut self, outcome: Result<AnyValue, QueueError>) {
        if let Some(reply) = self.reply.take() {
            reply(outcome);
        }
    }
}

/// Erase a typed task factory into a [`RunFn`].
pub(crate) fn erase_run<T, E, F, Fut>(mut task: F) -> RunFn
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError> + 'static,
{
    Box::new(move || {
        let attempt = task();
        async move {
            attempt
                .await
                .map(|value| Box::new(value) as AnyValue)
                .map_err(Into::into)
        }
        .boxed()
    })
}

/// Erase a typed result channel into a [`ReplyFn`].
pub(crate) fn erase_reply<T: Send + 'static>(tx: oneshot::Sender<Result<T, QueueError>>) -> ReplyFn {
    Box::new(move |outcome: Result<AnyValue, QueueError>| {
        let typed = outcome.and_then(|value| {
            value
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| QueueError::Internal("task result type mismatch".into()))
        });
        // Caller may have stopped waiting
        let _ = tx.send(typed);
    })
}

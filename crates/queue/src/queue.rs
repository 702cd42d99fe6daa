//! The public queue handle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use parley_config::QueueConfig;
use tokio::sync::{mpsc, oneshot};

use crate::dispatcher::{Command, Dispatcher};
use crate::error::{BoxError, QueueError};
use crate::metrics::QueueMetrics;
use crate::task::{EnqueueOptions, QueueTask, erase_reply, erase_run};

/// Snapshot of the queue's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

/// A partial configuration change. `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct QueueConfigUpdate {
    pub max_concurrent: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub rate_limit_per_window: Option<usize>,
    pub rate_window_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delays_ms: Option<Vec<u64>>,
}

impl QueueConfigUpdate {
    pub(crate) fn apply(self, config: &mut QueueConfig) {
        if let Some(v) = self.max_concurrent {
            config.max_concurrent = v.max(1);
        }
        if let Some(v) = self.max_queue_size {
            config.max_queue_size = v;
        }
        if let Some(v) = self.rate_limit_per_window {
            config.rate_limit_per_window = v.max(1);
        }
        if let Some(v) = self.rate_window_ms {
            config.rate_window_ms = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.retry_delays_ms {
            config.retry_delays_ms = v;
        }
    }
}

/// Resolves to the final outcome of an enqueued task.
///
/// The task is already queued by the time this value exists; dropping it
/// does not cancel the task, only discards its result.
#[must_use = "the task runs regardless, but its result is lost unless awaited"]
pub struct Enqueued<T> {
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> Future for Enqueued<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(QueueError::Closed)))
    }
}

/// Cloneable handle to a shared priority queue.
///
/// Construct one per process and share it; every clone talks to the same
/// dispatcher. The dispatcher stops once every handle is dropped.
#[derive(Clone)]
pub struct RequestQueue {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl RequestQueue {
    /// Create a queue. Must be called from within a Tokio runtime.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            commands: Dispatcher::spawn(config),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Submit a task.
    ///
    /// `task` is called once per attempt, so a retried task re-runs from
    /// scratch. The task is admitted (or rejected as full) in call order,
    /// before the returned future is first polled.
    pub fn enqueue<T, E, F, Fut>(&self, task: F, options: EnqueueOptions) -> Enqueued<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = options
            .id
            .unwrap_or_else(|| format!("task-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        let queued = QueueTask::new(
            id,
            options.priority,
            options.max_retries,
            options.timeout,
            erase_run(task),
            erase_reply(tx),
        );
        // On a closed dispatcher the reply sender drops and the caller sees `Closed`
        let _ = self.commands.send(Command::Enqueue(queued));
        Enqueued { rx }
    }

    /// Reject every pending task with [`QueueError::Cleared`].
    ///
    /// Running tasks and retries waiting out their backoff are untouched.
    /// Returns how many tasks were dropped.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        self.request(Command::Clear).await
    }

    pub async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        self.request(Command::Metrics).await
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.request(Command::Status).await
    }

    /// Merge a partial configuration. Takes effect at the next dispatch decision.
    pub fn update_config(&self, update: QueueConfigUpdate) -> Result<(), QueueError> {
        self.commands
            .send(Command::UpdateConfig(update))
            .map_err(|_| QueueError::Closed)
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    fn config() -> QueueConfig {
        QueueConfig {
            max_concurrent: 1,
            max_queue_size: 100,
            rate_limit_per_window: 100,
            rate_window_ms: 1000,
            timeout_ms: 30_000,
            max_retries: 0,
            retry_delays_ms: vec![100, 200],
        }
    }

    /// A task that waits for `gate` before finishing.
    fn gated(
        gate: Arc<Notify>,
        order: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    ) -> impl FnMut() -> Pin<Box<dyn Future<Output = Result<&'static str, BoxError>> + Send>> + Send + 'static {
        move || {
            let gate = gate.clone();
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push(label);
                gate.notified().await;
                Ok(label)
            })
        }
    }

    fn recording(
        order: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    ) -> impl FnMut() -> Pin<Box<dyn Future<Output = Result<&'static str, BoxError>> + Send>> + Send + 'static {
        move || {
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push(label);
                Ok(label)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_jumps_ahead() {
        let queue = RequestQueue::new(config());
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());

        let blocker = queue.enqueue(gated(gate.clone(), order.clone(), "blocker"), EnqueueOptions::new());
        let slow = queue.enqueue(recording(order.clone(), "slow"), EnqueueOptions::new().with_priority(1));
        let fast = queue.enqueue(recording(order.clone(), "fast"), EnqueueOptions::new().with_priority(10));

        gate.notify_one();
        assert_eq!(blocker.await.unwrap(), "blocker");
        assert_eq!(fast.await.unwrap(), "fast");
        assert_eq!(slow.await.unwrap(), "slow");
        assert_eq!(*order.lock().unwrap(), vec!["blocker", "fast", "slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_is_fifo() {
        let queue = RequestQueue::new(config());
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|label| queue.enqueue(recording(order.clone(), label), EnqueueOptions::new().with_priority(5)))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_new_work() {
        let queue = RequestQueue::new(QueueConfig {
            max_queue_size: 2,
            ..config()
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());

        let _running = queue.enqueue(gated(gate.clone(), order.clone(), "running"), EnqueueOptions::new());
        // Status is answered after the first task has been dispatched
        queue.status().await.unwrap();
        let _a = queue.enqueue(recording(order.clone(), "a"), EnqueueOptions::new());
        let _b = queue.enqueue(recording(order.clone(), "b"), EnqueueOptions::new());
        let rejected = queue.enqueue(recording(order.clone(), "c"), EnqueueOptions::new());

        assert!(matches!(rejected.await, Err(QueueError::QueueFull { max: 2 })));
        let status = queue.status().await.unwrap();
        assert_eq!(status.pending, 2);
        assert_eq!(status.active, 1);
        assert_eq!(queue.metrics().await.unwrap().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_is_retried_until_success() {
        let queue = RequestQueue::new(config());
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let result = queue
            .enqueue(
                move || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 { Err(format!("attempt {n} failed")) } else { Ok(n) }
                    }
                },
                EnqueueOptions::new().with_max_retries(3),
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_attempt_count() {
        let queue = RequestQueue::new(QueueConfig {
            max_retries: 2,
            ..config()
        });

        let result = queue
            .enqueue(|| async { Err::<(), _>("boom") }, EnqueueOptions::new().with_id("doomed"))
            .await;

        match result {
            Err(QueueError::Failed { id, attempts, source }) => {
                assert_eq!(id, "doomed");
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(queue.metrics().await.unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_follow_backoff_schedule() {
        let queue = RequestQueue::new(config());
        let starts = Arc::new(Mutex::new(Vec::new()));

        let log = starts.clone();
        let result = queue
            .enqueue(
                move || {
                    log.lock().unwrap().push(Instant::now());
                    async { Err::<(), _>("still failing") }
                },
                EnqueueOptions::new().with_max_retries(3),
            )
            .await;
        assert!(result.is_err());

        let starts = starts.lock().unwrap();
        let gaps: Vec<_> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        // Delays past the end of the schedule reuse the last entry
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(200)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_frees_the_slot() {
        let queue = RequestQueue::new(config());

        let stuck = queue.enqueue(
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, BoxError>(())
            },
            EnqueueOptions::new().with_timeout(Duration::from_millis(100)),
        );
        let next = queue.enqueue(|| async { Ok::<_, BoxError>("next") }, EnqueueOptions::new());

        assert!(matches!(stuck.await, Err(QueueError::Timeout { after_ms: 100, .. })));
        assert_eq!(next.await.unwrap(), "next");
        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.timed_out, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_fails_and_frees_the_slot() {
        let queue = RequestQueue::new(config());

        let exploding = queue.enqueue(
            || async {
                if true {
                    panic!("tool blew up");
                }
                Ok::<_, BoxError>(())
            },
            EnqueueOptions::new().with_id("exploding"),
        );
        let next = queue.enqueue(|| async { Ok::<_, BoxError>("next") }, EnqueueOptions::new());

        let err = exploding.await.unwrap_err();
        assert!(matches!(err, QueueError::Failed { attempts: 1, .. }));
        assert!(err.to_string().contains("task panicked: tool blew up"));
        assert_eq!(next.await.unwrap(), "next");

        let status = queue.status().await.unwrap();
        assert_eq!(status.active, 0);
        assert_eq!(status.pending, 0);
        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_defers_dispatch_to_next_window() {
        let queue = RequestQueue::new(QueueConfig {
            max_concurrent: 10,
            rate_limit_per_window: 2,
            ..config()
        });
        let origin = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let log = starts.clone();
                queue.enqueue(
                    move || {
                        log.lock().unwrap().push(Instant::now());
                        async { Ok::<_, BoxError>(()) }
                    },
                    EnqueueOptions::new(),
                )
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let starts = starts.lock().unwrap();
        assert!(starts[1] - origin < Duration::from_millis(1000));
        assert!(starts[2] - origin >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_cap() {
        let queue = RequestQueue::new(QueueConfig {
            max_concurrent: 2,
            ..config()
        });
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let current = current.clone();
                let peak = peak.clone();
                queue.enqueue(
                    move || {
                        let current = current.clone();
                        let peak = peak.clone();
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, BoxError>(())
                        }
                    },
                    EnqueueOptions::new(),
                )
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_rejects_pending_but_not_running() {
        let queue = RequestQueue::new(config());
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());

        let running = queue.enqueue(gated(gate.clone(), order.clone(), "running"), EnqueueOptions::new());
        let a = queue.enqueue(recording(order.clone(), "a"), EnqueueOptions::new());
        let b = queue.enqueue(recording(order.clone(), "b"), EnqueueOptions::new());

        assert_eq!(queue.clear().await.unwrap(), 2);
        assert!(matches!(a.await, Err(QueueError::Cleared { .. })));
        assert!(matches!(b.await, Err(QueueError::Cleared { .. })));

        gate.notify_one();
        assert_eq!(running.await.unwrap(), "running");
        assert_eq!(*order.lock().unwrap(), vec!["running"]);
    }

    #[tokio::test(start_paused = true)]
    async fn raising_concurrency_dispatches_waiting_work() {
        let queue = RequestQueue::new(config());
        let order = Arc::new(Mutex::new(Vec::new()));
        let first_gate = Arc::new(Notify::new());
        let second_gate = Arc::new(Notify::new());

        let first = queue.enqueue(gated(first_gate.clone(), order.clone(), "first"), EnqueueOptions::new());
        let second = queue.enqueue(gated(second_gate.clone(), order.clone(), "second"), EnqueueOptions::new());

        let before = queue.status().await.unwrap();
        assert_eq!((before.active, before.pending), (1, 1));

        queue
            .update_config(QueueConfigUpdate {
                max_concurrent: Some(2),
                ..Default::default()
            })
            .unwrap();
        let after = queue.status().await.unwrap();
        assert_eq!((after.active, after.pending, after.max_concurrent), (2, 0, 2));

        first_gate.notify_one();
        second_gate.notify_one();
        first.await.unwrap();
        second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn generated_ids_are_unique_per_queue() {
        let queue = RequestQueue::new(QueueConfig {
            max_retries: 0,
            ..config()
        });
        let first = queue.enqueue(|| async { Err::<(), _>("x") }, EnqueueOptions::new()).await;
        let second = queue.enqueue(|| async { Err::<(), _>("x") }, EnqueueOptions::new()).await;

        let id_of = |r: Result<(), QueueError>| match r {
            Err(QueueError::Failed { id, .. }) => id,
            other => panic!("unexpected {other:?}"),
        };
        assert_ne!(id_of(first), id_of(second));
    }
}

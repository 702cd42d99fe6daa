//! The dispatcher task: sole owner of pending work, the active count,
//! the rate window and the metrics.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use parley_config::QueueConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{BoxError, QueueError};
use crate::metrics::QueueMetrics;
use crate::queue::{QueueConfigUpdate, QueueStatus};
use crate::task::{AnyValue, QueueTask};

/// Messages from handles and execution tasks to the dispatcher.
pub(crate) enum Command {
    Enqueue(QueueTask),
    /// A failed task coming back after its backoff delay
    Requeue(QueueTask),
    Finished {
        task: QueueTask,
        attempt: Attempt,
        elapsed: Duration,
    },
    Clear(oneshot::Sender<usize>),
    UpdateConfig(QueueConfigUpdate),
    Metrics(oneshot::Sender<QueueMetrics>),
    Status(oneshot::Sender<QueueStatus>),
}

/// How one execution attempt ended.
pub(crate) enum Attempt {
    Succeeded(AnyValue),
    Failed(BoxError),
    TimedOut(Duration),
}

/// Fixed dispatch window.
struct RateWindow {
    started: Instant,
    dispatched: usize,
}

pub(crate) struct Dispatcher {
    config: QueueConfig,
    /// Sorted by priority descending, FIFO within a priority
    pending: VecDeque<QueueTask>,
    active: usize,
    window: RateWindow,
    metrics: QueueMetrics,
    /// Weak so that dropping every handle shuts the dispatcher down
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Dispatcher {
    /// Start a dispatcher on the current Tokio runtime.
    pub fn spawn(config: QueueConfig) -> mpsc::UnboundedSender<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            config,
            pending: VecDeque::new(),
            active: 0,
            window: RateWindow {
                started: Instant::now(),
                dispatched: 0,
            },
            metrics: QueueMetrics::default(),
            commands: tx.downgrade(),
        };
        tokio::spawn(dispatcher.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            self.dispatch_ready();

            let resume_at = self.rate_limited_until();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(resume_at.unwrap_or_else(Instant::now)), if resume_at.is_some() => {}
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(mut task) => {
                let max = self.config.max_queue_size;
                if self.pending.len() >= max {
                    self.metrics.rejected += 1;
                    warn!(task_id = %task.id, max, "Queue full, rejecting task");
                    task.settle(Err(QueueError::QueueFull { max }));
                    return;
                }
                self.metrics.submitted += 1;
                debug!(
                    task_id = %task.id,
                    priority = task.priority,
                    pending = self.pending.len() + 1,
                    "Task enqueued"
                );
                self.insert(task);
            }
            Command::Requeue(mut task) => {
                task.enqueued_at = Instant::now();
                debug!(task_id = %task.id, retry = task.retry_count, "Task re-queued for retry");
                self.insert(task);
            }
            Command::Finished {
                task,
                attempt,
                elapsed,
            } => self.finish(task, attempt, elapsed),
            Command::Clear(reply) => {
                let cleared = self.pending.len();
                for mut task in self.pending.drain(..) {
                    let id = task.id.clone();
                    task.settle(Err(QueueError::Cleared { id }));
                }
                self.metrics.rejected += cleared as u64;
                info!(cleared, "Queue cleared");
                let _ = reply.send(cleared);
            }
            Command::UpdateConfig(update) => {
                update.apply(&mut self.config);
                info!(
                    max_concurrent = self.config.max_concurrent,
                    max_queue_size = self.config.max_queue_size,
                    rate_limit = self.config.rate_limit_per_window,
                    "Queue configuration updated"
                );
            }
            Command::Metrics(reply) => {
                let _ = reply.send(self.metrics.clone());
            }
            Command::Status(reply) => {
                let _ = reply.send(QueueStatus {
                    pending: self.pending.len(),
                    active: self.active,
                    max_concurrent: self.config.max_concurrent,
                });
            }
        }
    }

    /// Insert behind every task of equal or higher priority.
    fn insert(&mut self, task: QueueTask) {
        let idx = self
            .pending
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(idx, task);
    }

    /// Start as many pending tasks as capacity and the rate window allow.
    fn dispatch_ready(&mut self) {
        while self.active < self.config.max_concurrent && !self.pending.is_empty() {
            let now = Instant::now();
            if !self.acquire_rate_slot(now) {
                debug!(
                    pending = self.pending.len(),
                    resume_in_ms = self
                        .rate_limited_until()
                        .map(|at| at.saturating_duration_since(now).as_millis() as u64)
                        .unwrap_or(0),
                    "Rate limit reached, deferring dispatch"
                );
                break;
            }
            if let Some(task) = self.pending.pop_front() {
                self.start(task, now);
            }
        }
    }

    fn acquire_rate_slot(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window.started) >= self.config.rate_window() {
            self.window = RateWindow {
                started: now,
                dispatched: 0,
            };
        }
        if self.window.dispatched >= self.config.rate_limit_per_window {
            return false;
        }
        self.window.dispatched += 1;
        true
    }

    /// When dispatch is blocked only by the rate window, the instant it resets.
    fn rate_limited_until(&self) -> Option<Instant> {
        if self.pending.is_empty() || self.active >= self.config.max_concurrent {
            return None;
        }
        if self.window.dispatched < self.config.rate_limit_per_window {
            return None;
        }
        Some(self.window.started + self.config.rate_window())
    }

    fn start(&mut self, mut task: QueueTask, now: Instant) {
        let Some(commands) = self.commands.upgrade() else {
            task.settle(Err(QueueError::Closed));
            return;
        };

        self.active += 1;
        self.metrics.wait.record(now.saturating_duration_since(task.enqueued_at));
        let timeout = task.timeout.unwrap_or_else(|| self.config.timeout());

        debug!(
            task_id = %task.id,
            priority = task.priority,
            attempt = task.retry_count + 1,
            active = self.active,
            "Dispatching task"
        );

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(async { tokio::time::timeout(timeout, (task.run)()).await })
                .catch_unwind()
                .await;
            let attempt = match outcome {
                Ok(Ok(Ok(value))) => Attempt::Succeeded(value),
                Ok(Ok(Err(error))) => Attempt::Failed(error),
                Ok(Err(_)) => Attempt::TimedOut(timeout),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(task_id = %task.id, panic = %message, "Task panicked");
                    Attempt::Failed(message.into())
                }
            };
            let _ = commands.send(Command::Finished {
                task,
                attempt,
                elapsed: started.elapsed(),
            });
        });
    }

    fn finish(&mut self, mut task: QueueTask, attempt: Attempt, elapsed: Duration) {
        self.active = self.active.saturating_sub(1);
        self.metrics.execution.record(elapsed);

        let max_retries = task.max_retries.unwrap_or(self.config.max_retries);
        match attempt {
            Attempt::Succeeded(value) => {
                self.metrics.succeeded += 1;
                debug!(
                    task_id = %task.id,
                    retries = task.retry_count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task succeeded"
                );
                task.settle(Ok(value));
            }
            Attempt::TimedOut(after) => {
                self.metrics.timed_out += 1;
                self.metrics.failed += 1;
                warn!(task_id = %task.id, timeout_ms = after.as_millis() as u64, "Task timed out");
                let id = task.id.clone();
                task.settle(Err(QueueError::Timeout {
                    id,
                    after_ms: after.as_millis() as u64,
                }));
            }
            Attempt::Failed(error) if task.retry_count < max_retries => {
                let delay = self.config.retry_delay(task.retry_count);
                task.retry_count += 1;
                self.metrics.retried += 1;
                warn!(
                    task_id = %task.id,
                    retry = task.retry_count,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task failed, scheduling retry"
                );
                self.schedule_retry(task, delay);
            }
            Attempt::Failed(error) => {
                self.metrics.failed += 1;
                warn!(
                    task_id = %task.id,
                    attempts = task.retry_count + 1,
                    error = %error,
                    "Task failed, retries exhausted"
                );
                let id = task.id.clone();
                let attempts = task.retry_count + 1;
                task.settle(Err(QueueError::Failed {
                    id,
                    attempts,
                    source: error,
                }));
            }
        }
    }

    fn schedule_retry(&self, mut task: QueueTask, delay: Duration) {
        let Some(commands) = self.commands.upgrade() else {
            task.settle(Err(QueueError::Closed));
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Requeue(task));
        });
    }

    fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "Request queue shutting down with pending tasks");
        }
        for mut task in self.pending.drain(..) {
            task.settle(Err(QueueError::Closed));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".into());
    format!("task panicked: {detail}")
}

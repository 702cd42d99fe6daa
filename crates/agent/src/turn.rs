//! The turn orchestrator.
//!
//! One turn: validate input, check the LLM circuit, snapshot for recovery,
//! submit the budget-trimmed context through the request queue, then either
//! reveal the answer or run the requested tools and go round again.
//!
//! ```text
//! idle → validating → queued → streaming_content → done
//!                       ↑  ↓
//!                     tool_loop
//! (any step) → failed | aborted
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use parley_config::{AppConfig, ContextConfig, TurnConfig};
use parley_core::error::ToolError;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::{Conversation, Message, MessageToolCall, Role};
use parley_core::provider::{Provider, ProviderRequest, ProviderResponse};
use parley_core::tokenizer::{HeuristicTokenizer, Tokenizer};
use parley_core::tool::{ToolInvocation, ToolOutput, ToolTransport};
use parley_queue::{EnqueueOptions, QueueError, RequestQueue};
use parley_reliability::{ClassifiedError, RecoverySnapshot, ReliabilityGovernor, UNAVAILABLE_MESSAGE};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{TrimPolicy, build_context_window, trim_to_budget};
use crate::reveal::{RevealOutcome, reveal};
use crate::stream_event::{TurnEvent, TurnState};
use crate::validate::{InputError, validate_input};

/// Circuit breaker key for completion requests.
pub const LLM_BREAKER_KEY: &str = "llm.complete";

/// Final answer when the model keeps asking for tools past the round limit.
pub const TOOL_ROUNDS_EXCEEDED_MESSAGE: &str =
    "I had to stop after too many tool calls without reaching an answer. Please try narrowing the request.";

/// Everything a turn appended, in order.
#[derive(Debug, Clone, Default)]
pub struct TurnRecord {
    /// User message, assistant tool-call messages, tool results, final reply
    pub messages: Vec<Message>,
    pub invocations: Vec<ToolInvocation>,
    pub tool_rounds: usize,
}

impl TurnRecord {
    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// How a turn ended.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The model produced a final answer
    Completed(TurnRecord),
    /// Input failed validation; nothing was submitted
    Rejected { error: InputError, record: TurnRecord },
    /// The LLM circuit is open; nothing was submitted
    Unavailable(TurnRecord),
    /// The completion request failed after retries
    Failed { error: ClassifiedError, record: TurnRecord },
    /// The caller cancelled the turn
    Aborted { partial: String, record: TurnRecord },
}

impl TurnOutcome {
    pub fn record(&self) -> &TurnRecord {
        match self {
            Self::Completed(record) | Self::Unavailable(record) => record,
            Self::Rejected { record, .. } | Self::Failed { record, .. } | Self::Aborted { record, .. } => record,
        }
    }

    pub fn into_record(self) -> TurnRecord {
        match self {
            Self::Completed(record) | Self::Unavailable(record) => record,
            Self::Rejected { record, .. } | Self::Failed { record, .. } | Self::Aborted { record, .. } => record,
        }
    }

    /// The state the turn machine settled in.
    pub fn state(&self) -> TurnState {
        match self {
            Self::Completed(_) => TurnState::Done,
            Self::Rejected { .. } | Self::Unavailable(_) => TurnState::Idle,
            Self::Failed { .. } => TurnState::Failed,
            Self::Aborted { .. } => TurnState::Aborted,
        }
    }

    /// The last assistant message the user should see, if any.
    pub fn reply(&self) -> Option<&Message> {
        self.record()
            .messages
            .last()
            .filter(|m| m.role == Role::Assistant && m.tool_calls.is_empty())
    }
}

/// Drives turns against the shared queue and governor.
///
/// Cheap to share: every collaborator is behind an `Arc` or a cloneable
/// handle, and `run_turn` takes `&self`.
pub struct TurnOrchestrator {
    provider: Arc<dyn Provider>,
    tools: Arc<dyn ToolTransport>,
    tokenizer: Arc<dyn Tokenizer>,
    queue: RequestQueue,
    governor: Arc<ReliabilityGovernor>,
    event_bus: Arc<EventBus>,
    model: String,
    system_prompt: String,
    temperature: f32,
    max_tokens: Option<u32>,
    context: ContextConfig,
    turn: TurnConfig,
}

impl TurnOrchestrator {
    pub fn new(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<dyn ToolTransport>,
        queue: RequestQueue,
        governor: Arc<ReliabilityGovernor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            tools,
            tokenizer: Arc::new(HeuristicTokenizer),
            queue,
            governor,
            event_bus,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_completion_tokens,
            context: config.context.clone(),
            turn: config.turn.clone(),
        }
    }

    /// Replace the default heuristic tokenizer.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Run one turn for `input` on top of `conversation`.
    ///
    /// Progress is sent on `events`; the caller appends the returned
    /// record's messages to its conversation. Cancelling `cancel` ends the
    /// turn at the next suspension point with [`TurnOutcome::Aborted`].
    pub async fn run_turn(
        &self,
        conversation: &Conversation,
        input: &str,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let session_id = conversation.id.to_string();
        info!(
            session_id = %session_id,
            history = conversation.messages.len(),
            "Processing turn"
        );

        self.transition(events, &session_id, TurnState::Validating).await;
        let input = match validate_input(input, self.turn.max_input_chars) {
            Ok(input) => input,
            Err(error) => {
                debug!(session_id = %session_id, %error, "Input rejected");
                let mut record = TurnRecord::default();
                record.push(Message::assistant(error.to_string()));
                send(events, TurnEvent::Error {
                    message: error.to_string(),
                })
                .await;
                self.transition(events, &session_id, TurnState::Idle).await;
                return TurnOutcome::Rejected { error, record };
            }
        };

        let user = Message::user(input);
        let mut record = TurnRecord::default();
        record.push(user.clone());

        if !self.governor.check_circuit_breaker(LLM_BREAKER_KEY) {
            warn!(session_id = %session_id, key = LLM_BREAKER_KEY, "Circuit open, turn short-circuited");
            self.event_bus.publish(DomainEvent::CircuitRejected {
                key: LLM_BREAKER_KEY.into(),
                timestamp: Utc::now(),
            });
            record.push(Message::assistant(UNAVAILABLE_MESSAGE));
            send(events, TurnEvent::Error {
                message: UNAVAILABLE_MESSAGE.into(),
            })
            .await;
            self.transition(events, &session_id, TurnState::Idle).await;
            return TurnOutcome::Unavailable(record);
        }

        self.governor
            .recovery()
            .save(&RecoverySnapshot::generating(&session_id, conversation.messages.len()));

        let mut working = build_context_window(
            &self.system_prompt,
            &conversation.messages,
            conversation.summary.as_deref(),
            self.context.recent_count,
        );
        working.push(user);
        let tool_definitions = self.tools.definitions();
        let policy = TrimPolicy::from(&self.context);

        loop {
            if cancel.is_cancelled() {
                return self.abort(events, &session_id, String::new(), record).await;
            }
            self.transition(events, &session_id, TurnState::Queued).await;

            let trimmed = trim_to_budget(working.clone(), &tool_definitions, self.tokenizer.as_ref(), &policy);
            let request = ProviderRequest {
                model: self.model.clone(),
                messages: trimmed.messages,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                tools: tool_definitions.clone(),
            };
            debug!(
                session_id = %session_id,
                round = record.tool_rounds,
                tokens = trimmed.tokens_after,
                strategy = ?trimmed.strategy,
                "Submitting completion"
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.abort(events, &session_id, String::new(), record).await;
                }
                result = self.complete(request, &session_id) => result,
            };

            let response = match result {
                Ok(response) => {
                    self.governor.record_success(LLM_BREAKER_KEY);
                    response
                }
                Err(error) => return self.fail(events, &session_id, error, record).await,
            };

            if let Some(usage) = &response.usage {
                self.event_bus.publish(DomainEvent::ResponseGenerated {
                    session_id: session_id.clone(),
                    model: response.model.clone(),
                    tokens_used: usage.total_tokens,
                    timestamp: Utc::now(),
                });
            }

            let message = response.message;
            if message.tool_calls.is_empty() {
                return self
                    .finish_with_content(events, &session_id, message.content, record, cancel)
                    .await;
            }

            if record.tool_rounds >= self.turn.max_tool_rounds as usize {
                warn!(
                    session_id = %session_id,
                    rounds = record.tool_rounds,
                    "Max tool rounds reached, finalizing turn"
                );
                return self
                    .finish_with_content(events, &session_id, TOOL_ROUNDS_EXCEEDED_MESSAGE.into(), record, cancel)
                    .await;
            }

            self.transition(events, &session_id, TurnState::ToolLoop).await;
            debug!(
                session_id = %session_id,
                tool_count = message.tool_calls.len(),
                "Executing tool calls"
            );

            let started: Vec<ToolInvocation> = message.tool_calls.iter().map(start_invocation).collect();
            working.push(message.clone());
            record.push(message);

            let settled = match self.run_tools(started, events, cancel).await {
                ToolRound::Settled(settled) => settled,
                ToolRound::Cancelled(invocations) => {
                    record.invocations.extend(invocations);
                    return self.abort(events, &session_id, String::new(), record).await;
                }
            };

            for invocation in settled {
                let result = Message::tool_result(&invocation.id, invocation.message_content());
                working.push(result.clone());
                record.push(result);
                record.invocations.push(invocation);
            }
            record.tool_rounds += 1;
        }
    }

    /// Submit one completion through the queue, retrying per the governor.
    async fn complete(&self, request: ProviderRequest, session_id: &str) -> Result<ProviderResponse, ClassifiedError> {
        let options = EnqueueOptions::new()
            .with_priority(self.turn.llm_priority)
            .with_max_retries(0)
            .with_timeout(self.turn.llm_timeout())
            .with_id(format!("llm-{session_id}"));

        let attempt = || {
            let provider = self.provider.clone();
            let request = request.clone();
            let enqueued = self.queue.enqueue(
                move || {
                    let provider = provider.clone();
                    let request = request.clone();
                    async move { provider.complete(request).await }
                },
                options.clone(),
            );
            async move { enqueued.await.map_err(|e| queue_error_text(&e)) }
        };

        self.governor
            .retry(attempt, LLM_BREAKER_KEY, self.turn.llm_max_retries + 1)
            .await
            .map_err(|e| e.classified().clone())
    }

    /// Run every call of one model turn concurrently; results keep call order.
    ///
    /// On cancellation, calls that already settled keep their result and
    /// only those still in flight are marked cancelled.
    async fn run_tools(
        &self,
        started: Vec<ToolInvocation>,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> ToolRound {
        let mut slots: Vec<Option<ToolInvocation>> = started.iter().map(|_| None).collect();
        let mut in_flight: FuturesUnordered<_> = started
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, inv)| self.execute_tool(inv, events).map(move |inv| (idx, inv)))
            .collect();

        let cancelled = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                next = in_flight.next() => match next {
                    Some((idx, invocation)) => slots[idx] = Some(invocation),
                    None => break false,
                },
            }
        };
        drop(in_flight);

        let invocations = started
            .into_iter()
            .zip(slots)
            .map(|(mut pending, slot)| {
                slot.unwrap_or_else(|| {
                    pending.fail("cancelled");
                    pending
                })
            })
            .collect();
        if cancelled {
            ToolRound::Cancelled(invocations)
        } else {
            ToolRound::Settled(invocations)
        }
    }

    async fn execute_tool(&self, mut invocation: ToolInvocation, events: &mpsc::Sender<TurnEvent>) -> ToolInvocation {
        let arguments = match parse_arguments(&invocation.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(tool = %invocation.name, error = %e, "Invalid tool arguments");
                invocation.fail(format!("Invalid tool arguments: {e}"));
                self.report_tool(events, &invocation, Duration::ZERO).await;
                return invocation;
            }
        };

        send(events, TurnEvent::ToolCall {
            id: invocation.id.clone(),
            name: invocation.name.clone(),
            input: arguments.clone(),
        })
        .await;

        let tools = self.tools.clone();
        let name = invocation.name.clone();
        let options = EnqueueOptions::new()
            .with_priority(self.turn.tool_priority)
            .with_max_retries(self.turn.tool_max_retries)
            .with_timeout(self.turn.tool_timeout())
            .with_id(format!("tool-{}", invocation.id));

        let start = Instant::now();
        let result = self
            .queue
            .enqueue(
                move || {
                    let tools = tools.clone();
                    let name = name.clone();
                    let arguments = arguments.clone();
                    async move {
                        match tools.execute(&name, arguments).await {
                            // Unknown tools fail once, without queue retries
                            Err(e @ ToolError::NotFound(_)) => Ok(ToolOutput::error(e.to_string())),
                            other => other,
                        }
                    }
                },
                options,
            )
            .await;

        match result {
            Ok(ToolOutput {
                content,
                is_error: false,
            }) => invocation.succeed(content),
            Ok(ToolOutput { content, .. }) => invocation.fail(content),
            Err(e) => invocation.fail(queue_error_text(&e)),
        }
        self.report_tool(events, &invocation, start.elapsed()).await;
        invocation
    }

    async fn report_tool(&self, events: &mpsc::Sender<TurnEvent>, invocation: &ToolInvocation, elapsed: Duration) {
        let success = !invocation.is_error();
        debug!(
            tool = %invocation.name,
            success,
            duration_ms = elapsed.as_millis() as u64,
            "Tool call settled"
        );
        self.event_bus.publish(DomainEvent::ToolExecuted {
            tool_name: invocation.name.clone(),
            success,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        });
        send(events, TurnEvent::ToolResult {
            id: invocation.id.clone(),
            name: invocation.name.clone(),
            output: invocation.message_content(),
            success,
        })
        .await;
    }

    async fn finish_with_content(
        &self,
        events: &mpsc::Sender<TurnEvent>,
        session_id: &str,
        content: String,
        mut record: TurnRecord,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        if !content.is_empty() {
            self.transition(events, session_id, TurnState::StreamingContent).await;
            let outcome = reveal(
                &content,
                self.turn.reveal_chunk_chars,
                self.turn.reveal_interval(),
                events,
                cancel,
            )
            .await;
            if let RevealOutcome::Aborted { revealed } = outcome {
                return self.abort(events, session_id, revealed, record).await;
            }
        }

        record.push(Message::assistant(content.clone()));
        self.governor.recovery().clear();
        self.transition(events, session_id, TurnState::Done).await;
        info!(
            session_id,
            tool_rounds = record.tool_rounds,
            tool_calls = record.invocations.len(),
            "Turn completed"
        );
        send(events, TurnEvent::Done {
            session_id: session_id.to_string(),
            content,
            tool_rounds: record.tool_rounds,
            tool_calls_made: record.invocations.len(),
        })
        .await;
        TurnOutcome::Completed(record)
    }

    async fn fail(
        &self,
        events: &mpsc::Sender<TurnEvent>,
        session_id: &str,
        error: ClassifiedError,
        mut record: TurnRecord,
    ) -> TurnOutcome {
        self.governor.record_failure(LLM_BREAKER_KEY);
        warn!(
            session_id,
            kind = %error.kind,
            error = %error.detail,
            "Turn failed"
        );
        self.event_bus.publish(DomainEvent::TurnFailed {
            session_id: session_id.to_string(),
            kind: error.kind.to_string(),
            error_message: error.detail.clone(),
            timestamp: Utc::now(),
        });

        record.push(Message::assistant(error.user_message));
        self.transition(events, session_id, TurnState::Failed).await;
        send(events, TurnEvent::Error {
            message: error.user_message.into(),
        })
        .await;
        TurnOutcome::Failed { error, record }
    }

    async fn abort(
        &self,
        events: &mpsc::Sender<TurnEvent>,
        session_id: &str,
        partial: String,
        mut record: TurnRecord,
    ) -> TurnOutcome {
        info!(session_id, revealed = partial.len(), "Turn aborted");
        self.governor.recovery().clear();
        self.event_bus.publish(DomainEvent::TurnAborted {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        });

        if !partial.is_empty() {
            record.push(Message::assistant(partial.clone()));
        }
        self.transition(events, session_id, TurnState::Aborted).await;
        send(events, TurnEvent::Aborted {
            partial: partial.clone(),
        })
        .await;
        TurnOutcome::Aborted { partial, record }
    }

    async fn transition(&self, events: &mpsc::Sender<TurnEvent>, session_id: &str, state: TurnState) {
        debug!(session_id, ?state, "Turn state");
        send(events, TurnEvent::State { state }).await;
    }
}

/// Invocations of one tool round, in call order.
enum ToolRound {
    Settled(Vec<ToolInvocation>),
    Cancelled(Vec<ToolInvocation>),
}

/// The receiver may be gone; the turn carries on regardless.
async fn send(events: &mpsc::Sender<TurnEvent>, event: TurnEvent) {
    let _ = events.send(event).await;
}

fn start_invocation(call: &MessageToolCall) -> ToolInvocation {
    ToolInvocation::start(&call.id, &call.name, &call.arguments)
}

/// Empty arguments mean "no arguments".
fn parse_arguments(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}

/// Prefer the task's own error over the queue's wrapper.
fn queue_error_text(error: &QueueError) -> String {
    error
        .task_error()
        .map(|e| e.to_string())
        .unwrap_or_else(|| error.to_string())
}

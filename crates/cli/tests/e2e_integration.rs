//! End-to-end integration tests for the Parley orchestration core.
//!
//! These tests wire the real queue, governor and orchestrator together with
//! scripted collaborators and drive full turns from user input to outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_agent::context::TRUNCATION_MARKER;
use parley_agent::{LLM_BREAKER_KEY, TurnEvent, TurnOrchestrator, TurnOutcome};
use parley_config::AppConfig;
use parley_core::error::{ProviderError, ToolError};
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::{Conversation, Message, MessageToolCall, Role};
use parley_core::provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
use parley_core::storage::InMemoryStore;
use parley_core::tokenizer::{HeuristicTokenizer, Tokenizer};
use parley_core::tool::{Tool, ToolOutput, ToolRegistry, ToolTransport};
use parley_queue::RequestQueue;
use parley_reliability::{CircuitState, ReliabilityGovernor, UNAVAILABLE_MESSAGE};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ── Mock Provider ────────────────────────────────────────────────────────

type Reply = Result<ProviderResponse, ProviderError>;

/// A mock provider that returns scripted replies in sequence.
struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, n: usize) -> ProviderRequest {
        self.requests.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let mut replies = self.replies.lock().unwrap();
        match replies.pop_front() {
            Some(reply) => reply,
            None => panic!("ScriptedProvider exhausted"),
        }
    }
}

fn text_response(text: &str) -> Reply {
    Ok(ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock".into(),
    })
}

fn tool_response(tool_calls: Vec<MessageToolCall>) -> Reply {
    Ok(ProviderResponse {
        message: Message::assistant_with_tools("", tool_calls),
        usage: None,
        model: "mock".into(),
    })
}

fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

// ── Mock Tools ───────────────────────────────────────────────────────────

/// Sleeps 100 ms per call and tracks how many calls overlap.
#[derive(Default)]
struct SlowTransport {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ToolTransport for SlowTransport {
    async fn execute(&self, name: &str, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolOutput::ok(format!("{name} done")))
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

/// Returns `size` characters of filler.
struct DumpTool;

#[async_trait]
impl Tool for DumpTool {
    fn name(&self) -> &str {
        "dump"
    }

    fn description(&self) -> &str {
        "Dump a large blob"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"size": {"type": "integer"}}})
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let size = arguments["size"].as_u64().unwrap_or(10) as usize;
        Ok(ToolOutput::ok("x".repeat(size)))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Stack {
    orchestrator: TurnOrchestrator,
    queue: RequestQueue,
    governor: Arc<ReliabilityGovernor>,
    event_bus: Arc<EventBus>,
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.system_prompt = "You are a test assistant.".into();
    config
}

fn stack(config: AppConfig, provider: Arc<ScriptedProvider>, tools: Arc<dyn ToolTransport>) -> Stack {
    let queue = RequestQueue::new(config.queue.clone());
    let governor = Arc::new(ReliabilityGovernor::new(
        &config.reliability,
        Arc::new(InMemoryStore::new()),
    ));
    let event_bus = Arc::new(EventBus::default());
    let orchestrator = TurnOrchestrator::new(
        &config,
        provider,
        tools,
        queue.clone(),
        governor.clone(),
        event_bus.clone(),
    );
    Stack {
        orchestrator,
        queue,
        governor,
        event_bus,
    }
}

async fn turn(stack: &Stack, conversation: &Conversation, input: &str) -> (TurnOutcome, Vec<TurnEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let outcome = stack
        .orchestrator
        .run_turn(conversation, input, &tx, &CancellationToken::new())
        .await;
    drop(tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (outcome, events)
}

// ── E2E: Tool Loop ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn e2e_two_tool_calls_run_concurrently() {
    let provider = ScriptedProvider::new(vec![
        tool_response(vec![
            make_tool_call("c1", "weather", serde_json::json!({"city": "Oslo"})),
            make_tool_call("c2", "weather", serde_json::json!({"city": "Lima"})),
        ]),
        text_response("Both done."),
    ]);
    let transport = Arc::new(SlowTransport::default());
    let stack = stack(test_config(), provider.clone(), transport.clone());

    let start = Instant::now();
    let (outcome, events) = turn(&stack, &Conversation::new(), "weather in Oslo and Lima?").await;
    let elapsed = start.elapsed();

    let TurnOutcome::Completed(record) = &outcome else {
        panic!("expected Completed, got {outcome:?}");
    };
    assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
    // Serial execution would need 200 ms for the tools alone
    assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");

    let continuation = provider.request(1).messages;
    let call_index = continuation
        .iter()
        .position(|m| m.tool_calls.len() == 2)
        .expect("assistant tool-call message");
    let after: Vec<&Message> = continuation[call_index + 1..].iter().collect();
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|m| m.role == Role::Tool));
    assert_eq!(after[0].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(after[1].tool_call_id.as_deref(), Some("c2"));

    assert_eq!(record.invocations.len(), 2);
    assert!(record.invocations.iter().all(|i| !i.running && !i.is_error()));
    let results = events
        .iter()
        .filter(|e| matches!(e, TurnEvent::ToolResult { .. }))
        .count();
    assert_eq!(results, 2);
}

#[tokio::test(start_paused = true)]
async fn e2e_registry_transport_and_unknown_tool() {
    let provider = ScriptedProvider::new(vec![
        tool_response(vec![
            make_tool_call("c1", "dump", serde_json::json!({"size": 12})),
            make_tool_call("c2", "missing", serde_json::json!({})),
        ]),
        text_response("Done."),
    ]);
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(DumpTool));
    let stack = stack(test_config(), provider.clone(), Arc::new(registry));

    let (outcome, _) = turn(&stack, &Conversation::new(), "dump it").await;

    let record = outcome.record();
    assert_eq!(record.invocations[0].result.as_deref(), Some("xxxxxxxxxxxx"));
    // Unknown tool: folded back as a tool error on the first attempt
    let missing = &record.invocations[1];
    assert!(missing.error.as_deref().unwrap().contains("Tool not found"));
    assert!(matches!(outcome, TurnOutcome::Completed(_)));

    let advertised = provider.request(0).tools;
    assert_eq!(advertised.len(), 1);
    assert_eq!(advertised[0].name, "dump");

    let metrics = stack.queue.metrics().await.unwrap();
    assert_eq!(metrics.retried, 0);
    assert_eq!(metrics.failed, 0);
}

// ── E2E: Context Budget ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn e2e_large_tool_output_is_truncated_before_continuation() {
    let mut config = test_config();
    config.context.max_tokens = 300;
    config.context.reserved_tokens = 50;
    config.context.tool_output_cap = 40;
    config.context.aggressive_tool_output_cap = 20;

    let provider = ScriptedProvider::new(vec![
        tool_response(vec![make_tool_call("c1", "dump", serde_json::json!({"size": 4000}))]),
        text_response("That was a lot of x."),
    ]);
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(DumpTool));
    let stack = stack(config, provider.clone(), Arc::new(registry));

    let (outcome, _) = turn(&stack, &Conversation::new(), "dump a lot").await;

    // The record keeps the full output; only the request is trimmed
    let full = outcome.record().messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(full.content.len(), 4000);

    let continuation = provider.request(1).messages;
    let tool_msg = continuation.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.content.ends_with(TRUNCATION_MARKER));
    assert!(HeuristicTokenizer.count_tokens(&tool_msg.content) <= 40);
    assert_eq!(continuation[0].role, Role::System);
}

#[tokio::test(start_paused = true)]
async fn e2e_follow_up_turn_sees_previous_exchange() {
    let provider = ScriptedProvider::new(vec![text_response("Paris."), text_response("About 2 million.")]);
    let stack = stack(test_config(), provider.clone(), Arc::new(SlowTransport::default()));

    let mut conversation = Conversation::new();
    let (first, _) = turn(&stack, &conversation, "Capital of France?").await;
    conversation.extend(first.into_record().messages);
    let (second, _) = turn(&stack, &conversation, "Population?").await;

    assert!(matches!(second, TurnOutcome::Completed(_)));
    let contents: Vec<String> = provider
        .request(1)
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(
        contents,
        [
            "You are a test assistant.",
            "Capital of France?",
            "Paris.",
            "Population?"
        ]
    );
}

// ── E2E: Reliability ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn e2e_breaker_opens_then_recovers_through_half_open_probe() {
    let mut config = test_config();
    config.reliability.failure_threshold = 2;
    let provider = ScriptedProvider::new(vec![
        Err(ProviderError::AuthenticationFailed("expired key".into())),
        Err(ProviderError::AuthenticationFailed("expired key".into())),
        text_response("Back online."),
    ]);
    let stack = stack(config, provider.clone(), Arc::new(SlowTransport::default()));
    let conversation = Conversation::new();

    for _ in 0..2 {
        let (outcome, _) = turn(&stack, &conversation, "hello").await;
        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
    }
    assert_eq!(stack.governor.circuit_state(LLM_BREAKER_KEY), CircuitState::Open);

    let (outcome, events) = turn(&stack, &conversation, "hello?").await;
    assert!(matches!(outcome, TurnOutcome::Unavailable(_)));
    assert_eq!(provider.calls(), 2);
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Error { message } if message == UNAVAILABLE_MESSAGE)));

    tokio::time::advance(Duration::from_secs(61)).await;

    let (outcome, _) = turn(&stack, &conversation, "anyone there?").await;
    assert!(matches!(outcome, TurnOutcome::Completed(_)));
    assert_eq!(provider.calls(), 3);
    assert_eq!(stack.governor.circuit_state(LLM_BREAKER_KEY), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn e2e_recovery_snapshot_marks_failed_turn_until_next_success() {
    let provider = ScriptedProvider::new(vec![
        Err(ProviderError::ModelNotFound("gpt-missing".into())),
        text_response("Recovered."),
    ]);
    let stack = stack(test_config(), provider, Arc::new(SlowTransport::default()));
    let mut conversation = Conversation::new();
    conversation.push(Message::user("earlier"));
    conversation.push(Message::assistant("reply"));

    let (outcome, _) = turn(&stack, &conversation, "hello").await;
    assert!(matches!(outcome, TurnOutcome::Failed { .. }));

    let snapshot = stack.governor.recovery().load().expect("snapshot kept after failure");
    assert_eq!(snapshot.session_id, conversation.id.to_string());
    assert_eq!(snapshot.last_message_index, 2);
    assert!(snapshot.was_generating);

    let (outcome, _) = turn(&stack, &conversation, "hello again").await;
    assert!(matches!(outcome, TurnOutcome::Completed(_)));
    assert!(stack.governor.recovery().load().is_none());
}

#[tokio::test(start_paused = true)]
async fn e2e_concurrent_turns_share_one_queue() {
    let mut config = test_config();
    config.queue.max_concurrent = 1;
    let provider = ScriptedProvider::new(vec![text_response("one"), text_response("two")]);
    let stack = stack(config, provider, Arc::new(SlowTransport::default()));
    let mut bus = stack.event_bus.subscribe();

    let a = Conversation::new();
    let b = Conversation::new();
    let ((first, _), (second, _)) = tokio::join!(turn(&stack, &a, "first"), turn(&stack, &b, "second"));

    assert!(matches!(first, TurnOutcome::Completed(_)));
    assert!(matches!(second, TurnOutcome::Completed(_)));

    let metrics = stack.queue.metrics().await.unwrap();
    assert_eq!(metrics.submitted, 2);
    assert_eq!(metrics.succeeded, 2);
    assert_eq!(metrics.execution.len(), 2);

    let mut generated = 0;
    while let Ok(event) = bus.try_recv() {
        if let DomainEvent::ResponseGenerated { tokens_used, .. } = *event {
            assert_eq!(tokens_used, 15);
            generated += 1;
        }
    }
    assert_eq!(generated, 2);
}

// ── E2E: Cancellation ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn e2e_cancel_while_tools_run_aborts_the_turn() {
    let provider = ScriptedProvider::new(vec![tool_response(vec![make_tool_call(
        "c1",
        "slow",
        serde_json::json!({}),
    )])]);
    let stack = stack(test_config(), provider.clone(), Arc::new(SlowTransport::default()));
    let (tx, _rx) = mpsc::channel(1024);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = stack
        .orchestrator
        .run_turn(&Conversation::new(), "run the slow tool", &tx, &cancel)
        .await;

    let TurnOutcome::Aborted { partial, record } = &outcome else {
        panic!("expected Aborted, got {outcome:?}");
    };
    assert!(partial.is_empty());
    assert_eq!(record.invocations.len(), 1);
    assert_eq!(record.invocations[0].error.as_deref(), Some("cancelled"));
    assert_eq!(provider.calls(), 1);
    assert!(stack.governor.recovery().load().is_none());
    assert_eq!(stack.governor.circuit_state(LLM_BREAKER_KEY), CircuitState::Closed);
}

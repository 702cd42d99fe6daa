//! `parley chat`: Run turns offline against a scripted provider.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parley_agent::{TurnEvent, TurnOrchestrator, TurnOutcome, TurnState, should_summarize};
use parley_core::event::EventBus;
use parley_core::message::{Conversation, ConversationId};
use parley_core::tool::ToolRegistry;
use parley_queue::{QueueMetrics, RequestQueue};
use parley_reliability::ReliabilityGovernor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commands::config_cmd;
use crate::script::{EchoTool, ScriptedProvider};
use crate::store::FileStore;

/// Turns allowed per session per minute.
const TURNS_PER_MINUTE: u32 = 30;

pub struct ChatArgs {
    pub script: PathBuf,
    pub messages: Vec<String>,
    pub session: Option<String>,
    pub summary: Option<String>,
    pub config: Option<PathBuf>,
}

pub async fn run(args: ChatArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = config_cmd::load(args.config.as_deref())?;
    let provider = Arc::new(ScriptedProvider::from_file(&args.script)?);

    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));

    let queue = RequestQueue::new(config.queue.clone());
    let governor = Arc::new(ReliabilityGovernor::new(
        &config.reliability,
        Arc::new(FileStore::in_temp_dir()),
    ));
    let event_bus = Arc::new(EventBus::default());

    if let Some(snapshot) = governor.recovery().load() {
        eprintln!(
            "  Note: a turn in session {} (message {}) was interrupted at {}",
            snapshot.session_id, snapshot.last_message_index, snapshot.saved_at
        );
    }

    let orchestrator = TurnOrchestrator::new(
        &config,
        provider.clone(),
        Arc::new(registry),
        queue.clone(),
        governor.clone(),
        event_bus,
    );

    let mut conversation = Conversation::new();
    if let Some(id) = &args.session {
        conversation.id = ConversationId::from(id);
    }
    conversation.summary = args.summary;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    println!();
    println!("  Session:  {}", conversation.id);
    println!("  Model:    {}", config.model);
    println!();

    for message in &args.messages {
        let limit_key = format!("turns:{}", conversation.id);
        if !governor.check_limit(&limit_key, TURNS_PER_MINUTE, Duration::from_secs(60)) {
            eprintln!("  [Rate limited] Too many turns this minute, skipping the rest.");
            break;
        }

        println!("  You > {message}");
        let (tx, mut rx) = mpsc::channel(128);
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                render(&event);
            }
        });

        let outcome = orchestrator.run_turn(&conversation, message, &tx, &cancel).await;
        drop(tx);
        let _ = printer.await;

        report(&outcome);
        let stop = matches!(outcome, TurnOutcome::Aborted { .. });
        conversation.extend(outcome.into_record().messages);

        if should_summarize(conversation.messages.len(), config.context.summarize_threshold) {
            println!(
                "  [{} messages: summarization checkpoint reached]",
                conversation.messages.len()
            );
        }
        if stop {
            break;
        }
    }

    let metrics = queue.metrics().await?;
    print_metrics(&metrics);
    if provider.remaining() > 0 {
        println!("  Unused script steps: {}", provider.remaining());
    }
    println!();

    Ok(())
}

fn render(event: &TurnEvent) {
    match event {
        TurnEvent::State { state } => {
            if *state == TurnState::StreamingContent {
                print!("  Assistant > ");
            }
            tracing::debug!(?state, "state");
        }
        TurnEvent::Chunk { content } => {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
        TurnEvent::ToolCall { name, input, .. } => {
            println!("  [tool] {name} {input}");
        }
        TurnEvent::ToolResult {
            name,
            output,
            success,
            ..
        } => {
            let mark = if *success { "ok" } else { "failed" };
            println!("  [tool] {name} {mark}: {output}");
        }
        TurnEvent::Done { .. } => println!(),
        TurnEvent::Error { message } => println!("  Assistant > {message}"),
        TurnEvent::Aborted { .. } => println!("\n  [Aborted]"),
    }
}

fn report(outcome: &TurnOutcome) {
    let record = outcome.record();
    match outcome {
        TurnOutcome::Completed(_) => {}
        TurnOutcome::Rejected { error, .. } => eprintln!("  [Rejected] {error}"),
        TurnOutcome::Unavailable(_) => eprintln!("  [Unavailable] circuit open"),
        TurnOutcome::Failed { error, .. } => {
            eprintln!("  [Failed] {} error: {}", error.kind, error.detail)
        }
        TurnOutcome::Aborted { partial, .. } => {
            eprintln!("  [Aborted] after {} characters", partial.chars().count())
        }
    }
    if !record.invocations.is_empty() {
        println!(
            "  Tool calls: {} in {} round(s)",
            record.invocations.len(),
            record.tool_rounds
        );
    }
    println!();
}

fn print_metrics(metrics: &QueueMetrics) {
    println!("  Queue");
    println!(
        "    submitted {}  succeeded {}  failed {}  retried {}  timed out {}  rejected {}",
        metrics.submitted,
        metrics.succeeded,
        metrics.failed,
        metrics.retried,
        metrics.timed_out,
        metrics.rejected
    );
    println!(
        "    avg wait {:?}  avg execution {:?}",
        metrics.avg_wait(),
        metrics.avg_execution()
    );
}

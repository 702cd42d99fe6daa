//! Turn orchestration for Parley.
//!
//! A turn takes one user message to a final assistant answer:
//!
//! 1. **Validate** the input (length, control characters)
//! 2. **Check** the LLM circuit breaker and snapshot for crash recovery
//! 3. **Build context**: system prompt, optional summary, recent history,
//!    trimmed to the token budget
//! 4. **Submit** the completion through the shared request queue
//! 5. **If tool calls**: run them concurrently through the queue, fold the
//!    results back and go to step 3
//! 6. **If text**: reveal it in chunks and finish
//!
//! Progress streams out as [`TurnEvent`]s; the caller cancels with a
//! `CancellationToken`.

pub mod context;
pub mod reveal;
pub mod stream_event;
pub mod turn;
pub mod validate;

pub use context::{TrimOutcome, TrimPolicy, TrimStrategy, build_context_window, should_summarize, trim_to_budget};
pub use reveal::{RevealOutcome, reveal};
pub use stream_event::{TurnEvent, TurnState};
pub use turn::{LLM_BREAKER_KEY, TOOL_ROUNDS_EXCEEDED_MESSAGE, TurnOrchestrator, TurnOutcome, TurnRecord};
pub use validate::{InputError, validate_input};

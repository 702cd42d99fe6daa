//! Token-budget trimming.
//!
//! Run before every submission. Cheapest loss first:
//!
//! | Step | Action |
//! |------|--------|
//! | 1 | Under budget: send as is |
//! | 2 | Truncate oversized tool output to `tool_output_cap` |
//! | 3 | Truncate tool output again to `aggressive_tool_output_cap` |
//! | 4 | Keep the system message plus the newest messages that fit |
//! | 5 | System message plus the single newest message |

use parley_config::ContextConfig;
use parley_core::message::{Message, Role};
use parley_core::provider::ToolDefinition;
use parley_core::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Appended to tool output cut short by trimming.
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Budget limits for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimPolicy {
    pub max_tokens: usize,
    /// Kept free for the completion when dropping history
    pub reserved_tokens: usize,
    pub tool_output_cap: usize,
    pub aggressive_tool_output_cap: usize,
}

impl From<&ContextConfig> for TrimPolicy {
    fn from(config: &ContextConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            reserved_tokens: config.reserved_tokens,
            tool_output_cap: config.tool_output_cap,
            aggressive_tool_output_cap: config.aggressive_tool_output_cap,
        }
    }
}

/// Which step produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimStrategy {
    Unchanged,
    ToolOutputCompressed,
    HistoryDropped,
    Minimal,
}

#[derive(Debug, Clone)]
pub struct TrimOutcome {
    pub messages: Vec<Message>,
    pub strategy: TrimStrategy,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Fit `messages` (plus `tools`) into the policy's budget.
pub fn trim_to_budget(
    messages: Vec<Message>,
    tools: &[ToolDefinition],
    tokenizer: &dyn Tokenizer,
    policy: &TrimPolicy,
) -> TrimOutcome {
    let tokens_before = tokenizer.estimate_context_tokens(&messages, tools).total;
    if tokens_before <= policy.max_tokens {
        return TrimOutcome {
            messages,
            strategy: TrimStrategy::Unchanged,
            tokens_before,
            tokens_after: tokens_before,
        };
    }

    let mut messages = messages;
    for cap in [policy.tool_output_cap, policy.aggressive_tool_output_cap] {
        if !compress_tool_output(&mut messages, tokenizer, cap) {
            continue;
        }
        let total = tokenizer.estimate_context_tokens(&messages, tools).total;
        debug!(cap, tokens_before, tokens_after = total, "Compressed tool output");
        if total <= policy.max_tokens {
            return TrimOutcome {
                messages,
                strategy: TrimStrategy::ToolOutputCompressed,
                tokens_before,
                tokens_after: total,
            };
        }
    }

    let (messages, strategy) = drop_history(messages, tokenizer, policy);
    let tokens_after = tokenizer.estimate_context_tokens(&messages, tools).total;
    debug!(
        ?strategy,
        tokens_before,
        tokens_after,
        kept = messages.len(),
        "Dropped history to fit budget"
    );
    TrimOutcome {
        messages,
        strategy,
        tokens_before,
        tokens_after,
    }
}

/// Truncate every tool message over `cap`. Returns whether anything changed.
fn compress_tool_output(messages: &mut [Message], tokenizer: &dyn Tokenizer, cap: usize) -> bool {
    let mut changed = false;
    for message in messages.iter_mut().filter(|m| m.role == Role::Tool) {
        if tokenizer.count_tokens(&message.content) > cap {
            message.content = truncate_to_tokens(&message.content, cap, tokenizer);
            changed = true;
        }
    }
    changed
}

fn drop_history(
    messages: Vec<Message>,
    tokenizer: &dyn Tokenizer,
    policy: &TrimPolicy,
) -> (Vec<Message>, TrimStrategy) {
    let budget = policy.max_tokens.saturating_sub(policy.reserved_tokens);

    let mut history = messages;
    let system = if history.first().is_some_and(|m| m.role == Role::System) {
        Some(history.remove(0))
    } else {
        None
    };
    history.retain(|m| m.role != Role::System);

    let mut used = system.as_ref().map_or(0, |m| tokenizer.count_message(m));
    let mut selected = Vec::new();
    for message in history.iter().rev() {
        let cost = tokenizer.count_message(message);
        if used + cost > budget {
            break;
        }
        used += cost;
        selected.push(message.clone());
    }
    selected.reverse();

    // A tool result is only valid after the assistant message that requested it
    while selected.len() > 1 && selected[0].role == Role::Tool {
        selected.remove(0);
    }

    let strategy = if selected.is_empty() {
        selected.extend(history.pop());
        TrimStrategy::Minimal
    } else {
        TrimStrategy::HistoryDropped
    };

    let mut out = Vec::with_capacity(selected.len() + 1);
    out.extend(system);
    out.extend(selected);
    (out, strategy)
}

/// Cut `content` so that it, marker included, counts at most `cap` tokens.
///
/// Bisects over character boundaries, so multi-byte text is never split
/// mid-character. When even the bare marker exceeds `cap`, the marker is
/// left off.
pub fn truncate_to_tokens(content: &str, cap: usize, tokenizer: &dyn Tokenizer) -> String {
    if tokenizer.count_tokens(content) <= cap {
        return content.to_string();
    }

    let marker = if tokenizer.count_tokens(TRUNCATION_MARKER) <= cap {
        TRUNCATION_MARKER
    } else {
        ""
    };
    let boundaries: Vec<usize> = content
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(content.len()))
        .collect();
    let candidate = |chars: usize| format!("{}{marker}", &content[..boundaries[chars]]);

    // Largest prefix length that still fits; zero chars always fits
    let (mut lo, mut hi) = (0, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if tokenizer.count_tokens(&candidate(mid)) <= cap {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    candidate(lo)
}

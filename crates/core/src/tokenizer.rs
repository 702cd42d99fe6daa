//! Token counting boundary.
//!
//! The context builder only needs deterministic counts, so any tokenizer
//! can sit behind [`Tokenizer`]. [`HeuristicTokenizer`] is the built-in
//! fallback: ~4 characters per token, accurate within ~10% for BPE
//! tokenizers on English text.

use serde::{Deserialize, Serialize};
use crate::message::Message;
use crate::provider::ToolDefinition;

/// Per-message overhead for role name, delimiters and wire formatting.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token totals for a prospective request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub total: usize,
    pub messages: usize,
    pub tools: usize,
}

/// Deterministic, pure token counting.
pub trait Tokenizer: Send + Sync {
    /// Count tokens in a raw string.
    fn count_tokens(&self, text: &str) -> usize;

    /// Count tokens for a single message including per-message overhead.
    fn count_message(&self, message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| self.count_tokens(&c.name) + self.count_tokens(&c.arguments))
            .sum();
        MESSAGE_OVERHEAD_TOKENS + self.count_tokens(&message.content) + calls
    }

    /// Count tokens for a tool definition (serialized as JSON).
    fn count_tool(&self, tool: &ToolDefinition) -> usize {
        let json = serde_json::to_string(tool).unwrap_or_default();
        self.count_tokens(&json)
    }

    /// Estimate the full request size: messages plus tool definitions.
    fn estimate_context_tokens(&self, messages: &[Message], tools: &[ToolDefinition]) -> TokenEstimate {
        let messages: usize = messages.iter().map(|m| self.count_message(m)).sum();
        let tools: usize = tools.iter().map(|t| self.count_tool(t)).sum();
        TokenEstimate {
            total: messages + tools,
            messages,
            tools,
        }
    }
}

/// Character-based estimate: 1 token ≈ 4 characters, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        text.chars().count().div_ceil(4)
    }
}

//! # Parley Core
//!
//! Domain types, collaborator traits, and error definitions for the Parley
//! conversational orchestration core.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (LLM completion API, tool transport,
//! tokenizer, ephemeral storage) is a trait here. The queue, governor and
//! turn orchestrator are written against these traits, which keeps them
//! testable with scripted stand-ins and keeps the dependency graph pointing
//! inward at this crate.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod storage;
pub mod tokenizer;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, StorageError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use storage::{EphemeralStore, InMemoryStore};
pub use tokenizer::{HeuristicTokenizer, TokenEstimate, Tokenizer};
pub use tool::{Tool, ToolInvocation, ToolOutput, ToolRegistry, ToolTransport};

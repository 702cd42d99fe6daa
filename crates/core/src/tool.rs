//! Tool execution boundary.
//!
//! The orchestrator never runs tool business logic itself. It hands a tool
//! name and parsed JSON arguments to a [`ToolTransport`] and folds whatever
//! comes back into the conversation. [`ToolRegistry`] is the in-process
//! transport: it dispatches to registered [`Tool`] implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// What a tool sent back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The output content (or error text when `is_error` is set)
    pub content: String,

    /// Whether the tool reported a failure
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// The tool execution collaborator.
///
/// An `Err` means the transport could not deliver the call at all; the
/// request queue retries those. A delivered call that failed is an
/// `Ok(ToolOutput { is_error: true, .. })` and is not retried.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Execute the named tool with already-parsed JSON arguments.
    async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Tool definitions to advertise to the LLM.
    fn definitions(&self) -> Vec<ToolDefinition>;
}

/// A single in-process tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of in-process tools, usable as a [`ToolTransport`].
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for ToolRegistry {
    async fn execute(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolOutput, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(arguments).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

/// Audit record of one tool call requested by the model during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// The model's tool call ID
    pub id: String,

    /// Tool name
    pub name: String,

    /// Raw JSON arguments as the model sent them
    pub arguments: String,

    /// True until the queued execution settles
    pub running: bool,

    /// Tool output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Error text when the tool failed or could not be reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolInvocation {
    /// Start tracking a call.
    pub fn start(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            running: true,
            result: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Settle with a successful result.
    pub fn succeed(&mut self, result: impl Into<String>) {
        self.running = false;
        self.result = Some(result.into());
        self.finished_at = Some(Utc::now());
    }

    /// Settle with an error.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.running = false;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The content folded back into the conversation as a tool-role message.
    pub fn message_content(&self) -> String {
        match (&self.result, &self.error) {
            (_, Some(err)) => format!("Error: {err}"),
            (Some(out), None) => out.clone(),
            (None, None) => String::new(),
        }
    }
}

//! Offline collaborators for `parley chat`.
//!
//! A script is a JSON array of provider replies, consumed one per
//! completion request:
//!
//! ```json
//! [
//!   {"content": "", "tool_calls": [{"name": "echo", "arguments": {"text": "hi"}}]},
//!   {"error": "upstream overloaded", "status": 503},
//!   {"content": "The tool said hi."}
//! ]
//! ```
//!
//! `arguments` may be a JSON value or a raw string (sent to the model layer
//! as-is, so malformed arguments can be scripted too).

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use parley_core::error::{ProviderError, ToolError};
use parley_core::message::{Message, MessageToolCall};
use parley_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use parley_core::tokenizer::{HeuristicTokenizer, Tokenizer};
use parley_core::tool::{Tool, ToolOutput};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptStep {
    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub tool_calls: Vec<ScriptToolCall>,

    /// Fail this request with the given error text
    #[serde(default)]
    pub error: Option<String>,

    /// HTTP-style status for `error`; without one the error is a network error
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Replays a script of replies in order.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read script {}: {e}", path.display()))?;
        let steps: Vec<ScriptStep> = serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse script {}: {e}", path.display()))?;
        Ok(Self::new(steps))
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let step = self
            .steps
            .lock()
            .map_err(|_| ProviderError::NotConfigured("script lock poisoned".into()))?
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))?;

        if let Some(message) = step.error {
            return Err(match step.status {
                Some(status_code) => ProviderError::ApiError {
                    status_code,
                    message,
                },
                None => ProviderError::Network(message),
            });
        }

        let tool_calls: Vec<MessageToolCall> = step
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, call)| MessageToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", i + 1)),
                name: call.name,
                arguments: match call.arguments {
                    serde_json::Value::String(raw) => raw,
                    serde_json::Value::Null => "{}".into(),
                    value => value.to_string(),
                },
            })
            .collect();

        let tokenizer = HeuristicTokenizer;
        let prompt_tokens = tokenizer.estimate_context_tokens(&request.messages, &request.tools).total as u32;
        let completion_tokens = tokenizer.count_tokens(&step.content) as u32;

        Ok(ProviderResponse {
            message: Message::assistant_with_tools(step.content, tool_calls),
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            model: request.model,
        })
    }
}

/// Returns its `text` argument, after an optional `delay_ms`.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" },
                "delay_ms": { "type": "integer", "description": "Wait this long first" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        if let Some(delay) = arguments.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match arguments.get("text").and_then(|v| v.as_str()) {
            Some(text) => Ok(ToolOutput::ok(text)),
            None => Ok(ToolOutput::error("missing required argument 'text'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::message::Role;

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "offline".into(),
            messages: vec![Message::user("hi")],
            temperature: 0.7,
            max_tokens: None,
            tools: vec![],
        }
    }

    fn parse(json: &str) -> ScriptedProvider {
        ScriptedProvider::new(serde_json::from_str(json).unwrap())
    }

    #[tokio::test]
    async fn replays_steps_in_order() {
        let provider = parse(
            r#"[
                {"tool_calls": [{"name": "echo", "arguments": {"text": "a"}}, {"id": "x", "name": "echo", "arguments": "{oops"}]},
                {"content": "done"}
            ]"#,
        );

        let first = provider.complete(request()).await.unwrap();
        let calls = &first.message.tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments, r#"{"text":"a"}"#);
        assert_eq!(calls[1].id, "x");
        assert_eq!(calls[1].arguments, "{oops");

        let second = provider.complete(request()).await.unwrap();
        assert_eq!(second.message.role, Role::Assistant);
        assert_eq!(second.message.content, "done");
        assert_eq!(second.model, "offline");
        assert!(second.usage.unwrap().total_tokens > 0);
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn scripted_errors_map_to_provider_errors() {
        let provider = parse(r#"[{"error": "overloaded", "status": 503}, {"error": "connection reset"}]"#);

        let api = provider.complete(request()).await.unwrap_err();
        assert!(matches!(api, ProviderError::ApiError { status_code: 503, .. }));
        let network = provider.complete(request()).await.unwrap_err();
        assert!(matches!(network, ProviderError::Network(_)));
        let exhausted = provider.complete(request()).await.unwrap_err();
        assert!(matches!(exhausted, ProviderError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn echo_tool_returns_text_or_error_output() {
        let ok = EchoTool.execute(serde_json::json!({"text": "hello"})).await.unwrap();
        assert_eq!(ok, ToolOutput::ok("hello"));

        let missing = EchoTool.execute(serde_json::json!({})).await.unwrap();
        assert!(missing.is_error);
    }
}

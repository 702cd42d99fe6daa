//! Turn-level streaming events.
//!
//! `TurnEvent` is what a UI consumes while a turn runs: state changes,
//! revealed content, tool activity and the terminal event.

use serde::{Deserialize, Serialize};

/// Phase of the turn state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Validating,
    Queued,
    StreamingContent,
    ToolLoop,
    Done,
    Failed,
    Aborted,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }
}

/// Events emitted by the orchestrator during a turn.
///
/// - `state`: the turn moved to a new phase
/// - `chunk`: a slice of revealed assistant text
/// - `tool_call`: a tool call was submitted
/// - `tool_result`: a tool call settled
/// - `done`: the turn finished with a final answer
/// - `error`: the turn failed or was rejected
/// - `aborted`: the caller cancelled the turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    State { state: TurnState },

    Chunk { content: String },

    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        id: String,
        name: String,
        output: String,
        success: bool,
    },

    Done {
        session_id: String,
        content: String,
        tool_rounds: usize,
        tool_calls_made: usize,
    },

    Error { message: String },

    Aborted { partial: String },
}

impl TurnEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::State { .. } => "state",
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_event_serialization() {
        let event = TurnEvent::State {
            state: TurnState::StreamingContent,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"state""#));
        assert!(json.contains(r#""state":"streaming_content""#));
    }

    #[test]
    fn tool_call_serialization() {
        let event = TurnEvent::ToolCall {
            id: "call_1".into(),
            name: "calculator".into(),
            input: serde_json::json!({"expr": "2+2"}),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_call""#));
        assert!(json.contains(r#""name":"calculator""#));
    }

    #[test]
    fn aborted_round_trips() {
        let json = r#"{"type":"aborted","partial":"Hel"}"#;
        let event: TurnEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type(), "aborted");
        match event {
            TurnEvent::Aborted { partial } => assert_eq!(partial, "Hel"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn terminal_states() {
        assert!(TurnState::Done.is_terminal());
        assert!(TurnState::Failed.is_terminal());
        assert!(TurnState::Aborted.is_terminal());
        assert!(!TurnState::ToolLoop.is_terminal());
        assert!(!TurnState::Idle.is_terminal());
    }
}

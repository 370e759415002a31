//! Conversation log of one session

mod store;

pub use store::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// One step of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
    },
    Assistant {
        text: String,
    },
    /// A capability call proposed by the model. `capability` is kept as
    /// proposed, so unknown names are recorded too.
    ToolCall {
        call_id: String,
        capability: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        outcome: Result<Value, ToolError>,
    },
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Turn::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Turn::Assistant { text: text.into() }
    }

    /// Call id for tool call and tool result turns
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Turn::ToolCall { call_id, .. } | Turn::ToolResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Turn::User { .. } => "user",
            Turn::Assistant { .. } => "assistant",
            Turn::ToolCall { .. } => "tool_call",
            Turn::ToolResult { .. } => "tool_result",
        }
    }
}

/// A stored turn with its marker and append time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Monotonically increasing marker, starting at 1
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub turn: Turn,
}

impl TurnRecord {
    /// One-line rendering for `mailagent history`
    pub fn render(&self) -> String {
        let time = self.at.format("%Y-%m-%d %H:%M:%S");
        match &self.turn {
            Turn::User { text } => format!("[{}] you: {}", time, text),
            Turn::Assistant { text } => format!("[{}] assistant: {}", time, text),
            Turn::ToolCall {
                call_id,
                capability,
                arguments,
            } => format!("[{}] call {} {}({})", time, call_id, capability, arguments),
            Turn::ToolResult { call_id, outcome } => match outcome {
                Ok(_) => format!("[{}] result {} ok", time, call_id),
                Err(e) => format!("[{}] result {} {}: {}", time, call_id, e.code(), e),
            },
        }
    }
}

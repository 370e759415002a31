//! Rendering of conversation turns and capabilities into chat messages

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{LlmRequest, ProposedCall};
use crate::conversation::Turn;
use crate::registry::CapabilityDescriptor;

/// Chat message in the Ollama `/api/chat` format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: vec![],
            tool_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatToolCall {
    pub function: ProposedCall,
}

/// Capability descriptors as function definitions
pub fn tool_definitions(tools: &[CapabilityDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|d| {
            json!({
                "type": "function",
                "function": {
                    "name": d.name,
                    "description": d.description,
                    "parameters": d.input_schema,
                }
            })
        })
        .collect()
}

/// Build the message list for a request.
///
/// Consecutive tool call turns become one assistant message carrying all of
/// them; each result becomes a `tool` message holding its JSON outcome.
pub fn build_messages(request: &LlmRequest) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::text("system", request.system_prompt.clone())];
    let mut pending_calls: Vec<ChatToolCall> = Vec::new();
    // Results name their capability through the call they answer
    let mut call_names: Vec<(String, String)> = Vec::new();

    let flush = |messages: &mut Vec<ChatMessage>, pending: &mut Vec<ChatToolCall>| {
        if !pending.is_empty() {
            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: String::new(),
                tool_calls: std::mem::take(pending),
                tool_name: None,
            });
        }
    };

    for record in &request.history {
        match &record.turn {
            Turn::ToolCall {
                call_id,
                capability,
                arguments,
            } => {
                call_names.push((call_id.clone(), capability.clone()));
                pending_calls.push(ChatToolCall {
                    function: ProposedCall {
                        name: capability.clone(),
                        arguments: arguments.clone(),
                    },
                });
            }
            Turn::ToolResult { call_id, outcome } => {
                flush(&mut messages, &mut pending_calls);
                let content = match outcome {
                    Ok(payload) => json!({"call_id": call_id, "ok": payload}),
                    Err(e) => json!({
                        "call_id": call_id,
                        "error": {"code": e.code(), "message": e.to_string()}
                    }),
                };
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: content.to_string(),
                    tool_calls: vec![],
                    tool_name: call_names
                        .iter()
                        .find(|(id, _)| id == call_id)
                        .map(|(_, name)| name.clone()),
                });
            }
            Turn::User { text } => {
                flush(&mut messages, &mut pending_calls);
                messages.push(ChatMessage::text("user", text.clone()));
            }
            Turn::Assistant { text } => {
                flush(&mut messages, &mut pending_calls);
                messages.push(ChatMessage::text("assistant", text.clone()));
            }
        }
    }
    flush(&mut messages, &mut pending_calls);

    messages
}

//! Tool registry: the closed set of mail capabilities
//!
//! Every call proposed by the model is resolved and validated here before
//! anything touches the network. Unknown names and malformed arguments come
//! back as [`ToolError::Validation`].

pub mod schema;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::models::{
    GetMessageArgs, ListArgs, MessageDetail, MessageList, SearchArgs, SendMessageArgs, SendReceipt,
};

/// A mail capability exposed by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ListRecentMessages,
    ListUnreadMessages,
    SearchMessages,
    GetMessage,
    SendMessage,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::ListRecentMessages,
        Capability::ListUnreadMessages,
        Capability::SearchMessages,
        Capability::GetMessage,
        Capability::SendMessage,
    ];

    /// Wire name of the capability
    pub fn name(&self) -> &'static str {
        match self {
            Capability::ListRecentMessages => "list_recent_messages",
            Capability::ListUnreadMessages => "list_unread_messages",
            Capability::SearchMessages => "search_messages",
            Capability::GetMessage => "get_message",
            Capability::SendMessage => "send_message",
        }
    }

    /// Read-only capabilities can be retried safely
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Capability::SendMessage)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Name, schemas and retry policy of one capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub capability: Capability,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub idempotent: bool,
}

/// Arguments of a validated call, one variant per capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityArgs {
    ListRecentMessages(ListArgs),
    ListUnreadMessages(ListArgs),
    SearchMessages(SearchArgs),
    GetMessage(GetMessageArgs),
    SendMessage(SendMessageArgs),
}

impl CapabilityArgs {
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityArgs::ListRecentMessages(_) => Capability::ListRecentMessages,
            CapabilityArgs::ListUnreadMessages(_) => Capability::ListUnreadMessages,
            CapabilityArgs::SearchMessages(_) => Capability::SearchMessages,
            CapabilityArgs::GetMessage(_) => Capability::GetMessage,
            CapabilityArgs::SendMessage(_) => Capability::SendMessage,
        }
    }

    /// Normalized arguments for the wire, defaults filled in
    pub fn to_value(&self) -> Value {
        let value = match self {
            CapabilityArgs::ListRecentMessages(a) | CapabilityArgs::ListUnreadMessages(a) => {
                serde_json::to_value(a)
            }
            CapabilityArgs::SearchMessages(a) => serde_json::to_value(a),
            CapabilityArgs::GetMessage(a) => serde_json::to_value(a),
            CapabilityArgs::SendMessage(a) => serde_json::to_value(a),
        };
        // Plain structs of strings and integers always serialize
        value.unwrap_or(Value::Null)
    }
}

/// Typed result of a capability call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityOutput {
    Messages(MessageList),
    Message(MessageDetail),
    Sent(SendReceipt),
}

impl CapabilityOutput {
    /// Short human summary for progress events
    pub fn summary(&self) -> String {
        match self {
            CapabilityOutput::Messages(list) => format!("{} message(s)", list.count),
            CapabilityOutput::Message(detail) => format!("message {}", detail.summary.id),
            CapabilityOutput::Sent(receipt) => format!("sent {}", receipt.id),
        }
    }
}

/// A call that passed registry validation
#[derive(Debug, Clone)]
pub struct ValidatedCall {
    pub descriptor: CapabilityDescriptor,
    pub args: CapabilityArgs,
}

impl ValidatedCall {
    pub fn capability(&self) -> Capability {
        self.descriptor.capability
    }

    pub fn is_idempotent(&self) -> bool {
        self.descriptor.idempotent
    }
}

/// Static mapping from capability name to descriptor
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    descriptors: HashMap<String, CapabilityDescriptor>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::mail()
    }
}

impl ToolRegistry {
    /// Registry holding every mail capability
    pub fn mail() -> Self {
        Self::with_capabilities(&Capability::ALL)
    }

    /// Registry restricted to `capabilities` (e.g. a read-only deployment)
    pub fn with_capabilities(capabilities: &[Capability]) -> Self {
        let descriptors = capabilities
            .iter()
            .map(|c| (c.name().to_string(), descriptor_for(*c)))
            .collect();
        Self { descriptors }
    }

    /// Pure lookup by wire name
    pub fn resolve(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.descriptors.get(name)
    }

    /// Descriptors in a stable order, for rendering to the model
    pub fn definitions(&self) -> Vec<&CapabilityDescriptor> {
        let mut all: Vec<_> = self.descriptors.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Resolve `name` and check `arguments` against its input schema
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<ValidatedCall, ToolError> {
        let descriptor = self
            .resolve(name)
            .ok_or_else(|| ToolError::Validation(format!("unknown capability '{}'", name)))?;

        // Models commonly send null for "no arguments"
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        schema::validate(&descriptor.input_schema, &arguments)
            .map_err(|v| ToolError::Validation(format!("{}: {}", name, v)))?;

        let args = parse_args(descriptor.capability, arguments)
            .map_err(|e| ToolError::Validation(format!("{}: {}", name, e)))?;

        Ok(ValidatedCall {
            descriptor: descriptor.clone(),
            args,
        })
    }

    /// Check a success payload against the output schema and decode it
    pub fn decode_output(
        &self,
        descriptor: &CapabilityDescriptor,
        payload: Value,
    ) -> Result<CapabilityOutput, ToolError> {
        schema::validate(&descriptor.output_schema, &payload).map_err(|v| {
            ToolError::Protocol(format!("{} returned invalid output: {}", descriptor.name, v))
        })?;

        let decoded = match descriptor.capability {
            Capability::ListRecentMessages
            | Capability::ListUnreadMessages
            | Capability::SearchMessages => {
                serde_json::from_value(payload).map(CapabilityOutput::Messages)
            }
            Capability::GetMessage => serde_json::from_value(payload).map(CapabilityOutput::Message),
            Capability::SendMessage => serde_json::from_value(payload).map(CapabilityOutput::Sent),
        };

        decoded.map_err(|e| {
            ToolError::Protocol(format!("{} returned undecodable output: {}", descriptor.name, e))
        })
    }
}

fn parse_args(capability: Capability, arguments: Value) -> serde_json::Result<CapabilityArgs> {
    Ok(match capability {
        Capability::ListRecentMessages => {
            CapabilityArgs::ListRecentMessages(serde_json::from_value(arguments)?)
        }
        Capability::ListUnreadMessages => {
            CapabilityArgs::ListUnreadMessages(serde_json::from_value(arguments)?)
        }
        Capability::SearchMessages => {
            CapabilityArgs::SearchMessages(serde_json::from_value(arguments)?)
        }
        Capability::GetMessage => CapabilityArgs::GetMessage(serde_json::from_value(arguments)?),
        Capability::SendMessage => CapabilityArgs::SendMessage(serde_json::from_value(arguments)?),
    })
}

fn summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": {"type": "string"},
            "thread_id": {"type": "string"},
            "from": {"type": "string"},
            "subject": {"type": "string"},
            "date": {"type": "string"},
            "snippet": {"type": "string"},
            "labels": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["id", "thread_id", "from"]
    })
}

fn message_list_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "count": {"type": "integer", "minimum": 0},
            "messages": {"type": "array", "items": summary_schema()}
        },
        "required": ["count", "messages"]
    })
}

fn count_schema(default: u32) -> Value {
    json!({
        "type": "integer",
        "minimum": 1,
        "maximum": 50,
        "default": default,
        "description": format!("Number of messages to return (default: {})", default)
    })
}

fn descriptor_for(capability: Capability) -> CapabilityDescriptor {
    let (description, input_schema, output_schema) = match capability {
        Capability::ListRecentMessages => (
            "List the most recent messages in the inbox, newest first",
            json!({
                "type": "object",
                "properties": {"count": count_schema(5)},
                "additionalProperties": false
            }),
            message_list_schema(),
        ),
        Capability::ListUnreadMessages => (
            "List unread messages, newest first",
            json!({
                "type": "object",
                "properties": {"count": count_schema(10)},
                "additionalProperties": false
            }),
            message_list_schema(),
        ),
        Capability::SearchMessages => (
            "Search messages with a mail search query (e.g. 'from:alice@example.com', \
             'subject:invoice', 'after:2024/05/01', 'is:unread')",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Mail search query"
                    },
                    "count": count_schema(10)
                },
                "required": ["query"],
                "additionalProperties": false
            }),
            message_list_schema(),
        ),
        Capability::GetMessage => (
            "Fetch the full content of one message by id",
            json!({
                "type": "object",
                "properties": {
                    "message_id": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Message id from a previous list or search result"
                    }
                },
                "required": ["message_id"],
                "additionalProperties": false
            }),
            {
                let mut schema = summary_schema();
                schema["properties"]["to"] = json!({"type": "string"});
                schema["properties"]["body"] = json!({"type": "string"});
                schema
            },
        ),
        Capability::SendMessage => (
            "Send an email. Only use when the user explicitly asked to send a message.",
            json!({
                "type": "object",
                "properties": {
                    "to": {
                        "type": "array",
                        "items": {"type": "string", "minLength": 3},
                        "minItems": 1,
                        "maxItems": 20,
                        "description": "Recipient email addresses"
                    },
                    "subject": {"type": "string", "description": "Subject line"},
                    "body": {"type": "string", "description": "Plain text body"},
                    "cc": {
                        "type": "array",
                        "items": {"type": "string", "minLength": 3},
                        "maxItems": 20,
                        "description": "CC recipients"
                    }
                },
                "required": ["to", "subject", "body"],
                "additionalProperties": false
            }),
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "thread_id": {"type": "string"}
                },
                "required": ["id", "thread_id"]
            }),
        ),
    };

    CapabilityDescriptor {
        capability,
        name: capability.name().to_string(),
        description: description.to_string(),
        input_schema,
        output_schema,
        idempotent: capability.is_idempotent(),
    }
}

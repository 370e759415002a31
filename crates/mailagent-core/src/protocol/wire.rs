//! JSON-RPC and MCP wire types, plus the capability request/response envelope

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::TransportError;
use crate::credentials::BearerToken;
use crate::registry::Capability;

/// MCP protocol revision announced during `initialize`
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::String(id.into())),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Request without an id; the server sends no response
    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Application error code carried in `data.code`, if any
    pub fn data_code(&self) -> Option<&str> {
        self.data.as_ref()?.get("code")?.as_str()
    }
}

/// MCP tool call result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolResultContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// MCP tool result content
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolResultContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

impl ToolResult {
    /// Text of the first text block
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|c| match c {
            ToolResultContent::Text { text } => Some(text.as_str()),
            ToolResultContent::Unsupported => None,
        })
    }
}

/// One capability invocation as handed to a transport
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub call_id: String,
    pub capability: Capability,
    /// Normalized arguments (defaults filled in)
    pub arguments: Value,
    pub bearer: BearerToken,
}

impl CapabilityRequest {
    /// Encode as an MCP `tools/call` request whose id is the call id.
    ///
    /// With `bearer_in_meta` the token travels in `params._meta.authorization`
    /// for transports without request headers.
    pub fn to_json_rpc(&self, bearer_in_meta: bool) -> JsonRpcRequest {
        let mut params = json!({
            "name": self.capability.name(),
            "arguments": self.arguments,
        });
        if bearer_in_meta {
            params["_meta"] = json!({
                "authorization": format!("Bearer {}", self.bearer.as_str()),
                "call_id": self.call_id,
            });
        }
        JsonRpcRequest::new(self.call_id.clone(), "tools/call", params)
    }
}

/// Outcome reported by the provider for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseStatus {
    Success { payload: Value },
    CapabilityError { error: String },
    ProtocolError { error: String },
}

/// Capability response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub call_id: String,
    #[serde(flatten)]
    pub status: ResponseStatus,
}

/// Map a JSON-RPC response onto the capability envelope.
///
/// `AUTH_EXPIRED` and `RATE_LIMITED` application codes surface as transport
/// errors so the client can refresh or back off.
pub fn decode_response(response: JsonRpcResponse) -> Result<CapabilityResponse, TransportError> {
    let call_id = match &response.id {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    if let Some(error) = response.error {
        return match error.data_code() {
            Some("AUTH_EXPIRED") => Err(TransportError::Unauthorized),
            Some("RATE_LIMITED") => Err(TransportError::RateLimited),
            _ => Ok(CapabilityResponse {
                call_id,
                status: ResponseStatus::ProtocolError {
                    error: format!("JSON-RPC error {}: {}", error.code, error.message),
                },
            }),
        };
    }

    let Some(result) = response.result else {
        return Err(TransportError::Malformed(
            "response carries neither result nor error".to_string(),
        ));
    };

    Ok(CapabilityResponse {
        call_id,
        status: interpret_tool_result(result),
    })
}

/// Decode `content[0].text` as the JSON payload of a tool result
fn interpret_tool_result(result: Value) -> ResponseStatus {
    let tool_result: ToolResult = match serde_json::from_value(result) {
        Ok(r) => r,
        Err(e) => {
            return ResponseStatus::ProtocolError {
                error: format!("not an MCP tool result: {}", e),
            }
        }
    };

    let Some(text) = tool_result.first_text() else {
        return ResponseStatus::ProtocolError {
            error: "tool result has no text content".to_string(),
        };
    };

    if tool_result.is_error.unwrap_or(false) {
        return ResponseStatus::CapabilityError {
            error: text.to_string(),
        };
    }

    match serde_json::from_str::<Value>(text) {
        // Tool servers also report failures inline as {"error": "..."}
        Ok(Value::Object(map)) if map.len() == 1 && map.contains_key("error") => {
            let error = match &map["error"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            ResponseStatus::CapabilityError { error }
        }
        Ok(payload) => ResponseStatus::Success { payload },
        Err(e) => ResponseStatus::ProtocolError {
            error: format!("tool result text is not JSON: {}", e),
        },
    }
}

//! Language model backend
//!
//! The agent loop only sees [`LanguageModel`]: a request made of recent turns
//! and capability definitions, answered by free text or a batch of proposed
//! tool calls.

mod ollama;
mod prompt;

pub use ollama::*;
pub use prompt::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::TurnRecord;
use crate::error::Result;
use crate::registry::CapabilityDescriptor;

/// Input of one reasoning step
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub history: Vec<TurnRecord>,
    pub tools: Vec<CapabilityDescriptor>,
}

/// A tool call proposed by the model, not yet validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Output of one reasoning step
#[derive(Debug, Clone, PartialEq)]
pub enum LlmReply {
    /// Final answer for the user
    Final(String),

    /// Tool calls to run before reasoning again. `text` is whatever the
    /// model said alongside them.
    ToolCalls { text: String, calls: Vec<ProposedCall> },
}

/// Receives answer tokens as they stream in
pub type TokenSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one reasoning step, forwarding streamed text to `on_token`
    async fn complete(&self, request: &LlmRequest, on_token: TokenSink<'_>) -> Result<LlmReply>;

    /// Model name for logs
    fn model_name(&self) -> &str;
}

//! Ollama `/api/chat` client with tool calling and NDJSON streaming

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info};

use super::{
    build_messages, tool_definitions, ChatMessage, LanguageModel, LlmReply, LlmRequest,
    ProposedCall, TokenSink,
};
use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// One NDJSON line of a streamed chat response
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Client for an Ollama-compatible chat endpoint
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Check if the server is reachable
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Model server not reachable: {}", e);
                false
            }
        }
    }

    async fn stream_chat(&self, request: &LlmRequest, on_token: TokenSink<'_>) -> Result<LlmReply> {
        let body = json!({
            "model": self.model,
            "messages": build_messages(request),
            "tools": tool_definitions(&request.tools),
            "stream": true,
            "options": {"temperature": self.temperature},
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Model server returned {}: {}", status, text);
            return Err(Error::Llm(format!("{} - {}", status, text)));
        }

        let byte_stream = response
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = tokio::io::BufReader::new(StreamReader::new(byte_stream));
        let mut lines = reader.lines();

        let mut text = String::new();
        let mut calls = Vec::new();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::Llm(format!("stream interrupted: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let chunk: ChatChunk = serde_json::from_str(&line)
                .map_err(|e| Error::Llm(format!("undecodable stream chunk: {}", e)))?;

            if let Some(message) = chunk.error {
                return Err(Error::Llm(message));
            }
            if let Some(message) = chunk.message {
                if !message.content.is_empty() {
                    on_token(&message.content);
                    text.push_str(&message.content);
                }
                calls.extend(message.tool_calls.into_iter().map(|c| normalize_call(c.function)));
            }
            if chunk.done {
                break;
            }
        }

        if calls.is_empty() {
            Ok(LlmReply::Final(text))
        } else {
            debug!("Model proposed {} tool call(s)", calls.len());
            Ok(LlmReply::ToolCalls { text, calls })
        }
    }
}

/// Some models send arguments as a JSON string instead of an object
fn normalize_call(mut call: ProposedCall) -> ProposedCall {
    if let Value::String(raw) = &call.arguments {
        if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
            call.arguments = parsed;
        }
    }
    call
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn complete(&self, request: &LlmRequest, on_token: TokenSink<'_>) -> Result<LlmReply> {
        info!(
            "Model request: {} ({} turns, {} tools)",
            self.model,
            request.history.len(),
            request.tools.len()
        );
        tokio::time::timeout(self.timeout, self.stream_chat(request, on_token))
            .await
            .map_err(|_| Error::LlmTimeout(self.timeout.as_secs()))?
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_with_tool_calls_decodes() {
        let line = r#"{"model":"llama3.1:8b","message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"search_messages","arguments":{"query":"from:alice"}}}]},"done":false}"#;
        let chunk: ChatChunk = serde_json::from_str(line).unwrap();
        let message = chunk.message.unwrap();
        assert_eq!(message.tool_calls[0].function.name, "search_messages");
        assert!(!chunk.done);
    }

    #[test]
    fn test_string_arguments_are_parsed() {
        let call = normalize_call(ProposedCall {
            name: "get_message".to_string(),
            arguments: Value::String(r#"{"message_id":"m1"}"#.to_string()),
        });
        assert_eq!(call.arguments["message_id"], "m1");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_llm_error() {
        let client = OllamaClient::new(&LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..LlmConfig::default()
        });
        assert!(!client.is_available().await);

        let request = LlmRequest {
            system_prompt: String::new(),
            history: vec![],
            tools: vec![],
        };
        let err = client.complete(&request, &|_| {}).await.unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
    }
}

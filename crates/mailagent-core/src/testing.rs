//! Fakes shared by unit tests across modules

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::CredentialsConfig;
use crate::credentials::{
    BootstrapError, CredentialBootstrap, CredentialManager, MemoryTokenStore, TokenGrant,
};
use crate::error::{Error, Result};
use crate::llm::{LanguageModel, LlmReply, LlmRequest, ProposedCall, TokenSink};
use crate::protocol::{
    CapabilityRequest, CapabilityResponse, CapabilityTransport, ResponseStatus, TransportError,
};
use crate::registry::Capability;

/// Issues `access-N` tokens; exchanges after `revoke_after` are refused
pub(crate) struct FakeBootstrap {
    pub exchanges: AtomicUsize,
    revoke_after: Option<usize>,
}

#[async_trait]
impl CredentialBootstrap for FakeBootstrap {
    async fn load_initial_refresh_token(
        &self,
        _session_id: &str,
    ) -> std::result::Result<String, BootstrapError> {
        Ok("refresh-0".to_string())
    }

    async fn exchange_refresh_token(
        &self,
        _refresh_token: &str,
    ) -> std::result::Result<TokenGrant, BootstrapError> {
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        if self.revoke_after.is_some_and(|limit| n > limit) {
            return Err(BootstrapError::Revoked("invalid_grant".to_string()));
        }
        Ok(TokenGrant {
            access_token: format!("access-{}", n),
            refresh_token: None,
            expires_in: 3600,
            scopes: vec![],
        })
    }
}

impl FakeBootstrap {
    pub fn new(revoke_after: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            exchanges: AtomicUsize::new(0),
            revoke_after,
        })
    }
}

pub(crate) async fn fake_credentials(revoke_after: Option<usize>) -> Arc<CredentialManager> {
    let bootstrap = FakeBootstrap::new(revoke_after);
    Arc::new(
        CredentialManager::initialize(
            "test-session",
            &CredentialsConfig::default(),
            bootstrap,
            Arc::new(MemoryTokenStore::new()),
        )
        .await
        .unwrap(),
    )
}

/// Behaviour of the fake transport for one request
#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Reply(ResponseStatus),
    Fail(TransportError),
    /// Reply after a delay
    Delayed(Duration, ResponseStatus),
    /// Never answer
    Hang,
    WrongCallId,
}

impl Scripted {
    pub fn success(payload: Value) -> Self {
        Scripted::Reply(ResponseStatus::Success { payload })
    }
}

/// What the fake transport saw
#[derive(Debug, Clone)]
pub(crate) struct SentRequest {
    pub call_id: String,
    pub capability: Capability,
    pub arguments: Value,
    pub bearer: String,
    pub at: tokio::time::Instant,
}

type Handler = Box<dyn Fn(&CapabilityRequest) -> Scripted + Send + Sync>;

pub(crate) struct FakeTransport {
    handler: Handler,
    sent: Mutex<Vec<SentRequest>>,
}

impl FakeTransport {
    /// Answer requests in order from `script`
    pub fn scripted(script: Vec<Scripted>) -> Arc<Self> {
        let queue = Mutex::new(VecDeque::from(script));
        Self::with_handler(move |_| {
            queue.lock().pop_front().unwrap_or_else(|| {
                Scripted::Fail(TransportError::Malformed("script exhausted".to_string()))
            })
        })
    }

    /// Answer each request with `handler`
    pub fn with_handler(
        handler: impl Fn(&CapabilityRequest) -> Scripted + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl CapabilityTransport for FakeTransport {
    async fn send(
        &self,
        request: &CapabilityRequest,
    ) -> std::result::Result<CapabilityResponse, TransportError> {
        self.sent.lock().push(SentRequest {
            call_id: request.call_id.clone(),
            capability: request.capability,
            arguments: request.arguments.clone(),
            bearer: request.bearer.as_str().to_string(),
            at: tokio::time::Instant::now(),
        });

        let reply = |status: ResponseStatus| -> std::result::Result<CapabilityResponse, TransportError> {
            Ok(CapabilityResponse {
                call_id: request.call_id.clone(),
                status,
            })
        };

        match (self.handler)(request) {
            Scripted::Reply(status) => reply(status),
            Scripted::Fail(e) => Err(e),
            Scripted::Delayed(delay, status) => {
                tokio::time::sleep(delay).await;
                reply(status)
            }
            Scripted::Hang => std::future::pending().await,
            Scripted::WrongCallId => Ok(CapabilityResponse {
                call_id: format!("{}-other", request.call_id),
                status: ResponseStatus::Success {
                    payload: json!({"count": 0, "messages": []}),
                },
            }),
        }
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// A `MessageList` payload with `n` messages from Alice
pub(crate) fn message_list(n: usize) -> Value {
    let messages: Vec<Value> = (1..=n)
        .map(|i| {
            json!({
                "id": format!("m{}", i),
                "thread_id": format!("t{}", i),
                "from": "Alice <alice@example.com>",
                "subject": format!("Update {}", i),
                "date": "Mon, 6 May 2024 10:00:00 +0000",
                "snippet": "Quick update",
                "labels": ["INBOX"],
            })
        })
        .collect();
    json!({"count": n, "messages": messages})
}

/// One scripted model step
pub(crate) enum ModelStep {
    Answer(&'static str),
    Calls(Vec<(&'static str, Value)>),
    Fail,
    Hang,
}

/// Language model that replays `steps` and records every request
pub(crate) struct ScriptedModel {
    steps: Mutex<VecDeque<ModelStep>>,
    /// Fallback once `steps` is exhausted
    repeat_calls: Option<Vec<(&'static str, Value)>>,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<ModelStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::from(steps)),
            repeat_calls: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Proposes the same calls forever
    pub fn looping(calls: Vec<(&'static str, Value)>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::new()),
            repeat_calls: Some(calls),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn invocations(&self) -> usize {
        self.requests.lock().len()
    }
}

fn proposed(calls: &[(&'static str, Value)]) -> LlmReply {
    LlmReply::ToolCalls {
        text: String::new(),
        calls: calls
            .iter()
            .map(|(name, arguments)| ProposedCall {
                name: name.to_string(),
                arguments: arguments.clone(),
            })
            .collect(),
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &LlmRequest, on_token: TokenSink<'_>) -> Result<LlmReply> {
        self.requests.lock().push(request.clone());
        let step = self.steps.lock().pop_front();

        match step {
            Some(ModelStep::Answer(text)) => {
                for word in text.split_inclusive(' ') {
                    on_token(word);
                }
                Ok(LlmReply::Final(text.to_string()))
            }
            Some(ModelStep::Calls(calls)) => Ok(proposed(&calls)),
            Some(ModelStep::Fail) => Err(Error::Llm("model server unavailable".to_string())),
            Some(ModelStep::Hang) => std::future::pending().await,
            None => match &self.repeat_calls {
                Some(calls) => Ok(proposed(calls)),
                None => Err(Error::Llm("script exhausted".to_string())),
            },
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

//! Agent loop driving one user turn to completion
//!
//! ```text
//! AwaitingUser → Reasoning → Dispatching → Reasoning → … → Responding → AwaitingUser
//! ```
//!
//! Each user turn runs as its own task. The front-end receives progress as
//! [`AgentEvent`]s and can stop the turn through its [`TurnHandle`].

mod dispatch;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::conversation::{ConversationStore, Turn};
use crate::credentials::sanitize_session_id;
use crate::error::{Error, Result, ToolError};
use crate::llm::{LanguageModel, LlmReply, LlmRequest};
use crate::protocol::CapabilityClient;
use crate::registry::ToolRegistry;
use dispatch::BatchEnd;

/// Progress reported to the front-end
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Streamed model text
    AssistantToken(String),

    ToolCallStarted {
        call_id: String,
        capability: String,
    },

    /// `Ok` carries a short summary of the output
    ToolCallFinished {
        call_id: String,
        capability: String,
        result: std::result::Result<String, ToolError>,
    },

    /// The turn ended with this assistant message
    TurnComplete { text: String },

    /// The turn ended without an answer
    Error { code: String, message: String },
}

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

/// Phase of the agent loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingUser,
    Reasoning,
    Dispatching,
    Responding,
}

/// How a user turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Answered,
    LimitReached,
    ReauthRequired,
    Failed,
    Cancelled,
}

/// Handle on a running user turn
pub struct TurnHandle {
    cancel: CancellationToken,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    /// Cancel the in-flight model call and tool calls
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token that stops this turn when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the turn to end
    pub async fn finished(self) -> TurnOutcome {
        self.task.await.unwrap_or(TurnOutcome::Failed)
    }
}

enum TurnEnd {
    Answered(String),
    LimitReached(String),
    Reauth(ToolError),
    Cancelled,
}

/// Clears the busy flag when a turn task ends, however it ends
struct BusyGuard {
    inner: Arc<AgentInner>,
}

impl BusyGuard {
    fn acquire(inner: Arc<AgentInner>) -> Result<Self> {
        if inner
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::SessionBusy(inner.session_id.clone()));
        }
        Ok(Self { inner })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        *self.inner.current.lock() = None;
        self.inner.set_state(LoopState::AwaitingUser);
        self.inner.busy.store(false, Ordering::Release);
    }
}

struct AgentInner {
    session_id: String,
    call_prefix: String,
    next_call: AtomicU64,
    config: AgentConfig,
    registry: Arc<ToolRegistry>,
    client: Arc<CapabilityClient>,
    model: Arc<dyn LanguageModel>,
    store: Arc<ConversationStore>,
    state: Mutex<LoopState>,
    busy: AtomicBool,
    current: Mutex<Option<CancellationToken>>,
}

/// Agent loop for one session
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Create the agent for the session owning `store`.
    ///
    /// Calls left open by an interrupted process are closed first, and call
    /// ids continue after the highest one already in the log.
    pub async fn new(
        config: AgentConfig,
        client: Arc<CapabilityClient>,
        model: Arc<dyn LanguageModel>,
        store: Arc<ConversationStore>,
    ) -> Result<Self> {
        let session_id = store.session_id().to_string();
        let call_prefix = call_prefix(&session_id);
        let next_call = highest_call_counter(&call_prefix, &store.call_ids()) + 1;

        let inner = Arc::new(AgentInner {
            session_id,
            call_prefix,
            next_call: AtomicU64::new(next_call),
            config,
            registry: client.registry().clone(),
            client,
            model,
            store,
            state: Mutex::new(LoopState::AwaitingUser),
            busy: AtomicBool::new(false),
            current: Mutex::new(None),
        });

        let dangling = inner.store.open_calls();
        if !dangling.is_empty() {
            warn!(
                "Session {} has {} call(s) without results from a previous run",
                inner.session_id,
                dangling.len()
            );
            let (events, _) = mpsc::unbounded_channel();
            inner.close_open_calls(&events, true).await?;
            inner
                .store
                .append(Turn::assistant("The previous request was interrupted."))
                .await?;
        }

        Ok(Self { inner })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn state(&self) -> LoopState {
        *self.inner.state.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.inner.store
    }

    /// Stop the running turn, if any
    pub fn stop(&self) {
        if let Some(token) = self.inner.current.lock().as_ref() {
            token.cancel();
        }
    }

    /// Append a user turn and start driving it in the background.
    ///
    /// Fails with [`Error::SessionBusy`] while another turn is running.
    pub async fn submit_user_text(
        &self,
        text: impl Into<String>,
    ) -> Result<(EventReceiver, TurnHandle)> {
        let guard = BusyGuard::acquire(self.inner.clone())?;
        self.inner.store.append(Turn::user(text)).await?;

        let cancel = CancellationToken::new();
        *self.inner.current.lock() = Some(cancel.clone());
        let (events, receiver) = mpsc::unbounded_channel();

        let inner = self.inner.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.run_turn(token, events).await
        });

        Ok((receiver, TurnHandle { cancel, task }))
    }
}

impl AgentInner {
    fn set_state(&self, state: LoopState) {
        *self.state.lock() = state;
    }

    fn next_call_id(&self) -> String {
        format!(
            "{}-{}",
            self.call_prefix,
            self.next_call.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn build_request(&self) -> LlmRequest {
        LlmRequest {
            system_prompt: self.config.system_prompt.clone(),
            history: self.store.recent(self.config.history_window),
            tools: self.registry.definitions().into_iter().cloned().collect(),
        }
    }

    async fn run_turn(&self, cancel: CancellationToken, events: EventSender) -> TurnOutcome {
        let end = self.drive(&cancel, &events).await;

        match end {
            Ok(TurnEnd::Answered(text)) => {
                let _ = events.send(AgentEvent::TurnComplete { text });
                TurnOutcome::Answered
            }
            Ok(TurnEnd::LimitReached(text)) => {
                let _ = events.send(AgentEvent::TurnComplete { text });
                TurnOutcome::LimitReached
            }
            Ok(TurnEnd::Reauth(error)) => {
                error!("Session {} needs re-authentication: {}", self.session_id, error);
                let _ = events.send(AgentEvent::Error {
                    code: error.code().to_string(),
                    message: error.to_string(),
                });
                TurnOutcome::ReauthRequired
            }
            Ok(TurnEnd::Cancelled) => {
                info!("Session {} turn stopped", self.session_id);
                match self.finish_cancelled(&events).await {
                    Ok(text) => {
                        let _ = events.send(AgentEvent::TurnComplete { text });
                    }
                    Err(e) => self.report_failure(&events, &e),
                }
                TurnOutcome::Cancelled
            }
            Err(e) => {
                self.report_failure(&events, &e);
                // Leave the log ready for the next user turn
                if let Err(close) = self.close_open_calls(&events, false).await {
                    warn!("Failed to close open calls for {}: {}", self.session_id, close);
                }
                if e.requires_reauth() {
                    TurnOutcome::ReauthRequired
                } else {
                    TurnOutcome::Failed
                }
            }
        }
    }

    async fn drive(&self, cancel: &CancellationToken, events: &EventSender) -> Result<TurnEnd> {
        let max_rounds = self.config.max_rounds.max(1);

        for round in 1..=max_rounds {
            self.set_state(LoopState::Reasoning);
            let request = self.build_request();

            let token_events = events.clone();
            let on_token = move |token: &str| {
                let _ = token_events.send(AgentEvent::AssistantToken(token.to_string()));
            };

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
                reply = self.model.complete(&request, &on_token) => reply?,
            };

            match reply {
                LlmReply::Final(text) => {
                    self.set_state(LoopState::Responding);
                    self.store.append(Turn::assistant(text.clone())).await?;
                    return Ok(TurnEnd::Answered(text));
                }
                LlmReply::ToolCalls { calls, .. } if round == max_rounds => {
                    warn!(
                        "Session {} hit the {} round limit; dropping {} proposed call(s)",
                        self.session_id,
                        max_rounds,
                        calls.len()
                    );
                }
                LlmReply::ToolCalls { calls, .. } => {
                    info!(
                        "Session {} round {}: dispatching {} call(s)",
                        self.session_id,
                        round,
                        calls.len()
                    );
                    self.set_state(LoopState::Dispatching);
                    match self.dispatch(calls, cancel, events).await? {
                        BatchEnd::Completed => {}
                        BatchEnd::Fatal(error) => return Ok(TurnEnd::Reauth(error)),
                        BatchEnd::Cancelled => return Ok(TurnEnd::Cancelled),
                    }
                }
            }
        }

        self.set_state(LoopState::Responding);
        let text = format!(
            "I reached the limit of {} reasoning steps for this request without a final answer. \
             Try asking something narrower.",
            max_rounds
        );
        self.store.append(Turn::assistant(text.clone())).await?;
        Ok(TurnEnd::LimitReached(text))
    }

    async fn finish_cancelled(&self, events: &EventSender) -> Result<String> {
        self.close_open_calls(events, false).await?;
        let text = "Stopped before finishing.".to_string();
        self.store.append(Turn::assistant(text.clone())).await?;
        Ok(text)
    }

    fn report_failure(&self, events: &EventSender, error: &Error) {
        error!("Session {} turn failed: {}", self.session_id, error);
        let _ = events.send(AgentEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }
}

/// Call ids are `<session>-<n>`; the whole session id keeps them unique
/// across sessions sharing one provider connection
fn call_prefix(session_id: &str) -> String {
    let prefix = sanitize_session_id(session_id);
    if prefix.is_empty() {
        "call".to_string()
    } else {
        prefix
    }
}

fn highest_call_counter(prefix: &str, call_ids: &[String]) -> u64 {
    call_ids
        .iter()
        .filter_map(|id| id.strip_prefix(prefix)?.strip_prefix('-')?.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::models::MessageList;
    use crate::protocol::{CallRateLimiter, TransportError};
    use crate::registry::Capability;
    use crate::testing::{
        fake_credentials, message_list, FakeTransport, ModelStep, ScriptedModel, Scripted,
    };
    use serde_json::json;
    use std::time::Duration;

    const SESSION: &str = "3f2a9c1e-77aa-4d2b";

    async fn agent_with(
        model: Arc<ScriptedModel>,
        transport: Arc<FakeTransport>,
        config: AgentConfig,
        revoke_after: Option<usize>,
        store: Arc<ConversationStore>,
    ) -> Agent {
        let protocol = ProtocolConfig {
            rate_limit_per_second: 1_000,
            ..ProtocolConfig::default()
        };
        let client = Arc::new(CapabilityClient::new(
            &protocol,
            Arc::new(ToolRegistry::mail()),
            fake_credentials(revoke_after).await,
            transport,
            CallRateLimiter::new(protocol.rate_limit_per_second),
        ));
        Agent::new(config, client, model, store).await.unwrap()
    }

    async fn agent(model: Arc<ScriptedModel>, transport: Arc<FakeTransport>) -> Agent {
        agent_with(
            model,
            transport,
            AgentConfig::default(),
            None,
            Arc::new(ConversationStore::in_memory(SESSION)),
        )
        .await
    }

    async fn run(agent: &Agent, text: &str) -> (TurnOutcome, Vec<AgentEvent>) {
        let (mut rx, handle) = agent.submit_user_text(text).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (handle.finished().await, events)
    }

    fn kinds(agent: &Agent) -> Vec<&'static str> {
        agent.store().snapshot().iter().map(|r| r.turn.kind()).collect()
    }

    fn results(agent: &Agent) -> Vec<std::result::Result<serde_json::Value, ToolError>> {
        agent
            .store()
            .snapshot()
            .into_iter()
            .filter_map(|r| match r.turn {
                Turn::ToolResult { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_search_then_answer() {
        let model = ScriptedModel::new(vec![
            ModelStep::Calls(vec![(
                "search_messages",
                json!({"query": "from:alice newer_than:7d"}),
            )]),
            ModelStep::Answer("Alice sent you 3 messages last week."),
        ]);
        let transport = FakeTransport::with_handler(|_| Scripted::success(message_list(3)));
        let agent = agent(model.clone(), transport.clone()).await;

        let (outcome, events) = run(&agent, "find emails from Alice last week").await;

        assert_eq!(outcome, TurnOutcome::Answered);
        assert_eq!(agent.state(), LoopState::AwaitingUser);
        assert_eq!(kinds(&agent), vec!["user", "tool_call", "tool_result", "assistant"]);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].capability, Capability::SearchMessages);
        assert_eq!(sent[0].call_id, "3f2a9c1e-77aa-4d2b-1");

        let payload = results(&agent).remove(0).unwrap();
        let list: MessageList = serde_json::from_value(payload).unwrap();
        assert_eq!(list.messages.len(), 3);
        assert!(list.messages.iter().all(|m| m.from.starts_with("Alice")));

        // The second model request sees the tool result
        let requests = model.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests[1]
            .history
            .iter()
            .any(|r| matches!(r.turn, Turn::ToolResult { .. })));
        drop(requests);

        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolCallFinished { result: Ok(summary), .. } if summary == "3 message(s)"
        )));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::AssistantToken(_))));
        assert_eq!(
            events.last(),
            Some(&AgentEvent::TurnComplete {
                text: "Alice sent you 3 messages last week.".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_ends_turn_without_reinvoking_model() {
        let model = ScriptedModel::new(vec![
            ModelStep::Calls(vec![
                ("search_messages", json!({"query": "from:alice"})),
                ("get_message", json!({"message_id": "m1"})),
            ]),
            ModelStep::Answer("should not be used"),
        ]);
        let transport = FakeTransport::with_handler(|request| match request.capability {
            Capability::SearchMessages => Scripted::Fail(TransportError::Unauthorized),
            _ => Scripted::Hang,
        });
        let agent = agent_with(
            model.clone(),
            transport,
            AgentConfig::default(),
            Some(1),
            Arc::new(ConversationStore::in_memory(SESSION)),
        )
        .await;

        let (outcome, events) = run(&agent, "anything from Alice?").await;

        assert_eq!(outcome, TurnOutcome::ReauthRequired);
        assert_eq!(model.invocations(), 1);
        assert!(agent.store().open_calls().is_empty());

        let results = results(&agent);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(ToolError::ReauthRequired(_))));
        assert_eq!(results[1], Err(ToolError::Cancelled));

        assert!(matches!(
            events.last(),
            Some(AgentEvent::Error { code, .. }) if code == "REAUTH_REQUIRED"
        ));
        assert_eq!(kinds(&agent).last(), Some(&"tool_result"));
    }

    #[tokio::test]
    async fn test_unknown_capability_is_rejected_before_the_network() {
        let model = ScriptedModel::new(vec![
            ModelStep::Calls(vec![("delete_all_messages", json!({}))]),
            ModelStep::Answer("I can't delete messages."),
        ]);
        let transport = FakeTransport::scripted(vec![]);
        let agent = agent(model.clone(), transport.clone()).await;

        let (outcome, _) = run(&agent, "delete everything").await;

        assert_eq!(outcome, TurnOutcome::Answered);
        assert!(transport.sent().is_empty());
        assert_eq!(model.invocations(), 2);

        let requests = model.requests.lock();
        let seen = requests[1].history.iter().any(|r| {
            matches!(&r.turn, Turn::ToolResult { outcome: Err(ToolError::Validation(msg)), .. }
                if msg.contains("unknown capability"))
        });
        assert!(seen);
    }

    #[tokio::test]
    async fn test_round_limit_forces_terminal_answer() {
        let model = ScriptedModel::looping(vec![("list_recent_messages", json!({}))]);
        let transport = FakeTransport::with_handler(|_| Scripted::success(message_list(1)));
        let agent = agent(model.clone(), transport.clone()).await;

        let (outcome, events) = run(&agent, "keep looking").await;

        assert_eq!(outcome, TurnOutcome::LimitReached);
        assert_eq!(model.invocations(), 6);
        // The sixth round's calls are never dispatched
        assert_eq!(transport.sent().len(), 5);
        assert!(agent.store().open_calls().is_empty());

        match events.last() {
            Some(AgentEvent::TurnComplete { text }) => assert!(text.contains("limit of 6")),
            other => panic!("unexpected last event {:?}", other),
        }
        assert_eq!(kinds(&agent).last(), Some(&"assistant"));
    }

    #[tokio::test]
    async fn test_calls_over_batch_limit_are_not_dispatched() {
        let model = ScriptedModel::new(vec![
            ModelStep::Calls(vec![
                ("get_message", json!({"message_id": "m1"})),
                ("get_message", json!({"message_id": "m2"})),
                ("get_message", json!({"message_id": "m3"})),
            ]),
            ModelStep::Answer("Here are two of them."),
        ]);
        let transport = FakeTransport::with_handler(|request| {
            Scripted::success(json!({
                "id": request.arguments["message_id"],
                "thread_id": "t1",
                "from": "Alice",
            }))
        });
        let config = AgentConfig {
            max_batch_size: 2,
            ..AgentConfig::default()
        };
        let agent = agent_with(
            model,
            transport.clone(),
            config,
            None,
            Arc::new(ConversationStore::in_memory(SESSION)),
        )
        .await;

        let (outcome, _) = run(&agent, "open all three").await;

        assert_eq!(outcome, TurnOutcome::Answered);
        assert_eq!(transport.sent().len(), 2);
        let rejected = results(&agent)
            .into_iter()
            .filter(|r| matches!(r, Err(ToolError::Validation(_))))
            .count();
        assert_eq!(rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_are_serialized_and_reads_run_concurrently() {
        let send = |to: &str| json!({"to": [to], "subject": "Hi", "body": "Lunch?"});
        let model = ScriptedModel::new(vec![
            ModelStep::Calls(vec![
                ("send_message", send("bob@example.com")),
                ("list_unread_messages", json!({})),
                ("send_message", send("carol@example.com")),
                ("list_recent_messages", json!({})),
            ]),
            ModelStep::Answer("Sent both."),
        ]);
        let transport = FakeTransport::with_handler(|request| {
            let payload = match request.capability {
                Capability::SendMessage => json!({"id": "sent", "thread_id": "t"}),
                _ => message_list(1),
            };
            Scripted::Delayed(
                Duration::from_millis(100),
                crate::protocol::ResponseStatus::Success { payload },
            )
        });
        let agent = agent(model, transport.clone()).await;

        let (outcome, _) = run(&agent, "email bob and carol").await;
        assert_eq!(outcome, TurnOutcome::Answered);

        let sent = transport.sent();
        let at = |capability: Capability| -> Vec<_> {
            sent.iter()
                .filter(|s| s.capability == capability)
                .map(|s| s.at)
                .collect()
        };
        let sends = at(Capability::SendMessage);
        assert_eq!(sends.len(), 2);
        assert!(sends[1] - sends[0] >= Duration::from_millis(100));

        let reads = [at(Capability::ListUnreadMessages)[0], at(Capability::ListRecentMessages)[0]];
        assert!(reads[0].max(reads[1]) - reads[0].min(reads[1]) < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stop_records_results_for_open_calls() {
        let model = ScriptedModel::new(vec![ModelStep::Calls(vec![
            ("search_messages", json!({"query": "invoice"})),
            (
                "send_message",
                json!({"to": ["bob@example.com"], "subject": "Hi", "body": "Hello"}),
            ),
        ])]);
        let transport = FakeTransport::with_handler(|_| Scripted::Hang);
        let agent = agent(model, transport.clone()).await;

        let (mut rx, handle) = agent.submit_user_text("find the invoice and email bob").await.unwrap();
        while transport.sent().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop();
        let outcome = handle.finished().await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(agent.state(), LoopState::AwaitingUser);
        assert!(!agent.is_busy());

        let results = results(&agent);
        assert_eq!(results[0], Err(ToolError::Cancelled));
        assert!(matches!(results[1], Err(ToolError::AmbiguousOutcome(_))));
        assert_eq!(kinds(&agent).last(), Some(&"assistant"));
        assert!(matches!(events.last(), Some(AgentEvent::TurnComplete { .. })));
    }

    #[tokio::test]
    async fn test_second_submit_while_busy_is_rejected() {
        let model = ScriptedModel::new(vec![ModelStep::Hang, ModelStep::Answer("done")]);
        let agent = agent(model.clone(), FakeTransport::scripted(vec![])).await;

        let (_rx, handle) = agent.submit_user_text("first").await.unwrap();
        let second = agent.submit_user_text("second").await;
        assert!(matches!(second, Err(Error::SessionBusy(_))));

        // The hanging step must be consumed by "first", not left for "third"
        while model.invocations() < 1 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        agent.stop();
        assert_eq!(handle.finished().await, TurnOutcome::Cancelled);

        let (outcome, _) = run(&agent, "third").await;
        assert_eq!(outcome, TurnOutcome::Answered);
    }

    #[tokio::test]
    async fn test_model_failure_emits_error_event() {
        let model = ScriptedModel::new(vec![ModelStep::Fail]);
        let agent = agent(model, FakeTransport::scripted(vec![])).await;

        let (outcome, events) = run(&agent, "hello").await;

        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(kinds(&agent), vec!["user"]);
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Error { code, .. }) if code == "LLM_ERROR"
        ));
        assert_eq!(agent.state(), LoopState::AwaitingUser);
    }

    #[tokio::test]
    async fn test_reloaded_session_resumes_call_ids_and_closes_dangling_calls() {
        let store = Arc::new(ConversationStore::in_memory(SESSION));
        store.append(Turn::user("email bob")).await.unwrap();
        store
            .append(Turn::ToolCall {
                call_id: "3f2a9c1e-77aa-4d2b-7".to_string(),
                capability: "send_message".to_string(),
                arguments: json!({"to": ["bob@example.com"], "subject": "s", "body": "b"}),
            })
            .await
            .unwrap();

        let model = ScriptedModel::new(vec![
            ModelStep::Calls(vec![("list_recent_messages", json!({}))]),
            ModelStep::Answer("ok"),
        ]);
        let transport = FakeTransport::with_handler(|_| Scripted::success(message_list(1)));
        let agent = agent_with(model, transport.clone(), AgentConfig::default(), None, store).await;

        assert!(matches!(
            results(&agent)[0],
            Err(ToolError::AmbiguousOutcome(_))
        ));

        run(&agent, "what's new?").await;
        assert_eq!(transport.sent()[0].call_id, "3f2a9c1e-77aa-4d2b-8");
    }

    #[test]
    fn test_call_prefix() {
        assert_eq!(call_prefix("3f2a9c1e-77aa-4d2b"), "3f2a9c1e-77aa-4d2b");
        assert_eq!(call_prefix("3f2a9c1e-0000"), "3f2a9c1e-0000");
        assert_ne!(call_prefix("3f2a9c1e-77aa"), call_prefix("3f2a9c1e-0000"));
        assert_eq!(call_prefix(""), "call");
        assert_eq!(
            highest_call_counter("abc", &["abc-3".to_string(), "abc-12".to_string(), "x-99".to_string()]),
            12
        );
    }
}

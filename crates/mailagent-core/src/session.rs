//! Session lifecycle: one agent, credential manager and conversation log per
//! session, reaped after an idle timeout

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::{Agent, EventReceiver, TurnHandle};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::credentials::{
    create_token_store, sanitize_session_id, CredentialBootstrap, CredentialManager,
    OAuthBootstrap, TokenStore,
};
use crate::error::{Error, Result};
use crate::llm::{LanguageModel, OllamaClient};
use crate::protocol::{create_transport, CallRateLimiter, CapabilityClient, CapabilityTransport};
use crate::registry::ToolRegistry;

/// Conversation log location for a session
pub fn session_log_path(config: &Config, session_id: &str) -> PathBuf {
    config
        .sessions_dir()
        .join(format!("{}.jsonl", sanitize_session_id(session_id)))
}

/// One user's ongoing conversation
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
    agent: Agent,
    credentials: Arc<CredentialManager>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        *self.last_active.lock()
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    fn touch(&self, now: DateTime<Utc>) {
        *self.last_active.lock() = now;
    }

    /// A session with a running turn is never idle
    fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.agent.is_busy() {
            return false;
        }
        let idle = now.signed_duration_since(self.last_active());
        idle.to_std().is_ok_and(|idle| idle > timeout)
    }
}

/// Owns the active sessions and the collaborators they share
pub struct SessionManager {
    config: Arc<Config>,
    registry: Arc<ToolRegistry>,
    model: Arc<dyn LanguageModel>,
    bootstrap: Arc<dyn CredentialBootstrap>,
    token_store: Arc<dyn TokenStore>,
    transport: Arc<dyn CapabilityTransport>,
    /// Provider call budget, shared by every session
    limiter: CallRateLimiter,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Per-id gates so only one caller replays and repairs a given log
    opening: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        model: Arc<dyn LanguageModel>,
        bootstrap: Arc<dyn CredentialBootstrap>,
        token_store: Arc<dyn TokenStore>,
        transport: Arc<dyn CapabilityTransport>,
    ) -> Self {
        let limiter = CallRateLimiter::new(config.protocol.rate_limit_per_second);
        Self {
            config,
            registry: Arc::new(ToolRegistry::mail()),
            model,
            bootstrap,
            token_store,
            transport,
            limiter,
            sessions: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        }
    }

    /// Build the production collaborators from configuration
    pub async fn from_config(config: Arc<Config>) -> Result<Self> {
        let model = Arc::new(OllamaClient::new(&config.llm));
        let bootstrap = Arc::new(OAuthBootstrap::new(
            &config.credentials,
            config.credentials_dir(),
        ));
        let token_store = create_token_store(&config);
        let transport = create_transport(&config.protocol).await?;
        Ok(Self::new(config, model, bootstrap, token_store, transport))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Open a session, resuming its log when one exists. A new id is
    /// generated when none is given.
    pub async fn open(&self, session_id: Option<&str>) -> Result<Arc<Session>> {
        let id = match session_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            Some(_) => {
                return Err(Error::InvalidConfig {
                    field: "session".to_string(),
                    reason: "session id must not be empty".to_string(),
                })
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        if let Some(existing) = self.existing(&id) {
            return Ok(existing);
        }

        let gate = self.opening.lock().entry(id.clone()).or_default().clone();
        let result = {
            let _opening = gate.lock().await;
            self.open_locked(&id).await
        };

        // Waiters clone the gate under this lock, so the count is exact
        let mut opening = self.opening.lock();
        if Arc::strong_count(&gate) == 2 {
            opening.remove(&id);
        }
        result
    }

    fn existing(&self, id: &str) -> Option<Arc<Session>> {
        let existing = self.sessions.read().get(id).cloned()?;
        existing.touch(Utc::now());
        Some(existing)
    }

    /// Build a session while holding the id's gate
    async fn open_locked(&self, id: &str) -> Result<Arc<Session>> {
        // The caller ahead of us may have finished opening it
        if let Some(existing) = self.existing(id) {
            return Ok(existing);
        }
        let id = id.to_string();

        let credentials = Arc::new(
            CredentialManager::initialize(
                &id,
                &self.config.credentials,
                self.bootstrap.clone(),
                self.token_store.clone(),
            )
            .await?,
        );

        let store = if self.config.session.persist_history {
            ConversationStore::open(&id, session_log_path(&self.config, &id)).await?
        } else {
            ConversationStore::in_memory(&id)
        };

        let client = Arc::new(CapabilityClient::new(
            &self.config.protocol,
            self.registry.clone(),
            credentials.clone(),
            self.transport.clone(),
            self.limiter.clone(),
        ));
        let agent = Agent::new(
            self.config.agent.clone(),
            client,
            self.model.clone(),
            Arc::new(store),
        )
        .await?;

        let now = Utc::now();
        let session = Arc::new(Session {
            id: id.clone(),
            created_at: now,
            last_active: Mutex::new(now),
            agent,
            credentials,
        });

        self.sessions.write().insert(id.clone(), session.clone());
        info!("Opened session {}", id);
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Submit user text to a session's agent
    pub async fn submit(
        &self,
        session_id: &str,
        text: impl Into<String>,
    ) -> Result<(EventReceiver, TurnHandle)> {
        let session = self.get(session_id)?;
        session.touch(Utc::now());
        session.agent.submit_user_text(text).await
    }

    /// End a session, stopping any running turn
    pub fn close(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.agent.stop();
        info!("Closed session {}", session_id);
        Ok(())
    }

    /// Drop sessions idle longer than the configured timeout; returns their ids
    pub fn reap_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = Duration::from_secs(self.config.session.idle_timeout_secs);
        let mut sessions = self.sessions.write();

        let idle: Vec<String> = sessions
            .values()
            .filter(|s| s.is_idle(now, timeout))
            .map(|s| s.id.clone())
            .collect();

        for id in &idle {
            if let Some(session) = sessions.remove(id) {
                session.agent.stop();
                info!("Reaped idle session {}", id);
            }
        }
        idle
    }

    /// Run [`reap_idle`](Self::reap_idle) every `interval` until `shutdown`
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {
                        let reaped = manager.reap_idle(Utc::now());
                        if !reaped.is_empty() {
                            debug!("Reaper removed {} session(s)", reaped.len());
                        }
                    }
                }
            }
        })
    }
}

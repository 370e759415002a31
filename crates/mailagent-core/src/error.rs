//! Error types for MailAgent

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using MailAgent's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for MailAgent
#[derive(Error, Debug)]
pub enum Error {
    // Authentication errors
    #[error("Not authorized for session {session}: {reason}")]
    NotAuthorized { session: String, reason: String },

    #[error("Re-authentication required for session {session}: {reason}")]
    ReauthRequired { session: String, reason: String },

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Token storage error: {0}")]
    Token(String),

    // Conversation errors
    #[error("Conversation log rejected turn: {0}")]
    Conversation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is busy with another turn")]
    SessionBusy(String),

    // LLM errors
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM request timed out after {0} seconds")]
    LlmTimeout(u64),

    // Protocol errors
    #[error("MCP protocol error: {0}")]
    McpProtocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Returns true if this error indicates the user needs to re-authenticate
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Error::NotAuthorized { .. } | Error::ReauthRequired { .. }
        )
    }

    /// Returns an error code suitable for front-end error events
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotAuthorized { .. } | Error::ReauthRequired { .. } => "AUTH_EXPIRED",
            Error::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Error::SessionBusy(_) => "SESSION_BUSY",
            Error::Llm(_) | Error::LlmTimeout(_) => "LLM_ERROR",
            Error::McpProtocol(_) | Error::Transport(_) => "PROTOCOL_ERROR",
            Error::Conversation(_) => "CONVERSATION_ERROR",
            Error::Config(_) | Error::InvalidConfig { .. } => "CONFIG_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Returns a user-friendly action message for recoverable errors
    pub fn action_hint(&self) -> Option<&'static str> {
        match self {
            Error::NotAuthorized { .. } | Error::ReauthRequired { .. } => {
                Some("Please re-run the mail account consent flow and seed a new refresh token")
            }
            Error::SessionBusy(_) => Some("Wait for the current answer or stop it first"),
            Error::Llm(_) | Error::LlmTimeout(_) => Some("Check that the model server is running"),
            _ => None,
        }
    }
}

/// Failure of a single capability invocation.
///
/// Every variant is recorded in the conversation log as the result of the
/// call that produced it, so it serializes with a `kind` tag the model can
/// read back.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ToolError {
    /// Arguments or capability name rejected before dispatch. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The provider answered with something that does not fit the wire
    /// format or the output schema.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Business failure reported by the provider (e.g. message not found).
    #[error("capability error: {0}")]
    Capability(String),

    /// Timeout, 5xx or throttling that outlived the retry budget.
    #[error("transient network error after {attempts} attempt(s): {message}")]
    TransientNetwork { attempts: u32, message: String },

    /// The provider rejected the bearer token twice.
    #[error("authorization rejected: {0}")]
    Auth(String),

    /// Refresh failed; only a new consent flow can recover.
    #[error("re-authentication required: {0}")]
    ReauthRequired(String),

    /// A non-idempotent call may or may not have taken effect.
    #[error("outcome unknown: {0}")]
    AmbiguousOutcome(String),

    /// The turn was stopped before this call produced a result.
    #[error("cancelled before completion")]
    Cancelled,
}

impl ToolError {
    /// Short machine-readable code for logs and UI
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "VALIDATION_ERROR",
            ToolError::Protocol(_) => "PROTOCOL_ERROR",
            ToolError::Capability(_) => "CAPABILITY_ERROR",
            ToolError::TransientNetwork { .. } => "TRANSIENT_NETWORK_ERROR",
            ToolError::Auth(_) => "AUTH_ERROR",
            ToolError::ReauthRequired(_) => "REAUTH_REQUIRED",
            ToolError::AmbiguousOutcome(_) => "AMBIGUOUS_OUTCOME",
            ToolError::Cancelled => "CANCELLED",
        }
    }

    /// Returns true if this error ends the user turn instead of going back
    /// to the model
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::ReauthRequired(_))
    }
}

impl From<Error> for ToolError {
    fn from(err: Error) -> Self {
        if err.requires_reauth() {
            ToolError::ReauthRequired(err.to_string())
        } else {
            match err {
                Error::Json(e) => ToolError::Protocol(e.to_string()),
                Error::McpProtocol(msg) => ToolError::Protocol(msg),
                other => ToolError::Capability(other.to_string()),
            }
        }
    }
}

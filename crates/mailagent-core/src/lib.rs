//! MailAgent Core Library
//!
//! Conversational agent for a mail account: an LLM plans capability calls,
//! which are validated, authorized and dispatched over MCP-style JSON-RPC.

pub mod agent;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod llm;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, AgentEvent, LoopState, TurnHandle, TurnOutcome};
pub use config::Config;
pub use error::{Error, Result, ToolError};
pub use models::*;
pub use session::{Session, SessionManager};

/// Application name for config paths
pub const APP_NAME: &str = "mailagent";

//! Mail data structures exchanged with the capability provider

use serde::{Deserialize, Serialize};

/// Lightweight message summary returned by list and search capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    /// Provider message id
    pub id: String,

    /// Provider thread id
    pub thread_id: String,

    /// From header as sent (e.g. "Alice <alice@example.com>")
    pub from: String,

    /// Subject line
    #[serde(default)]
    pub subject: String,

    /// Date header as sent
    #[serde(default)]
    pub date: String,

    /// Preview snippet
    #[serde(default)]
    pub snippet: String,

    /// Provider labels (INBOX, UNREAD, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

impl MessageSummary {
    /// Check if the message still carries the UNREAD label
    pub fn is_unread(&self) -> bool {
        self.labels.iter().any(|l| l == "UNREAD")
    }

    /// One-line rendering for terminal output
    pub fn one_line(&self) -> String {
        format!("{} | {} | {}", self.date, self.from, self.subject)
    }
}

/// Result of `list_recent_messages`, `list_unread_messages` and `search_messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageList {
    pub count: usize,
    pub messages: Vec<MessageSummary>,
}

/// Full message returned by `get_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDetail {
    #[serde(flatten)]
    pub summary: MessageSummary,

    /// To header as sent
    #[serde(default)]
    pub to: String,

    /// Plain text body
    #[serde(default)]
    pub body: String,
}

/// Result of `send_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Id of the sent message
    pub id: String,

    /// Thread the message landed in
    pub thread_id: String,
}

/// Arguments of the list capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListArgs {
    #[serde(default = "default_count")]
    pub count: u32,
}

/// Arguments of `search_messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchArgs {
    /// Provider search query (e.g. "from:alice after:2024/05/01")
    pub query: String,

    #[serde(default = "default_search_count")]
    pub count: u32,
}

/// Arguments of `get_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMessageArgs {
    pub message_id: String,
}

/// Arguments of `send_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageArgs {
    /// Recipient email addresses
    pub to: Vec<String>,

    /// Subject line
    pub subject: String,

    /// Plain text body
    pub body: String,

    /// CC recipients
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
}

fn default_count() -> u32 {
    5
}

fn default_search_count() -> u32 {
    10
}

//! Data models for MailAgent
//!
//! Typed arguments and results of the mail capabilities.

mod message;

pub use message::*;

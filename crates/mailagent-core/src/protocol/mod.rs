//! Capability protocol: MCP `tools/call` over HTTP or a stdio child process

mod client;
mod http;
mod rate_limiter;
mod stdio;
mod transport;
mod wire;

pub use client::*;
pub use http::*;
pub use rate_limiter::*;
pub use stdio::*;
pub use transport::*;
pub use wire::*;

//! Transport seam between the capability client and the tool server

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::{CapabilityRequest, CapabilityResponse, HttpTransport, StdioTransport};
use crate::config::{ProtocolConfig, TransportConfig};
use crate::error::Result;

/// Failure to obtain a capability response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("bearer token rejected")]
    Unauthorized,

    #[error("server error (HTTP {0})")]
    Server(u16),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    /// No connection was established, so nothing reached the provider
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Timeouts, 5xx, throttling and connection failures may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::Server(_)
                | TransportError::RateLimited
                | TransportError::Network(_)
                | TransportError::Unreachable(_)
        )
    }

    /// The request may have reached the provider before failing
    pub fn may_have_executed(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Network(_))
    }

    /// The request never left this process
    pub fn never_sent(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}


/// Sends one capability request and waits for its response
#[async_trait]
pub trait CapabilityTransport: Send + Sync {
    async fn send(
        &self,
        request: &CapabilityRequest,
    ) -> std::result::Result<CapabilityResponse, TransportError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Build the transport selected in the configuration
pub async fn create_transport(config: &ProtocolConfig) -> Result<Arc<dyn CapabilityTransport>> {
    match &config.transport {
        TransportConfig::Http { endpoint } => Ok(Arc::new(HttpTransport::new(endpoint.clone()))),
        TransportConfig::Stdio { command, args } => {
            Ok(Arc::new(StdioTransport::spawn(command, args).await?))
        }
    }
}

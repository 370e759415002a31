//! Capability protocol client
//!
//! Turns a validated call into a wire request with a fresh bearer token,
//! applies the retry policy of the capability, and decodes the response
//! against the output schema.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{
    CallRateLimiter, CapabilityRequest, CapabilityResponse, CapabilityTransport, ResponseStatus,
    TransportError,
};
use crate::config::ProtocolConfig;
use crate::credentials::{BearerToken, CredentialManager};
use crate::error::ToolError;
use crate::registry::{CapabilityOutput, ToolRegistry, ValidatedCall};

/// Calls slower than this are logged as slow
const SLOW_CALL: Duration = Duration::from_secs(1);

/// Client for one session's capability invocations
pub struct CapabilityClient {
    registry: Arc<ToolRegistry>,
    credentials: Arc<CredentialManager>,
    transport: Arc<dyn CapabilityTransport>,
    limiter: CallRateLimiter,
    call_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    /// Non-idempotent call ids that have been put on the wire
    dispatched: Mutex<HashSet<String>>,
}

impl CapabilityClient {
    pub fn new(
        config: &ProtocolConfig,
        registry: Arc<ToolRegistry>,
        credentials: Arc<CredentialManager>,
        transport: Arc<dyn CapabilityTransport>,
        limiter: CallRateLimiter,
    ) -> Self {
        Self {
            registry,
            credentials,
            transport,
            limiter,
            call_timeout: config.call_timeout(),
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base(),
            dispatched: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Validate and invoke a capability by name
    pub async fn invoke(
        &self,
        call_id: &str,
        name: &str,
        arguments: &Value,
    ) -> Result<CapabilityOutput, ToolError> {
        let call = self.registry.validate(name, arguments)?;
        self.invoke_validated(call_id, &call).await
    }

    /// True once a non-idempotent call has been sent to the provider
    pub fn was_dispatched(&self, call_id: &str) -> bool {
        self.dispatched.lock().contains(call_id)
    }

    /// Invoke a call that already passed registry validation
    pub async fn invoke_validated(
        &self,
        call_id: &str,
        call: &ValidatedCall,
    ) -> Result<CapabilityOutput, ToolError> {
        let capability = call.capability();
        let idempotent = call.is_idempotent();
        let arguments = call.args.to_value();
        let start = Instant::now();

        info!("→ {} [{}]", capability, call_id);

        let mut bearer = self.credentials.get_valid_token().await?;

        // At most once per call id for capabilities with side effects
        if !idempotent && !self.dispatched.lock().insert(call_id.to_string()) {
            warn!("Refusing to resend {} [{}]", capability, call_id);
            return Err(ToolError::AmbiguousOutcome(format!(
                "{} call {} was already dispatched",
                capability, call_id
            )));
        }

        let mut refreshed = false;
        let mut failures: u32 = 0;

        let result = loop {
            let outcome = self.attempt(call_id, call, &arguments, &bearer).await;

            match outcome {
                Ok(response) => break self.finish(call_id, call, response),

                Err(TransportError::Unauthorized) if !refreshed => {
                    refreshed = true;
                    bearer = self.credentials.refresh_after_rejection(&bearer).await?;
                    debug!("Retrying {} [{}] with refreshed token", capability, call_id);
                }

                Err(TransportError::Unauthorized) => {
                    break Err(ToolError::Auth(format!(
                        "{} rejected the bearer token after a refresh",
                        capability
                    )));
                }

                Err(e) if !idempotent => {
                    if e.never_sent() {
                        self.dispatched.lock().remove(call_id);
                    }
                    break Err(if e.may_have_executed() {
                        ToolError::AmbiguousOutcome(format!("{} may have been applied: {}", capability, e))
                    } else if e.is_transient() {
                        ToolError::TransientNetwork {
                            attempts: 1,
                            message: e.to_string(),
                        }
                    } else {
                        ToolError::Protocol(e.to_string())
                    });
                }

                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        break Err(ToolError::TransientNetwork {
                            attempts: failures,
                            message: e.to_string(),
                        });
                    }

                    let backoff = self.backoff_base * 2u32.saturating_pow(failures - 1);
                    warn!(
                        "{} [{}] attempt {}/{} failed: {}, retrying in {:?}",
                        capability, call_id, failures, self.max_attempts, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    bearer = self.credentials.get_valid_token().await?;
                }

                Err(e) => break Err(ToolError::Protocol(e.to_string())),
            }
        };

        let elapsed_ms = start.elapsed().as_millis();
        match &result {
            Ok(_) if start.elapsed() > SLOW_CALL => {
                warn!("← {} [{}] OK ({}ms) SLOW", capability, call_id, elapsed_ms)
            }
            Ok(_) => info!("← {} [{}] OK ({}ms)", capability, call_id, elapsed_ms),
            Err(e) => error!("← {} [{}] ERROR ({}ms): {}", capability, call_id, elapsed_ms, e),
        }
        result
    }

    async fn attempt(
        &self,
        call_id: &str,
        call: &ValidatedCall,
        arguments: &Value,
        bearer: &BearerToken,
    ) -> Result<CapabilityResponse, TransportError> {
        let request = CapabilityRequest {
            call_id: call_id.to_string(),
            capability: call.capability(),
            arguments: arguments.clone(),
            bearer: bearer.clone(),
        };

        self.limiter.wait().await;
        match tokio::time::timeout(self.call_timeout, self.transport.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn finish(
        &self,
        call_id: &str,
        call: &ValidatedCall,
        response: CapabilityResponse,
    ) -> Result<CapabilityOutput, ToolError> {
        if response.call_id != call_id {
            return Err(ToolError::Protocol(format!(
                "response for call {} does not match request {}",
                response.call_id, call_id
            )));
        }

        match response.status {
            ResponseStatus::Success { payload } => {
                self.registry.decode_output(&call.descriptor, payload)
            }
            ResponseStatus::CapabilityError { error } => Err(ToolError::Capability(error)),
            ResponseStatus::ProtocolError { error } => Err(ToolError::Protocol(error)),
        }
    }
}

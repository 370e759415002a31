//! JSON-RPC over HTTP POST

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{
    decode_response, CapabilityRequest, CapabilityResponse, CapabilityTransport, JsonRpcResponse,
    TransportError,
};

/// Posts `tools/call` requests to a tool server endpoint with the bearer
/// token in the `Authorization` header
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CapabilityTransport for HttpTransport {
    async fn send(&self, request: &CapabilityRequest) -> Result<CapabilityResponse, TransportError> {
        let body = request.to_json_rpc(false);
        debug!(call_id = %request.call_id, capability = %request.capability, "POST {}", self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(request.bearer.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else if e.is_connect() {
                    TransportError::Unreachable(e.to_string())
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let rpc: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        decode_response(rpc)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn classify_status(status: StatusCode) -> Option<TransportError> {
    match status {
        s if s.is_success() => None,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(TransportError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => Some(TransportError::RateLimited),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Some(TransportError::Timeout),
        s if s.is_server_error() => Some(TransportError::Server(s.as_u16())),
        s => Some(TransportError::Malformed(format!("unexpected HTTP status {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            Some(TransportError::Unauthorized)
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(TransportError::RateLimited)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(TransportError::Server(502))
        );
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            Some(TransportError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        use crate::credentials::BearerToken;
        use crate::registry::Capability;

        // Port 9 (discard) is closed on test machines
        let transport = HttpTransport::new("http://127.0.0.1:9/mcp");
        let request = CapabilityRequest {
            call_id: "t-1".to_string(),
            capability: Capability::ListRecentMessages,
            arguments: serde_json::json!({"count": 5}),
            bearer: BearerToken::new("token", i64::MAX),
        };

        let err = transport.send(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert!(err.is_transient());
        assert!(!err.may_have_executed());
    }
}

//! JSON-RPC over the stdin/stdout of a spawned tool server

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    decode_response, CapabilityRequest, CapabilityResponse, CapabilityTransport, JsonRpcRequest,
    JsonRpcResponse, TransportError, MCP_PROTOCOL_VERSION,
};
use crate::error::{Error, Result};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// Removes a pending entry when its request finishes or is dropped
struct PendingEntry<'a> {
    pending: &'a PendingMap,
    id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Newline-delimited JSON-RPC with a tool server child process.
///
/// Responses are matched to requests by id, so several calls can be in
/// flight at once.
pub struct StdioTransport {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    _child: Option<Child>,
}

impl StdioTransport {
    /// Spawn `command` and perform the MCP `initialize` handshake
    pub async fn spawn(command: &str, args: &[String]) -> Result<Self> {
        info!("Spawning tool server: {} {}", command, args.join(" "));
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to spawn {}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("tool server stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("tool server stdout unavailable".to_string()))?;

        let mut transport = Self::from_streams(stdin, stdout);
        transport._child = Some(child);
        transport.initialize().await?;
        Ok(transport)
    }

    /// Speak the protocol over arbitrary streams (no handshake)
    pub fn from_streams<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_responses(reader, pending.clone()));

        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(0),
            reader,
            _child: None,
        }
    }

    async fn initialize(&self) -> Result<()> {
        let id = format!("init-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = JsonRpcRequest::new(
            id,
            "initialize",
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": crate::APP_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        );

        let response = self
            .roundtrip(&request)
            .await
            .map_err(|e| Error::McpProtocol(format!("initialize failed: {}", e)))?;
        if let Some(error) = response.error {
            return Err(Error::McpProtocol(format!(
                "initialize rejected: {}",
                error.message
            )));
        }

        let server = response
            .result
            .as_ref()
            .and_then(|r| r.get("serverInfo"))
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        info!("Tool server initialized: {}", server);

        self.write(&JsonRpcRequest::notification("notifications/initialized"))
            .await
            .map_err(|e| Error::McpProtocol(e.to_string()))
    }

    async fn write(&self, request: &JsonRpcRequest) -> std::result::Result<(), TransportError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| TransportError::Malformed(e.to_string()))?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))
    }

    async fn roundtrip(
        &self,
        request: &JsonRpcRequest,
    ) -> std::result::Result<JsonRpcResponse, TransportError> {
        let id = match &request.id {
            Some(Value::String(id)) => id.clone(),
            _ => return Err(TransportError::Malformed("request without id".to_string())),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        self.write(request).await?;
        rx.await
            .map_err(|_| TransportError::Network("tool server closed its output".to_string()))
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl CapabilityTransport for StdioTransport {
    async fn send(&self, request: &CapabilityRequest) -> std::result::Result<CapabilityResponse, TransportError> {
        // Every session shares this pipe, so correlate on a transport-wide id
        // rather than the session-scoped call id
        let mut rpc = request.to_json_rpc(true);
        let rpc_id = format!("rpc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        rpc.id = Some(Value::String(rpc_id.clone()));
        debug!(call_id = %request.call_id, rpc_id = %rpc_id, capability = %request.capability, "stdio tools/call");

        let mut response = self.roundtrip(&rpc).await?;
        response.id = Some(Value::String(request.call_id.clone()));
        decode_response(response)
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

async fn read_responses<R>(reader: R, pending: PendingMap)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Tool server closed stdout");
                break;
            }
            Err(e) => {
                warn!("Failed reading tool server output: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response: JsonRpcResponse = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                // Servers may log to stdout; skip anything that is not a response
                debug!("Ignoring non-response line from tool server: {}", e);
                continue;
            }
        };

        let id = match &response.id {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => continue,
        };

        match pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!("Response for unknown or abandoned request {}", id),
        }
    }

    // Dropping the senders wakes every waiter with an error
    pending.lock().clear();
}

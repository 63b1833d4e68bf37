//! MCP client for a single stdio server
//!
//! JSON-RPC correlation over the transport: a background receive loop routes
//! responses to pending oneshot channels by id. When the connection drops,
//! every pending request is rejected with `ServerExited`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::config::McpServerConfig;
use super::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, McpToolDef, ToolCallParams, ToolCallResult, ToolsListResult,
    PROTOCOL_VERSION,
};
use super::transport::StdioTransport;

/// MCP failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum McpFailure {
    #[error("MCP server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("MCP request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("MCP call error {code}: {message}")]
    CallError { code: i64, message: String },

    #[error("MCP server exited while the request was pending")]
    ServerExited,

    #[error("MCP protocol violation: {0}")]
    ProtocolViolation(String),
}

type Pending = Arc<RwLock<HashMap<i64, oneshot::Sender<Result<Value, McpFailure>>>>>;

/// Client for one connected stdio server.
pub struct McpClient {
    name: String,
    transport: Arc<StdioTransport>,
    next_id: AtomicI64,
    pending: Pending,
    request_timeout: Duration,
    /// Cancelled by the receive loop when the connection is lost.
    closed: CancellationToken,
    /// Stops the receive loop (and thereby releases the transport) when the
    /// client goes away.
    shutdown: CancellationToken,
}

impl McpClient {
    /// Spawn the server process and start the receive loop.
    pub async fn connect(
        name: &str,
        config: &McpServerConfig,
        working_dir: &Path,
    ) -> Result<Self, McpFailure> {
        info!(server = %name, command = %config.command, "connecting to MCP server");

        let transport = Arc::new(
            StdioTransport::spawn(&config.command, &config.args, &config.env, working_dir)
                .await
                .map_err(|e| McpFailure::ServerUnavailable(e.to_string()))?,
        );

        let pending: Pending = Arc::new(RwLock::new(HashMap::new()));
        let closed = CancellationToken::new();
        let shutdown = CancellationToken::new();

        let recv_transport = Arc::clone(&transport);
        let recv_pending = Arc::clone(&pending);
        let recv_closed = closed.clone();
        let recv_shutdown = shutdown.clone();
        let recv_name = name.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = recv_shutdown.cancelled() => {
                        debug!(server = %recv_name, "MCP receive loop shut down");
                        break;
                    }
                    result = recv_transport.receive() => match result {
                        Ok(message) => {
                            if let Err(e) = route_message(&message, &recv_pending).await {
                                error!(server = %recv_name, %e, "bad MCP message");
                            }
                        }
                        Err(e) => {
                            debug!(server = %recv_name, %e, "MCP receive loop ended");
                            let mut pending = recv_pending.write().await;
                            for (_, tx) in pending.drain() {
                                let _ = tx.send(Err(McpFailure::ServerExited));
                            }
                            recv_closed.cancel();
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            name: name.to_string(),
            transport,
            next_id: AtomicI64::new(1),
            pending,
            request_timeout: config.request_timeout(),
            closed,
            shutdown,
        })
    }

    /// Run the initialize handshake. Required before any other method.
    pub async fn initialize(&self) -> Result<InitializeResult, McpFailure> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "scuttle".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let result: InitializeResult = self
            .request(
                "initialize",
                Some(serde_json::to_value(params).expect("serializable params")),
            )
            .await?;

        info!(
            server = %self.name,
            protocol = %result.protocol_version,
            "MCP server initialized"
        );

        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpFailure> {
        let result: ToolsListResult = self.request("tools/list", None).await?;
        info!(server = %self.name, count = result.tools.len(), "listed MCP tools");
        Ok(result.tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpFailure> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: if arguments.is_null() {
                None
            } else {
                Some(arguments)
            },
        };
        self.request(
            "tools/call",
            Some(serde_json::to_value(params).expect("serializable params")),
        )
        .await
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<(), McpFailure> {
        let _: Value = self.request("ping", None).await?;
        Ok(())
    }

    /// Best-effort graceful shutdown request.
    pub async fn shutdown(&self) -> Result<(), McpFailure> {
        let _: Value = self.request("shutdown", None).await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    /// Resolves when the connection is lost.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// SIGKILL the server process (health-check failures).
    pub async fn kill(&self) {
        self.transport.kill().await;
    }

    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R, McpFailure> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&request)
            .map_err(|e| McpFailure::ProtocolViolation(e.to_string()))?;

        debug!(server = %self.name, id, method, "MCP request");

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);

        if let Err(e) = self.transport.send(&json).await {
            self.pending.write().await.remove(&id);
            return Err(McpFailure::ServerUnavailable(e.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => serde_json::from_value(value)
                .map_err(|e| McpFailure::ProtocolViolation(format!("bad {} result: {}", method, e))),
            Ok(Ok(Err(failure))) => Err(failure),
            Ok(Err(_)) => Err(McpFailure::ServerExited),
            Err(_) => {
                self.pending.write().await.remove(&id);
                Err(McpFailure::RequestTimeout(self.request_timeout))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpFailure> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification)
            .map_err(|e| McpFailure::ProtocolViolation(e.to_string()))?;
        self.transport
            .send(&json)
            .await
            .map_err(|e| McpFailure::ServerUnavailable(e.to_string()))
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        // Unblocks the receive loop so the transport (and the child, via
        // kill_on_drop) can be released.
        self.shutdown.cancel();
    }
}

/// Route one inbound message to its pending request.
async fn route_message(message: &str, pending: &Pending) -> anyhow::Result<()> {
    let response: JsonRpcResponse = serde_json::from_str(message)?;

    if let Some(id) = response.id {
        let mut pending = pending.write().await;
        if let Some(tx) = pending.remove(&id) {
            let outcome = match response.error {
                Some(error) => Err(McpFailure::CallError {
                    code: error.code,
                    message: error.message,
                }),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
        return Ok(());
    }

    if let Some(method) = &response.method {
        debug!(method = %method, "ignoring MCP notification");
    }
    Ok(())
}

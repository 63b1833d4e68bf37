//! MCP server lifecycle
//!
//! Tracks each configured server through a small state machine
//! (disconnected → connecting → connected → error → disconnected), runs
//! periodic health checks, and restarts crashed servers with exponential
//! backoff up to a per-server limit.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::client::{McpClient, McpFailure};
use super::config::McpServerConfig;
use super::protocol::{McpToolDef, ToolCallResult};

/// Connection state of one managed server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Disconnected => write!(f, "disconnected"),
            ServerState::Connecting => write!(f, "connecting"),
            ServerState::Connected => write!(f, "connected"),
            ServerState::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Reconnect delay for restart attempt `n` (1-based):
/// `min(1s * 2^(n-1), 30s)`.
pub fn restart_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let millis = 1_000u64.saturating_mul(1u64 << exponent).min(30_000);
    Duration::from_millis(millis)
}

struct ManagedServer {
    config: McpServerConfig,
    state: ServerState,
    client: Option<Arc<McpClient>>,
    tools: Vec<McpToolDef>,
    restart_count: u32,
    shutting_down: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl ManagedServer {
    fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            state: ServerState::Disconnected,
            client: None,
            tools: Vec::new(),
            restart_count: 0,
            shutting_down: false,
            tasks: Vec::new(),
        }
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Owner of all MCP child processes and their clients.
#[derive(Clone)]
pub struct McpManager {
    servers: Arc<RwLock<HashMap<String, ManagedServer>>>,
    working_dir: PathBuf,
}

impl McpManager {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            servers: Arc::new(RwLock::new(HashMap::new())),
            working_dir,
        }
    }

    /// Register a server configuration without connecting.
    pub async fn add_server(&self, name: &str, config: McpServerConfig) {
        self.servers
            .write()
            .await
            .insert(name.to_string(), ManagedServer::new(config));
    }

    /// Connect a configured server. Resets the restart counter.
    pub async fn connect(&self, name: &str) -> Result<(), McpFailure> {
        {
            let mut servers = self.servers.write().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| McpFailure::ServerUnavailable(format!("unknown server: {}", name)))?;
            entry.restart_count = 0;
            entry.shutting_down = false;
        }
        self.connect_inner(name).await
    }

    fn connect_inner<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), McpFailure>> + Send + 'a>> {
        Box::pin(async move {
        let config = {
            let mut servers = self.servers.write().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| McpFailure::ServerUnavailable(format!("unknown server: {}", name)))?;
            if entry.shutting_down {
                return Err(McpFailure::ServerUnavailable(format!(
                    "{} is shutting down",
                    name
                )));
            }
            entry.abort_tasks();
            entry.client = None;
            entry.state = ServerState::Connecting;
            entry.config.clone()
        };

        let connected = async {
            let client = McpClient::connect(name, &config, &self.working_dir).await?;
            client.initialize().await?;
            let tools = client.list_tools().await?;
            Ok::<_, McpFailure>((Arc::new(client), tools))
        }
        .await;

        let (client, tools) = match connected {
            Ok(pair) => pair,
            Err(failure) => {
                let mut servers = self.servers.write().await;
                if let Some(entry) = servers.get_mut(name) {
                    entry.state = ServerState::Error(failure.to_string());
                }
                return Err(failure);
            }
        };

        // Commit the connected entry before spawning the watchers so the
        // exit path always observes it. A child that dies in between still
        // wakes the monitor: the closed token stays cancelled.
        {
            let mut servers = self.servers.write().await;
            let entry = servers.get_mut(name).ok_or_else(|| {
                McpFailure::ServerUnavailable(format!("unknown server: {}", name))
            })?;
            entry.client = Some(Arc::clone(&client));
            entry.tools = tools;
            entry.state = ServerState::Connected;
            info!(server = %name, tools = entry.tools.len(), "MCP server connected");
        }

        let monitor = {
            let manager = self.clone();
            let server_name = name.to_string();
            let closed = client.closed();
            tokio::spawn(async move {
                closed.cancelled().await;
                manager.handle_exit(&server_name).await;
            })
        };

        let health = {
            let server_name = name.to_string();
            let health_client = Arc::clone(&client);
            let interval = config.health_check_interval();
            let closed = client.closed();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        _ = ticker.tick() => {
                            if health_client.ping().await.is_err() {
                                warn!(server = %server_name, "health check failed; killing server");
                                health_client.kill().await;
                                break;
                            }
                        }
                    }
                }
            })
        };

        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(name) {
            entry.tasks = vec![monitor, health];
        }
        Ok(())
        })
    }

    /// Child-exit path: mark disconnected and schedule a reconnect when the
    /// config allows and the restart budget is not exhausted.
    async fn handle_exit(&self, name: &str) {
        let reconnect_attempt = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(name) else {
                return;
            };
            entry.client = None;
            entry.state = ServerState::Disconnected;
            // Both watcher tasks unwind on their own via the closed token.

            if entry.shutting_down {
                return;
            }
            if !entry.config.restart_on_crash || entry.restart_count >= entry.config.max_restarts {
                info!(
                    server = %name,
                    restart_count = entry.restart_count,
                    "MCP server exited; not restarting"
                );
                return;
            }
            entry.restart_count += 1;
            entry.restart_count
        };

        let delay = restart_delay(reconnect_attempt);
        warn!(
            server = %name,
            attempt = reconnect_attempt,
            ?delay,
            "MCP server exited; scheduling reconnect"
        );

        let manager = self.clone();
        let server_name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = manager.connect_inner(&server_name).await {
                warn!(server = %server_name, %e, "MCP reconnect failed");
            }
        });
    }

    /// Graceful shutdown: suppress restarts, try the shutdown RPC, then kill.
    pub async fn shutdown(&self, name: &str) {
        let client = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(name) else {
                return;
            };
            entry.shutting_down = true;
            entry.abort_tasks();
            entry.state = ServerState::Disconnected;
            entry.client.take()
        };

        if let Some(client) = client {
            let _ = tokio::time::timeout(Duration::from_secs(2), client.shutdown()).await;
            client.kill().await;
        }
        info!(server = %name, "MCP server shut down");
    }

    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for name in names {
            self.shutdown(&name).await;
        }
    }

    /// Tools of every currently connected server.
    pub async fn connected_tools(&self) -> Vec<(String, McpToolDef)> {
        let servers = self.servers.read().await;
        let mut tools = Vec::new();
        for (name, entry) in servers.iter() {
            if entry.state == ServerState::Connected {
                for tool in &entry.tools {
                    tools.push((name.clone(), tool.clone()));
                }
            }
        }
        tools
    }

    /// Invoke a tool on a connected server.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpFailure> {
        let client = {
            let servers = self.servers.read().await;
            let entry = servers.get(server).ok_or_else(|| {
                McpFailure::ServerUnavailable(format!("unknown server: {}", server))
            })?;
            entry
                .client
                .clone()
                .ok_or_else(|| McpFailure::ServerUnavailable(format!("{} is not connected", server)))?
        };
        client.call_tool(tool, arguments).await
    }

    pub async fn server_state(&self, name: &str) -> Option<ServerState> {
        self.servers.read().await.get(name).map(|e| e.state.clone())
    }

    pub async fn restart_count(&self, name: &str) -> Option<u32> {
        self.servers.read().await.get(name).map(|e| e.restart_count)
    }
}

//! MCP stdio transport
//!
//! Newline-delimited JSON over a child process's stdin/stdout. One JSON
//! object per line in each direction.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::debug;

/// Stdio transport for a local MCP server.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
}

impl StdioTransport {
    /// Spawn the server process with the configured env and working dir.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: &Path,
    ) -> Result<Self> {
        tracing::info!(command = %command, ?args, "spawning MCP server");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(working_dir)
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow!("command not found: {}. Is it installed and in PATH?", command)
            } else {
                anyhow!("failed to spawn {}: {}", command, e)
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
        })
    }

    /// Send one message, newline-terminated.
    pub async fn send(&self, message: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        debug!(len = message.len(), "mcp message sent");
        Ok(())
    }

    /// Receive the next complete JSON line, skipping non-JSON noise.
    pub async fn receive(&self) -> Result<String> {
        let mut stdout = self.stdout.lock().await;

        loop {
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;

            if bytes == 0 {
                let mut child = self.child.lock().await;
                return match child.try_wait() {
                    Ok(Some(status)) => Err(anyhow!("MCP server exited with {}", status)),
                    Ok(None) => Err(anyhow!("MCP server closed stdout unexpectedly")),
                    Err(e) => Err(anyhow!("error checking MCP server status: {}", e)),
                };
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('{') {
                return Ok(line.to_string());
            }
            debug!("skipping non-JSON line from MCP server");
        }
    }

    /// Whether the child is still running.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// SIGKILL the child process.
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

//! Subprocess tool runtime
//!
//! Spawns and tracks the child processes behind the shell tool: foreground
//! runs with captured, capped output and background runs addressable by an
//! opaque `bg_N` id. The runtime is constructed once and shared by handle;
//! tools reach it through their execution context rather than a global.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Captured output above this many bytes is truncated with a marker.
pub const MAX_CAPTURED_OUTPUT_BYTES: usize = 30_000;

/// Outcome of a foreground command.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// stdout, then a newline, then stderr; truncated to the cap.
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn is_error(&self) -> bool {
        self.timed_out || self.exit_code != Some(0)
    }
}

/// Status of a background shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundStatus {
    Running,
    Exited { exit_code: Option<i32> },
    Killed,
}

/// Snapshot returned by `get_output`.
#[derive(Debug, Clone)]
pub struct BackgroundOutput {
    pub id: String,
    pub output: String,
    pub status: BackgroundStatus,
}

struct BackgroundEntry {
    command: String,
    pid: Option<u32>,
    buffer: Arc<Mutex<String>>,
    status: BackgroundStatus,
}

/// Process-wide table of child processes spawned for tools.
pub struct SubprocessRuntime {
    background: Arc<Mutex<HashMap<String, BackgroundEntry>>>,
    next_id: AtomicU64,
}

impl Default for SubprocessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessRuntime {
    pub fn new() -> Self {
        Self {
            background: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run a shell command to completion, capturing stdout and stderr.
    ///
    /// On timeout or cancellation the process tree gets SIGKILL and the
    /// partial output captured so far is returned with `timed_out` set.
    pub async fn run_foreground(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome> {
        let mut cmd = shell_command(command, working_dir, env);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to spawn command: {}", e))?;

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));

        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(pump_lines(pipe, Arc::clone(&stdout_buf))));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(pump_lines(pipe, Arc::clone(&stderr_buf))));

        let waited = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait()) => Some(result),
            _ = cancel.cancelled() => None,
        };

        let (exit_code, timed_out) = match waited {
            Some(Ok(wait_result)) => (wait_result.ok().and_then(|s| s.code()), false),
            // Timer elapsed or caller aborted: SIGKILL, keep partial output.
            Some(Err(_)) | None => {
                kill_process_tree(&mut child).await;
                (None, true)
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let stdout = stdout_buf.lock().await.clone();
        let stderr = stderr_buf.lock().await.clone();
        let output = truncate_captured(&combine_streams(&stdout, &stderr));

        Ok(ExecOutcome {
            output,
            exit_code,
            timed_out,
        })
    }

    /// Spawn a shell command detached from the caller and return its id.
    pub async fn spawn_background(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<String> {
        let id = format!("bg_{}", self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut cmd = shell_command(command, working_dir, env);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to spawn command: {}", e))?;
        let pid = child.id();

        let buffer = Arc::new(Mutex::new(String::new()));

        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(pump_lines(pipe, Arc::clone(&buffer))));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(pump_lines(pipe, Arc::clone(&buffer))));

        info!(id = %id, pid = ?pid, command = %command, "background process spawned");

        {
            let mut table = self.background.lock().await;
            table.insert(
                id.clone(),
                BackgroundEntry {
                    command: command.to_string(),
                    pid,
                    buffer: Arc::clone(&buffer),
                    status: BackgroundStatus::Running,
                },
            );
        }

        // Monitor completion; the entry stays in the table until its output
        // is retrieved.
        let monitor_id = id.clone();
        let runtime_table = Arc::clone(&self.background);
        tokio::spawn(async move {
            let status = child.wait().await;
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            let exit_code = status.map(|s| s.code()).unwrap_or(None);
            let mut table = runtime_table.lock().await;
            if let Some(entry) = table.get_mut(&monitor_id) {
                if entry.status == BackgroundStatus::Running {
                    entry.status = BackgroundStatus::Exited { exit_code };
                }
                debug!(id = %monitor_id, ?exit_code, "background process exited");
            }
        });

        Ok(id)
    }

    /// Current output of a background shell. Once a finished entry has been
    /// retrieved it is dropped from the table.
    pub async fn get_output(&self, id: &str) -> Result<BackgroundOutput> {
        let mut table = self.background.lock().await;
        let entry = table
            .get(id)
            .ok_or_else(|| anyhow!("no background process with id '{}'", id))?;

        let output = truncate_captured(&entry.buffer.lock().await.clone());
        let status = entry.status.clone();

        let snapshot = BackgroundOutput {
            id: id.to_string(),
            output,
            status: status.clone(),
        };

        if status != BackgroundStatus::Running {
            table.remove(id);
        }
        Ok(snapshot)
    }

    /// Whether the table currently knows this id.
    pub async fn contains(&self, id: &str) -> bool {
        self.background.lock().await.contains_key(id)
    }

    /// SIGKILL a background shell's process tree.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let mut table = self.background.lock().await;
        let entry = table
            .get_mut(id)
            .ok_or_else(|| anyhow!("no background process with id '{}'", id))?;

        if entry.status != BackgroundStatus::Running {
            return Err(anyhow!("process '{}' is not running", id));
        }

        if let Some(pid) = entry.pid {
            kill_pid_tree(pid);
        }
        entry.status = BackgroundStatus::Killed;
        info!(id = %id, command = %entry.command, "background process killed");
        Ok(())
    }
}

fn shell_command(command: &str, working_dir: &Path, env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.current_dir(working_dir);
    for (key, value) in env {
        cmd.env(key, value);
    }
    // New process group so the whole tree can be signalled together.
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

async fn pump_lines(pipe: impl tokio::io::AsyncRead + Unpin, buffer: Arc<Mutex<String>>) {
    let mut reader = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        let mut buf = buffer.lock().await;
        buf.push_str(&line);
        buf.push('\n');
    }
}

/// stdout first, then stderr, separated by a newline.
fn combine_streams(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim_end_matches('\n');
    let stderr = stderr.trim_end_matches('\n');
    match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{}\n{}", stdout, stderr),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (true, true) => String::new(),
    }
}

/// Cap captured output, noting how many characters were elided.
pub fn truncate_captured(output: &str) -> String {
    if output.len() <= MAX_CAPTURED_OUTPUT_BYTES {
        return output.to_string();
    }
    let mut boundary = MAX_CAPTURED_OUTPUT_BYTES;
    while boundary > 0 && !output.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let kept = &output[..boundary];
    let elided = output[boundary..].chars().count();
    format!(
        "{}[Output truncated - {} more characters not shown]",
        kept, elided
    )
}

async fn kill_process_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_pid_tree(pid);
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn kill_pid_tree(pid: u32) {
    #[cfg(unix)]
    {
        // Negative pid signals the whole process group.
        let group = format!("-{}", pid);
        let killed = std::process::Command::new("kill")
            .arg("-KILL")
            .arg(&group)
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !killed {
            let _ = std::process::Command::new("kill")
                .arg("-KILL")
                .arg(pid.to_string())
                .status();
        }
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
    }
}

//! Tool registry
//!
//! Name → tool map with per-call timeout and merged cancellation. Tools get
//! a context carrying the working directory, session id, environment
//! overlay, hook registry, and a cancellation token composed from the
//! caller's.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::hooks::HookRegistry;
use crate::agent::worker::WorkerManager;
use crate::ai::types::{ToolDefinition, ToolResultContent};
use crate::process::SubprocessRuntime;

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Hard cap for the shell tool.
pub const SHELL_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: ToolResultContent,
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(content: impl Into<ToolResultContent>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<ToolResultContent>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Parse a tool's input params, mapping failures to an error result the
/// model can see.
pub fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ToolResult> {
    serde_json::from_value(input).map_err(|e| ToolResult::error(format!("invalid input: {}", e)))
}

/// Registry-level failures. Execution exceptions are carried so the loop
/// can feed them back to the model as error tool results.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("no such tool: {0}")]
    NotFound(String),

    #[error("tool '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("tool call cancelled")]
    Cancelled,

    #[error(transparent)]
    Execute(#[from] anyhow::Error),
}

/// Per-call execution context.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub session_id: String,
    /// Environment overlay applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub cancel: CancellationToken,
    pub hooks: Arc<HookRegistry>,
    pub subprocesses: Option<Arc<SubprocessRuntime>>,
    pub workers: Option<Arc<WorkerManager>>,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            session_id: String::new(),
            env: HashMap::new(),
            cancel: CancellationToken::new(),
            hooks: Arc::new(HookRegistry::new()),
            subprocesses: None,
            workers: None,
        }
    }
}

impl ToolContext {
    pub fn new(working_dir: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            working_dir,
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_subprocesses(mut self, runtime: Arc<SubprocessRuntime>) -> Self {
        self.subprocesses = Some(runtime);
        self
    }

    pub fn with_workers(mut self, workers: Arc<WorkerManager>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// The same context scoped to one call: a child token, so either the
    /// caller's abort or the per-call timeout cancels the tool.
    fn for_call(&self, call_token: CancellationToken) -> Self {
        let mut ctx = self.clone();
        ctx.cancel = call_token;
        ctx
    }
}

/// A locally executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool input.
    fn input_schema(&self) -> Value;

    /// Per-tool timeout ceiling; the registry default otherwise.
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
}

/// Name → tool map.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "registering tool");
        self.tools.write().await.insert(name, tool);
    }

    pub async fn unregister_by_prefix(&self, prefix: &str) {
        let mut tools = self.tools.write().await;
        tools.retain(|name, _| !name.starts_with(prefix));
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Tool definitions for the model, optionally filtered by name.
    pub async fn definitions(&self, filter: Option<&[String]>) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .filter(|tool| match filter {
                Some(names) => names.iter().any(|n| n == tool.name()),
                None => true,
            })
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool with a timeout raced against a merged cancellation
    /// token. Either the caller's abort or the timer stops the call.
    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        ctx: &ToolContext,
        timeout_override: Option<Duration>,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(name)
            .await
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let timeout = timeout_override.unwrap_or_else(|| tool.timeout());
        let call_token = ctx.cancel.child_token();
        let call_ctx = ctx.for_call(call_token.clone());

        tokio::select! {
            result = tool.execute(input, &call_ctx) => {
                result.map_err(ToolError::Execute)
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(tool = name, ?timeout, "tool execution timed out");
                call_token.cancel();
                Err(ToolError::Timeout {
                    name: name.to_string(),
                    timeout,
                })
            }
            _ = ctx.cancel.cancelled() => {
                call_token.cancel();
                Err(ToolError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn execute(&self, input: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            let text = input["text"].as_str().unwrap_or_default().to_string();
            Ok(ToolResult::text(text))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Sleeps forever"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _input: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            ctx.cancel.cancelled().await;
            Ok(ToolResult::text("woke up"))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "Always errors"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            anyhow::bail!("disk on fire")
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let ctx = ToolContext::default();
        let err = registry
            .execute("missing", json!({}), &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let ctx = ToolContext::default();

        let result = registry
            .execute("echo", json!({"text": "hi"}), &ctx, None)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.render_text(), "hi");
    }

    #[tokio::test]
    async fn timeout_fires_near_configured_value() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await;
        let ctx = ToolContext::default();

        let timeout = Duration::from_millis(120);
        let start = Instant::now();
        let err = registry
            .execute("slow", json!({}), &ctx, Some(timeout))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn caller_cancellation_aborts_the_call() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await;

        let cancel = CancellationToken::new();
        let ctx = ToolContext::default().with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = registry
            .execute("slow", json!({}), &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn execution_errors_surface_as_execute_variant() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool)).await;
        let ctx = ToolContext::default();

        let err = registry
            .execute("failing", json!({}), &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execute(_)));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn definitions_respect_filter() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        registry.register(Arc::new(SlowTool)).await;

        let all = registry.definitions(None).await;
        assert_eq!(all.len(), 2);

        let filtered = registry
            .definitions(Some(&["echo".to_string()]))
            .await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "echo");
    }

    #[tokio::test]
    async fn unregister_by_prefix_drops_matching_tools() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        registry.register(Arc::new(SlowTool)).await;

        registry.unregister_by_prefix("ec").await;
        assert!(registry.get("echo").await.is_none());
        assert!(registry.get("slow").await.is_some());
    }
}

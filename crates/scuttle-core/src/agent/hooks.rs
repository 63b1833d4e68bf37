//! Hook system for tool and worker lifecycle interception.
//!
//! Handlers are registered per event kind and run in registration order.
//! A handler can block a dispatch, rewrite the tool input, or append text
//! to the API-visible tool result. Handler failures never block dispatch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// The interception points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    WorkerStart,
    WorkerStop,
}

/// Payload handed to handlers.
#[derive(Debug, Clone)]
pub struct HookInput {
    /// Tool name, or worker name for worker events.
    pub name: String,
    /// Tool input, or a worker description.
    pub input: Value,
    /// Present for `PostToolUse` and `WorkerStop`.
    pub result: Option<HookResultView>,
}

/// What a post-style handler sees of the outcome.
#[derive(Debug, Clone)]
pub struct HookResultView {
    pub content: String,
    pub is_error: bool,
}

impl HookInput {
    pub fn tool_call(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
            result: None,
        }
    }

    pub fn with_result(mut self, content: String, is_error: bool) -> Self {
        self.result = Some(HookResultView { content, is_error });
        self
    }
}

/// A handler's verdict.
#[derive(Debug, Clone)]
pub struct HookDecision {
    pub allow: bool,
    pub reason: Option<String>,
    /// Replacement tool input; threads through later handlers and dispatch.
    pub modified: Option<Value>,
    /// Text appended to the API-visible tool result content.
    pub append_to_result: Option<String>,
}

impl Default for HookDecision {
    fn default() -> Self {
        Self {
            allow: true,
            reason: None,
            modified: None,
            append_to_result: None,
        }
    }
}

impl HookDecision {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn modify(input: Value) -> Self {
        Self {
            modified: Some(input),
            ..Self::default()
        }
    }

    pub fn append(text: impl Into<String>) -> Self {
        Self {
            append_to_result: Some(text.into()),
            ..Self::default()
        }
    }
}

/// A registered interceptor.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn run(&self, event: HookEvent, input: &HookInput) -> anyhow::Result<HookDecision>;
}

/// Aggregate outcome of running a handler chain.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub allow: bool,
    pub reason: Option<String>,
    /// The effective input after any modifications.
    pub input: Value,
    /// Concatenated `append_to_result` fragments, in handler order.
    pub appended: String,
}

/// Ordered handlers per event kind. Mutable during setup only; `run`
/// snapshots the chain, so registration during iteration is tolerated.
#[derive(Default)]
pub struct HookRegistry {
    handlers: RwLock<HashMap<HookEvent, Vec<Arc<dyn HookHandler>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: HookEvent, handler: Arc<dyn HookHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(event).or_default().push(handler);
    }

    fn snapshot(&self, event: HookEvent) -> Vec<Arc<dyn HookHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&event).cloned().unwrap_or_default()
    }

    /// Run the chain for `event`. The first blocking handler wins; modified
    /// input threads through subsequent handlers; thrown handlers are logged
    /// and treated as permissive.
    pub async fn run(&self, event: HookEvent, mut input: HookInput) -> HookOutcome {
        let mut appended = String::new();

        for handler in self.snapshot(event) {
            let decision = match handler.run(event, &input).await {
                Ok(decision) => decision,
                Err(error) => {
                    warn!(?event, name = %input.name, %error, "hook handler failed; allowing");
                    continue;
                }
            };

            if let Some(modified) = decision.modified {
                input.input = modified;
            }
            if let Some(extra) = decision.append_to_result {
                appended.push_str(&extra);
            }
            if !decision.allow {
                return HookOutcome {
                    allow: false,
                    reason: decision.reason,
                    input: input.input,
                    appended,
                };
            }
        }

        HookOutcome {
            allow: true,
            reason: None,
            input: input.input,
            appended,
        }
    }
}

/// Built-in post hook that logs every tool execution.
pub struct LoggingHook;

#[async_trait]
impl HookHandler for LoggingHook {
    async fn run(&self, event: HookEvent, input: &HookInput) -> anyhow::Result<HookDecision> {
        if event == HookEvent::PostToolUse {
            if let Some(result) = &input.result {
                tracing::info!(
                    tool = %input.name,
                    is_error = result.is_error,
                    output_len = result.content.len(),
                    "tool execution completed"
                );
            }
        }
        Ok(HookDecision::allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BlockWrites;

    #[async_trait]
    impl HookHandler for BlockWrites {
        async fn run(&self, _event: HookEvent, input: &HookInput) -> anyhow::Result<HookDecision> {
            if input.name == "write" {
                Ok(HookDecision::block("deny write"))
            } else {
                Ok(HookDecision::allow())
            }
        }
    }

    struct RewriteCommand;

    #[async_trait]
    impl HookHandler for RewriteCommand {
        async fn run(&self, _event: HookEvent, input: &HookInput) -> anyhow::Result<HookDecision> {
            let mut modified = input.input.clone();
            modified["command"] = json!("echo rewritten");
            Ok(HookDecision::modify(modified))
        }
    }

    struct SeesModified {
        expected: Value,
    }

    #[async_trait]
    impl HookHandler for SeesModified {
        async fn run(&self, _event: HookEvent, input: &HookInput) -> anyhow::Result<HookDecision> {
            assert_eq!(input.input, self.expected);
            Ok(HookDecision::allow())
        }
    }

    struct Failing;

    #[async_trait]
    impl HookHandler for Failing {
        async fn run(&self, _event: HookEvent, _input: &HookInput) -> anyhow::Result<HookDecision> {
            anyhow::bail!("handler exploded")
        }
    }

    struct Appender(&'static str);

    #[async_trait]
    impl HookHandler for Appender {
        async fn run(&self, _event: HookEvent, _input: &HookInput) -> anyhow::Result<HookDecision> {
            Ok(HookDecision::append(self.0))
        }
    }

    #[tokio::test]
    async fn block_stops_the_chain_with_reason() {
        let registry = HookRegistry::new();
        registry.register(HookEvent::PreToolUse, Arc::new(BlockWrites));

        let outcome = registry
            .run(
                HookEvent::PreToolUse,
                HookInput::tool_call("write", json!({"path": "/x"})),
            )
            .await;
        assert!(!outcome.allow);
        assert_eq!(outcome.reason.as_deref(), Some("deny write"));

        let outcome = registry
            .run(
                HookEvent::PreToolUse,
                HookInput::tool_call("read", json!({})),
            )
            .await;
        assert!(outcome.allow);
    }

    #[tokio::test]
    async fn modified_input_threads_to_later_handlers_and_outcome() {
        let registry = HookRegistry::new();
        registry.register(HookEvent::PreToolUse, Arc::new(RewriteCommand));
        registry.register(
            HookEvent::PreToolUse,
            Arc::new(SeesModified {
                expected: json!({"command": "echo rewritten"}),
            }),
        );

        let outcome = registry
            .run(
                HookEvent::PreToolUse,
                HookInput::tool_call("shell", json!({"command": "echo original"})),
            )
            .await;
        assert!(outcome.allow);
        assert_eq!(outcome.input, json!({"command": "echo rewritten"}));
    }

    #[tokio::test]
    async fn failing_handler_is_permissive() {
        let registry = HookRegistry::new();
        registry.register(HookEvent::PreToolUse, Arc::new(Failing));

        let outcome = registry
            .run(
                HookEvent::PreToolUse,
                HookInput::tool_call("read", json!({})),
            )
            .await;
        assert!(outcome.allow);
    }

    #[tokio::test]
    async fn append_fragments_concatenate_in_order() {
        let registry = HookRegistry::new();
        registry.register(HookEvent::PostToolUse, Arc::new(Appender("\nnote-a")));
        registry.register(HookEvent::PostToolUse, Arc::new(Appender("\nnote-b")));

        let outcome = registry
            .run(
                HookEvent::PostToolUse,
                HookInput::tool_call("read", json!({})).with_result("ok".to_string(), false),
            )
            .await;
        assert_eq!(outcome.appended, "\nnote-a\nnote-b");
    }

    #[tokio::test]
    async fn events_are_isolated_by_kind() {
        let registry = HookRegistry::new();
        registry.register(HookEvent::PreToolUse, Arc::new(BlockWrites));

        let outcome = registry
            .run(
                HookEvent::PostToolUse,
                HookInput::tool_call("write", json!({})),
            )
            .await;
        assert!(outcome.allow);
    }
}

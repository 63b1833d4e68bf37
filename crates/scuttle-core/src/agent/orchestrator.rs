//! The agentic loop.
//!
//! One `AgentLoop` drives a session: request a streaming turn, reassemble
//! it, dispatch any tool calls, append everything to the in-memory history
//! and the transcript, and repeat until a terminal stop reason, the turn
//! budget, or cancellation. The loop runs as a spawned task and reports
//! through an unbounded event channel; the final event is always `done`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::ai::client::{MessageRequest, ModelTransport};
use crate::ai::types::{ModelMessage, StopReason, ThinkingConfig, Usage};
use crate::paths;
use crate::process::SubprocessRuntime;
use crate::tools::registry::{ToolContext, ToolRegistry};
use crate::transcript::TranscriptWriter;

use super::events::{AgentEvent, DoneInfo, DoneReason};
use super::executor;
use super::hooks::HookRegistry;
use super::stream::TurnAccumulator;
use super::worker::WorkerManager;

const DEFAULT_MAX_TURNS: usize = 50;

/// Caller-supplied history transformation applied under context pressure.
#[async_trait]
pub trait Compactor: Send + Sync {
    async fn compact(&self, messages: Vec<ModelMessage>) -> anyhow::Result<Vec<ModelMessage>>;
}

/// Auto-compaction policy.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub max_context_tokens: u64,
    /// Fraction of the context window that triggers compaction.
    pub threshold: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_context_tokens: 200_000,
            threshold: 0.80,
        }
    }
}

/// Shared services a loop runs against. Workers and nested loops share
/// these by reference.
#[derive(Clone)]
pub struct AgentServices {
    pub transport: Arc<dyn ModelTransport>,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub subprocesses: Arc<SubprocessRuntime>,
    pub workers: Option<Arc<WorkerManager>>,
}

impl AgentServices {
    pub fn new(
        transport: Arc<dyn ModelTransport>,
        tools: Arc<ToolRegistry>,
        hooks: Arc<HookRegistry>,
        subprocesses: Arc<SubprocessRuntime>,
    ) -> Self {
        Self {
            transport,
            tools,
            hooks,
            subprocesses,
            workers: None,
        }
    }

    pub fn with_workers(mut self, workers: Arc<WorkerManager>) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// Per-session loop configuration.
#[derive(Clone)]
pub struct AgentConfig {
    pub session_id: String,
    pub working_dir: PathBuf,
    /// Model override; the transport's default otherwise.
    pub model: Option<String>,
    /// Caller system blocks, appended after the protocol prefix.
    pub system: Vec<String>,
    /// Restrict the tools offered to the model (workers use subsets).
    pub tool_filter: Option<Vec<String>>,
    /// Opaque server-side tool specs passed through to the request.
    pub server_tools: Vec<Value>,
    pub thinking: Option<ThinkingConfig>,
    pub max_tokens: Option<usize>,
    pub max_turns: usize,
    /// Environment overlay handed to tools.
    pub env: HashMap<String, String>,
    pub auto_compact: CompactionConfig,
    pub compactor: Option<Arc<dyn Compactor>>,
    pub cancel: CancellationToken,
    /// Transcript root; `~/.claude/projects` when unset.
    pub transcript_root: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            model: None,
            system: Vec::new(),
            tool_filter: None,
            server_tools: Vec::new(),
            thinking: None,
            max_tokens: None,
            max_turns: DEFAULT_MAX_TURNS,
            env: HashMap::new(),
            auto_compact: CompactionConfig::default(),
            compactor: None,
            cancel: CancellationToken::new(),
            transcript_root: None,
        }
    }
}

/// The top-level turn loop. Re-entrant: a worker is just another instance
/// with its own session id and transcript.
pub struct AgentLoop {
    services: AgentServices,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(services: AgentServices, config: AgentConfig) -> Self {
        Self { services, config }
    }

    /// Start the loop. Events arrive on the returned receiver; the final
    /// event is always `done`.
    pub fn run(
        self,
        history: Vec<ModelMessage>,
        new_messages: Vec<ModelMessage>,
    ) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            self.run_inner(history, new_messages, event_tx).await;
        });
        event_rx
    }

    async fn run_inner(
        self,
        mut history: Vec<ModelMessage>,
        new_messages: Vec<ModelMessage>,
        event_tx: mpsc::UnboundedSender<AgentEvent>,
    ) {
        let AgentLoop { services, config } = self;

        let transcript_root = config
            .transcript_root
            .clone()
            .unwrap_or_else(paths::transcript_root);
        let writer =
            TranscriptWriter::new(&transcript_root, &config.working_dir, &config.session_id);

        for message in new_messages {
            history.push(message.clone());
            if let Err(e) = writer.append_user(&message).await {
                warn!(%e, "failed to append user message to transcript");
            }
        }

        let model = config
            .model
            .clone()
            .unwrap_or_else(|| services.transport.model());
        let cancel = config.cancel.clone();

        let tool_ctx = ToolContext {
            working_dir: config.working_dir.clone(),
            session_id: config.session_id.clone(),
            env: config.env.clone(),
            cancel: cancel.clone(),
            hooks: Arc::clone(&services.hooks),
            subprocesses: Some(Arc::clone(&services.subprocesses)),
            workers: services.workers.clone(),
        };

        let mut total_usage = Usage::default();
        let mut turn_count = 0usize;

        let stop_reason = 'session: loop {
            if turn_count >= config.max_turns {
                break DoneReason::MaxTurns;
            }
            turn_count += 1;

            // ── Request and stream one turn ────────────────────────
            let request = MessageRequest {
                messages: history.clone(),
                system: config.system.clone(),
                tools: services.tools.definitions(config.tool_filter.as_deref()).await,
                server_tools: config.server_tools.clone(),
                thinking: config.thinking,
                model: Some(model.clone()),
                max_tokens: config.max_tokens,
            };

            let mut stream = match services.transport.stream_message(request, &cancel).await {
                Ok(stream) => stream,
                Err(error) => {
                    let _ = event_tx.send(AgentEvent::Error {
                        message: error.to_string(),
                    });
                    break DoneReason::EndTurn;
                }
            };

            let mut accumulator = TurnAccumulator::new();
            let mut stream_errored = false;
            loop {
                tokio::select! {
                    // Checked first so a signalled abort never loses the
                    // race against buffered stream events.
                    biased;
                    _ = cancel.cancelled() => {
                        // Partial turn is discarded: no append, no write.
                        break 'session DoneReason::Cancelled;
                    }
                    event = stream.recv() => match event {
                        Some(event) => {
                            if let Some(agent_event) = accumulator.apply(event) {
                                let errored = matches!(agent_event, AgentEvent::Error { .. });
                                let _ = event_tx.send(agent_event);
                                if errored {
                                    stream_errored = true;
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
            if stream_errored {
                // The caller decides; no retry inside the loop.
                break DoneReason::EndTurn;
            }
            if cancel.is_cancelled() {
                break DoneReason::Cancelled;
            }

            // ── Materialize the assistant message ──────────────────
            let outcome = accumulator.finish();
            let turn_usage = outcome.usage;
            let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());

            if !outcome.content.is_empty() {
                let assistant = ModelMessage::assistant(outcome.content.clone());
                history.push(assistant.clone());
                if let Err(e) = writer
                    .append_assistant(&assistant, &model, outcome.stop_reason, &turn_usage, &request_id)
                    .await
                {
                    warn!(%e, "failed to append assistant message to transcript");
                }
            }
            total_usage.add(&turn_usage);

            // ── Auto-compaction ────────────────────────────────────
            if config.auto_compact.enabled {
                if let Some(compactor) = &config.compactor {
                    let effective = turn_usage
                        .input_tokens
                        .saturating_sub(turn_usage.cache_read_input_tokens);
                    let ratio = effective as f64 / config.auto_compact.max_context_tokens as f64;
                    if ratio >= config.auto_compact.threshold {
                        let previous_message_count = history.len();
                        match compactor.compact(history.clone()).await {
                            Ok(compacted) => {
                                history = compacted;
                                let _ = event_tx.send(AgentEvent::Compact {
                                    previous_message_count,
                                    new_message_count: history.len(),
                                });
                            }
                            Err(e) => warn!(%e, "compaction failed; keeping history"),
                        }
                    }
                }
            }

            // ── Branch on stop reason ──────────────────────────────
            match outcome.stop_reason {
                StopReason::ToolUse => {
                    let tool_calls = outcome.tool_calls();
                    if tool_calls.is_empty() {
                        break DoneReason::EndTurn;
                    }
                    match executor::run_tool_cycle(
                        &tool_calls,
                        &services.tools,
                        &tool_ctx,
                        &event_tx,
                    )
                    .await
                    {
                        Some(results) => {
                            let batch = ModelMessage::user(results);
                            history.push(batch.clone());
                            if let Err(e) = writer.append_user(&batch).await {
                                warn!(%e, "failed to append tool results to transcript");
                            }
                            let _ = event_tx.send(AgentEvent::TurnComplete {
                                turn: turn_count,
                                usage: turn_usage,
                            });
                        }
                        None => break DoneReason::Cancelled,
                    }
                }
                StopReason::EndTurn => {
                    let _ = event_tx.send(AgentEvent::TurnComplete {
                        turn: turn_count,
                        usage: turn_usage,
                    });
                    break DoneReason::EndTurn;
                }
                StopReason::MaxTokens => {
                    let _ = event_tx.send(AgentEvent::TurnComplete {
                        turn: turn_count,
                        usage: turn_usage,
                    });
                    break DoneReason::MaxTokens;
                }
            }
        };

        let _ = event_tx.send(AgentEvent::Done(DoneInfo {
            total_usage,
            stop_reason,
            turn_count,
            session_id: config.session_id.clone(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::error::ApiError;
    use crate::ai::sse::{BlockDelta, BlockStart, StreamEvent};
    use crate::tools::registry::{Tool, ToolResult};
    use crate::transcript::load_transcript;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    /// One scripted model turn: events to feed, then either close the
    /// stream or hang until the consumer goes away.
    struct ScriptedTurn {
        events: Vec<StreamEvent>,
        hang_after: bool,
    }

    impl ScriptedTurn {
        fn events(events: Vec<StreamEvent>) -> Self {
            Self {
                events,
                hang_after: false,
            }
        }

        fn hanging(events: Vec<StreamEvent>) -> Self {
            Self {
                events,
                hang_after: true,
            }
        }
    }

    struct ScriptedTransport {
        turns: Mutex<VecDeque<ScriptedTurn>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelTransport for ScriptedTransport {
        fn model(&self) -> String {
            "scripted-model".to_string()
        }

        async fn stream_message(
            &self,
            _request: MessageRequest,
            _cancel: &CancellationToken,
        ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let turn = self
                .turns
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| ApiError::Transport("script exhausted".to_string()))?;

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                for event in turn.events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                if turn.hang_after {
                    // Keep the stream open until the receiver is dropped.
                    tx.closed().await;
                }
            });
            Ok(rx)
        }
    }

    fn usage(input: u64, output: u64, cache_read: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cache_read_input_tokens: cache_read,
            ..Default::default()
        }
    }

    fn text_turn(text: &str, stop: StopReason, turn_usage: Usage) -> Vec<StreamEvent> {
        vec![
            StreamEvent::MessageStart { usage: turn_usage },
            StreamEvent::ContentBlockStart {
                index: 0,
                block: BlockStart::Text {
                    text: String::new(),
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Text(text.to_string()),
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta {
                stop_reason: Some(stop),
                output_tokens: Some(turn_usage.output_tokens),
            },
            StreamEvent::MessageStop,
        ]
    }

    fn tool_turn(id: &str, name: &str, input: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::MessageStart {
                usage: usage(50, 0, 0),
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                block: BlockStart::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::InputJson(input.to_string()),
            },
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta {
                stop_reason: Some(StopReason::ToolUse),
                output_tokens: Some(9),
            },
            StreamEvent::MessageStop,
        ]
    }

    struct ReadStub;

    #[async_trait]
    impl Tool for ReadStub {
        fn name(&self) -> &str {
            "Read"
        }
        fn description(&self) -> &str {
            "Read a file"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"file_path": {"type": "string"}}})
        }
        async fn execute(
            &self,
            _input: Value,
            _ctx: &ToolContext,
        ) -> anyhow::Result<ToolResult> {
            // Exactly 42 bytes of content.
            Ok(ToolResult::text("x".repeat(42)))
        }
    }

    struct WriteStub;

    #[async_trait]
    impl Tool for WriteStub {
        fn name(&self) -> &str {
            "Write"
        }
        fn description(&self) -> &str {
            "Write a file"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _input: Value,
            _ctx: &ToolContext,
        ) -> anyhow::Result<ToolResult> {
            panic!("blocked tool must not execute");
        }
    }

    async fn services_with(
        transport: Arc<dyn ModelTransport>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> AgentServices {
        let registry = Arc::new(ToolRegistry::new());
        for tool in tools {
            registry.register(tool).await;
        }
        AgentServices::new(
            transport,
            registry,
            Arc::new(HookRegistry::new()),
            Arc::new(SubprocessRuntime::new()),
        )
    }

    fn config_in(dir: &TempDir) -> AgentConfig {
        AgentConfig {
            session_id: "test-session".to_string(),
            working_dir: PathBuf::from("/work/project"),
            transcript_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn done_info(events: &[AgentEvent]) -> &DoneInfo {
        match events.last().expect("at least one event") {
            AgentEvent::Done(info) => info,
            other => panic!("last event was not done: {:?}", other),
        }
    }

    #[tokio::test]
    async fn two_turn_tool_cycle_writes_four_records() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            ScriptedTurn::events(tool_turn("t1", "Read", r#"{"file_path":"/tmp/x"}"#)),
            ScriptedTurn::events(text_turn("42 bytes", StopReason::EndTurn, usage(80, 5, 0))),
        ]);
        let services = services_with(transport.clone(), vec![Arc::new(ReadStub)]).await;
        let config = config_in(&dir);

        let events = collect(AgentLoop::new(services, config).run(
            Vec::new(),
            vec![ModelMessage::user_text("read /tmp/x then report size")],
        ))
        .await;

        let done = done_info(&events);
        assert_eq!(done.turn_count, 2);
        assert_eq!(done.stop_reason, DoneReason::EndTurn);

        // tool_use event, tool_result event, text event all present in order.
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                AgentEvent::ToolUse { .. } => "tool_use",
                AgentEvent::ToolResult { .. } => "tool_result",
                AgentEvent::Text { .. } => "text",
                AgentEvent::TurnComplete { .. } => "turn_complete",
                AgentEvent::Done(_) => "done",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "tool_use",
                "tool_result",
                "turn_complete",
                "text",
                "turn_complete",
                "done"
            ]
        );

        // Transcript: user, assistant(tool_use), user(tool_result), assistant(text).
        let path = crate::paths::transcript_file(
            dir.path(),
            Path::new("/work/project"),
            "test-session",
        );
        let loaded = load_transcript(&path).await.unwrap();
        assert_eq!(loaded.raw_line_count, 4);
        assert!(loaded.truncation.is_none());
        assert_eq!(loaded.messages[1].tool_use_ids(), vec!["t1"]);
        assert_eq!(loaded.messages[2].tool_result_ids(), vec!["t1"]);
    }

    #[tokio::test]
    async fn pre_hook_block_synthesizes_exact_error_result() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            ScriptedTurn::events(tool_turn("w1", "Write", r#"{"path":"/x"}"#)),
            ScriptedTurn::events(text_turn("understood", StopReason::EndTurn, usage(10, 2, 0))),
        ]);
        let services = services_with(transport, vec![Arc::new(WriteStub)]).await;

        struct DenyWrite;
        #[async_trait]
        impl crate::agent::hooks::HookHandler for DenyWrite {
            async fn run(
                &self,
                _event: crate::agent::hooks::HookEvent,
                input: &crate::agent::hooks::HookInput,
            ) -> anyhow::Result<crate::agent::hooks::HookDecision> {
                if input.name == "Write" {
                    Ok(crate::agent::hooks::HookDecision::block("deny write"))
                } else {
                    Ok(crate::agent::hooks::HookDecision::allow())
                }
            }
        }
        services.hooks.register(
            crate::agent::hooks::HookEvent::PreToolUse,
            Arc::new(DenyWrite),
        );

        let config = config_in(&dir);
        let events = collect(
            AgentLoop::new(services, config)
                .run(Vec::new(), vec![ModelMessage::user_text("write something")]),
        )
        .await;

        let blocked = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolResult {
                    content, is_error, ..
                } => Some((content.clone(), *is_error)),
                _ => None,
            })
            .expect("tool_result event");
        assert_eq!(blocked.0, "Tool blocked: deny write");
        assert!(blocked.1);

        // The loop proceeded to the next turn.
        assert_eq!(done_info(&events).turn_count, 2);
    }

    #[tokio::test]
    async fn cancellation_mid_stream_emits_only_done() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![ScriptedTurn::hanging(vec![
            StreamEvent::MessageStart {
                usage: usage(10, 0, 0),
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                block: BlockStart::Text {
                    text: String::new(),
                },
            },
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Text("partial".to_string()),
            },
        ])]);
        let services = services_with(transport, vec![]).await;
        let config = config_in(&dir);
        let cancel = config.cancel.clone();
        let transcript_path = crate::paths::transcript_file(
            dir.path(),
            Path::new("/work/project"),
            "test-session",
        );

        let mut rx = AgentLoop::new(services, config)
            .run(Vec::new(), vec![ModelMessage::user_text("hello")]);

        // Wait for the first text event, then cancel.
        loop {
            match rx.recv().await.expect("stream event") {
                AgentEvent::Text { .. } => break,
                _ => continue,
            }
        }
        cancel.cancel();

        // Exactly one further event: done{cancelled}.
        let next = rx.recv().await.expect("done event");
        match next {
            AgentEvent::Done(info) => assert_eq!(info.stop_reason, DoneReason::Cancelled),
            other => panic!("expected done, got {:?}", other),
        }
        assert!(rx.recv().await.is_none());

        // No assistant message was written for the discarded turn.
        let loaded = load_transcript(&transcript_path).await.unwrap();
        assert_eq!(loaded.raw_line_count, 1);
        assert_eq!(loaded.messages[0].role, crate::ai::types::Role::User);
    }

    #[tokio::test]
    async fn auto_compact_replaces_history_once_over_threshold() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![ScriptedTurn::events(text_turn(
            "big turn",
            StopReason::EndTurn,
            usage(700, 10, 100),
        ))]);
        let services = services_with(transport, vec![]).await;

        struct CountingCompactor {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl Compactor for CountingCompactor {
            async fn compact(
                &self,
                _messages: Vec<ModelMessage>,
            ) -> anyhow::Result<Vec<ModelMessage>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![ModelMessage::user_text("summary")])
            }
        }
        let compactor = Arc::new(CountingCompactor {
            calls: AtomicUsize::new(0),
        });

        let mut config = config_in(&dir);
        config.auto_compact = CompactionConfig {
            enabled: true,
            max_context_tokens: 1_000,
            threshold: 0.50,
        };
        config.compactor = Some(compactor.clone());

        let events = collect(
            AgentLoop::new(services, config)
                .run(Vec::new(), vec![ModelMessage::user_text("hello")]),
        )
        .await;

        // Effective (700 - 100) / 1000 = 0.6 ≥ 0.5 → exactly one compaction.
        assert_eq!(compactor.calls.load(Ordering::SeqCst), 1);
        let compact = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::Compact {
                    previous_message_count,
                    new_message_count,
                } => Some((*previous_message_count, *new_message_count)),
                _ => None,
            })
            .expect("compact event");
        // user + assistant before, compactor summary after.
        assert_eq!(compact, (2, 1));
    }

    #[tokio::test]
    async fn under_threshold_does_not_compact() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![ScriptedTurn::events(text_turn(
            "small turn",
            StopReason::EndTurn,
            usage(300, 10, 100),
        ))]);
        let services = services_with(transport, vec![]).await;

        struct NeverCompactor;
        #[async_trait]
        impl Compactor for NeverCompactor {
            async fn compact(
                &self,
                _messages: Vec<ModelMessage>,
            ) -> anyhow::Result<Vec<ModelMessage>> {
                panic!("must not compact under threshold");
            }
        }

        let mut config = config_in(&dir);
        config.auto_compact = CompactionConfig {
            enabled: true,
            max_context_tokens: 1_000,
            threshold: 0.50,
        };
        config.compactor = Some(Arc::new(NeverCompactor));

        let events = collect(
            AgentLoop::new(services, config)
                .run(Vec::new(), vec![ModelMessage::user_text("hello")]),
        )
        .await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, AgentEvent::Compact { .. })));
    }

    #[tokio::test]
    async fn max_turns_stops_the_loop() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            ScriptedTurn::events(tool_turn("t1", "Read", "{}")),
            ScriptedTurn::events(tool_turn("t2", "Read", "{}")),
            ScriptedTurn::events(tool_turn("t3", "Read", "{}")),
        ]);
        let services = services_with(transport, vec![Arc::new(ReadStub)]).await;
        let mut config = config_in(&dir);
        config.max_turns = 2;

        let events = collect(
            AgentLoop::new(services, config)
                .run(Vec::new(), vec![ModelMessage::user_text("loop forever")]),
        )
        .await;

        let done = done_info(&events);
        assert_eq!(done.stop_reason, DoneReason::MaxTurns);
        assert_eq!(done.turn_count, 2);
    }

    #[tokio::test]
    async fn transport_failure_emits_error_then_done() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![]);
        let services = services_with(transport, vec![]).await;
        let config = config_in(&dir);

        let events = collect(
            AgentLoop::new(services, config)
                .run(Vec::new(), vec![ModelMessage::user_text("hello")]),
        )
        .await;

        assert!(matches!(events[0], AgentEvent::Error { .. }));
        assert_eq!(done_info(&events).stop_reason, DoneReason::EndTurn);
    }

    #[tokio::test]
    async fn stream_error_event_ends_the_turn_without_retry() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![ScriptedTurn::events(vec![
            StreamEvent::MessageStart {
                usage: usage(10, 0, 0),
            },
            StreamEvent::Error {
                message: "overloaded".to_string(),
            },
        ])]);
        let services = services_with(transport.clone(), vec![]).await;
        let config = config_in(&dir);

        let events = collect(
            AgentLoop::new(services, config)
                .run(Vec::new(), vec![ModelMessage::user_text("hello")]),
        )
        .await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Error { message } if message == "overloaded")));
        assert_eq!(done_info(&events).stop_reason, DoneReason::EndTurn);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn usage_accumulates_across_turns() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            ScriptedTurn::events(tool_turn("t1", "Read", "{}")),
            ScriptedTurn::events(text_turn("done", StopReason::EndTurn, usage(80, 5, 20))),
        ]);
        let services = services_with(transport, vec![Arc::new(ReadStub)]).await;
        let config = config_in(&dir);

        let events = collect(
            AgentLoop::new(services, config)
                .run(Vec::new(), vec![ModelMessage::user_text("go")]),
        )
        .await;

        let done = done_info(&events);
        // Turn one: input 50 / output 9; turn two: input 80 / output 5.
        assert_eq!(done.total_usage.input_tokens, 130);
        assert_eq!(done.total_usage.output_tokens, 14);
        assert_eq!(done.total_usage.cache_read_input_tokens, 20);
    }
}

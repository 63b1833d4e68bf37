//! Worker manager: nested agent loops for sub-tasks.
//!
//! A worker is a full `AgentLoop` with its own session id and transcript,
//! sharing the process-wide services by reference. Foreground workers block
//! the caller; background workers return an id and are harvested later.
//! WorkerStart/WorkerStop hooks fire at the boundaries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ai::client::ModelTransport;
use crate::ai::types::{ModelMessage, Usage};
use crate::process::SubprocessRuntime;
use crate::tools::registry::ToolRegistry;

use super::events::{AgentEvent, DoneReason};
use super::hooks::{HookEvent, HookInput, HookRegistry};
use super::orchestrator::{AgentConfig, AgentLoop, AgentServices};

const DEFAULT_WORKER_MAX_TURNS: usize = 25;

/// System-prompt archetypes a worker can be spawned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerArchetype {
    /// Balanced sub-agent for delegated tasks.
    #[default]
    General,
    /// Read-oriented codebase investigation.
    Explorer,
    /// Critique of existing work without modifying it.
    Reviewer,
}

impl WorkerArchetype {
    pub fn system_prompt(&self) -> &'static str {
        match self {
            WorkerArchetype::General => {
                "You are a focused sub-agent. Complete the delegated task and \
                 reply with a concise report of what you did and found."
            }
            WorkerArchetype::Explorer => {
                "You are a codebase explorer. Investigate systematically with \
                 the available read-only tools, examine multiple files, and \
                 answer with specific file references."
            }
            WorkerArchetype::Reviewer => {
                "You are a reviewer. Inspect the work you are pointed at, do \
                 not modify anything, and report concrete findings ordered by \
                 severity."
            }
        }
    }
}

/// Configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub prompt: String,
    pub archetype: WorkerArchetype,
    pub model: Option<String>,
    /// Restrict the tool surface; all registry tools otherwise.
    pub tools: Option<Vec<String>>,
    pub max_turns: Option<usize>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            archetype: WorkerArchetype::default(),
            model: None,
            tools: None,
            max_turns: None,
        }
    }

    pub fn with_archetype(mut self, archetype: WorkerArchetype) -> Self {
        self.archetype = archetype;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Final report from a worker.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub worker_id: String,
    pub name: String,
    pub state: WorkerState,
    /// Concatenated assistant text from the worker's turns.
    pub output: String,
    pub turn_count: usize,
    pub usage: Usage,
    pub error: Option<String>,
}

struct WorkerEntry {
    name: String,
    state: WorkerState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<WorkerOutcome>>,
    outcome: Option<WorkerOutcome>,
}

type WorkerTable = Arc<RwLock<HashMap<String, WorkerEntry>>>;

/// Owner of all nested agent loops.
pub struct WorkerManager {
    transport: Arc<dyn ModelTransport>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    subprocesses: Arc<SubprocessRuntime>,
    working_dir: PathBuf,
    transcript_root: Option<PathBuf>,
    workers: WorkerTable,
}

impl WorkerManager {
    pub fn new(
        transport: Arc<dyn ModelTransport>,
        tools: Arc<ToolRegistry>,
        hooks: Arc<HookRegistry>,
        subprocesses: Arc<SubprocessRuntime>,
        working_dir: PathBuf,
        transcript_root: Option<PathBuf>,
    ) -> Self {
        Self {
            transport,
            tools,
            hooks,
            subprocesses,
            working_dir,
            transcript_root,
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run a worker to completion, blocking the caller.
    pub async fn run_foreground(&self, spec: WorkerSpec) -> WorkerOutcome {
        let (id, cancel) = self.register(&spec).await;
        let outcome = self.drive(id.clone(), spec, cancel).await;
        self.record_outcome(&id, outcome.clone()).await;
        outcome
    }

    /// Start a worker in the background; harvest it by the returned id.
    pub async fn spawn_background(&self, spec: WorkerSpec) -> String {
        let (id, cancel) = self.register(&spec).await;

        let driver = WorkerDriver {
            transport: Arc::clone(&self.transport),
            tools: Arc::clone(&self.tools),
            hooks: Arc::clone(&self.hooks),
            subprocesses: Arc::clone(&self.subprocesses),
            working_dir: self.working_dir.clone(),
            transcript_root: self.transcript_root.clone(),
            workers: Arc::clone(&self.workers),
        };
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let outcome = driver.drive(task_id.clone(), spec, cancel).await;
            driver.record(&task_id, outcome.clone()).await;
            outcome
        });

        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(&id) {
            entry.handle = Some(handle);
        }
        id
    }

    /// Await a background worker's outcome. Returns `None` for unknown ids;
    /// a finished worker's stored outcome is returned on repeat harvests.
    pub async fn harvest(&self, id: &str) -> Option<WorkerOutcome> {
        let handle = {
            let mut workers = self.workers.write().await;
            let entry = workers.get_mut(id)?;
            if let Some(outcome) = &entry.outcome {
                return Some(outcome.clone());
            }
            entry.handle.take()
        };

        match handle {
            Some(handle) => handle.await.ok(),
            None => {
                let workers = self.workers.read().await;
                workers.get(id).and_then(|e| e.outcome.clone())
            }
        }
    }

    pub async fn status(&self, id: &str) -> Option<WorkerState> {
        self.workers.read().await.get(id).map(|e| e.state)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.workers.read().await.contains_key(id)
    }

    /// Signal a worker's cancellation token.
    pub async fn cancel(&self, id: &str) {
        if let Some(entry) = self.workers.read().await.get(id) {
            entry.cancel.cancel();
        }
    }

    async fn register(&self, spec: &WorkerSpec) -> (String, CancellationToken) {
        let id = format!("worker-{}", uuid::Uuid::new_v4());
        let cancel = CancellationToken::new();
        info!(worker = %id, name = %spec.name, "worker registered");
        self.workers.write().await.insert(
            id.clone(),
            WorkerEntry {
                name: spec.name.clone(),
                state: WorkerState::Running,
                cancel: cancel.clone(),
                handle: None,
                outcome: None,
            },
        );
        (id, cancel)
    }

    async fn record_outcome(&self, id: &str, outcome: WorkerOutcome) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(id) {
            entry.state = outcome.state;
            entry.outcome = Some(outcome);
        }
    }

    async fn drive(&self, id: String, spec: WorkerSpec, cancel: CancellationToken) -> WorkerOutcome {
        let driver = WorkerDriver {
            transport: Arc::clone(&self.transport),
            tools: Arc::clone(&self.tools),
            hooks: Arc::clone(&self.hooks),
            subprocesses: Arc::clone(&self.subprocesses),
            working_dir: self.working_dir.clone(),
            transcript_root: self.transcript_root.clone(),
            workers: Arc::clone(&self.workers),
        };
        driver.drive(id, spec, cancel).await
    }
}

/// Everything a worker task needs without borrowing the manager.
struct WorkerDriver {
    transport: Arc<dyn ModelTransport>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    subprocesses: Arc<SubprocessRuntime>,
    working_dir: PathBuf,
    transcript_root: Option<PathBuf>,
    workers: WorkerTable,
}

impl WorkerDriver {
    async fn record(&self, id: &str, outcome: WorkerOutcome) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(id) {
            entry.state = outcome.state;
            entry.outcome = Some(outcome);
        }
    }

    async fn drive(&self, id: String, spec: WorkerSpec, cancel: CancellationToken) -> WorkerOutcome {
        self.hooks
            .run(
                HookEvent::WorkerStart,
                HookInput {
                    name: spec.name.clone(),
                    input: json!({"worker_id": id, "prompt": spec.prompt}),
                    result: None,
                },
            )
            .await;

        let services = AgentServices::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.tools),
            Arc::clone(&self.hooks),
            Arc::clone(&self.subprocesses),
        );

        let config = AgentConfig {
            session_id: id.clone(),
            working_dir: self.working_dir.clone(),
            model: spec.model.clone(),
            system: vec![spec.archetype.system_prompt().to_string()],
            tool_filter: spec.tools.clone(),
            max_turns: spec.max_turns.unwrap_or(DEFAULT_WORKER_MAX_TURNS),
            cancel: cancel.clone(),
            transcript_root: self.transcript_root.clone(),
            ..Default::default()
        };

        let mut events = AgentLoop::new(services, config)
            .run(Vec::new(), vec![ModelMessage::user_text(spec.prompt.clone())]);

        let mut output = String::new();
        let mut error: Option<String> = None;
        let mut turn_count = 0usize;
        let mut usage = Usage::default();
        let mut reason = DoneReason::EndTurn;

        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::Text { text } => output.push_str(&text),
                AgentEvent::Error { message } => error = Some(message),
                AgentEvent::Done(info) => {
                    turn_count = info.turn_count;
                    usage = info.total_usage;
                    reason = info.stop_reason;
                }
                _ => {}
            }
        }

        let state = match reason {
            DoneReason::Cancelled => WorkerState::Cancelled,
            _ if error.is_some() => WorkerState::Failed,
            _ => WorkerState::Completed,
        };

        self.hooks
            .run(
                HookEvent::WorkerStop,
                HookInput {
                    name: spec.name.clone(),
                    input: json!({"worker_id": id}),
                    result: None,
                }
                .with_result(output.clone(), state == WorkerState::Failed),
            )
            .await;

        info!(worker = %id, ?state, turns = turn_count, "worker finished");

        WorkerOutcome {
            worker_id: id,
            name: spec.name,
            state,
            output,
            turn_count,
            usage,
            error,
        }
    }
}

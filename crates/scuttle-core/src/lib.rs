//! Scuttle core: an embeddable agentic execution harness.
//!
//! Drives a multi-turn conversation with a streaming LLM endpoint,
//! interleaves locally executed tool calls with model content, and persists
//! an append-only JSON-lines transcript that sessions resume from. The
//! subsystems, leaves first:
//!
//! - [`ai`] — SSE framing, stream events, and the transport client.
//! - [`tools`] — the tool registry and the shell/task built-ins.
//! - [`process`] — foreground and background subprocess tracking.
//! - [`mcp`] — stdio JSON-RPC servers that contribute tools.
//! - [`agent`] — the loop itself: reassembly, hooks, workers, events.
//! - [`transcript`] — durable history with recovery-on-load.
//!
//! The loop emits [`agent::AgentEvent`]s on a channel and always terminates
//! with a `done` event; cancellation, timeouts, and tool failures are fed
//! back into the conversation rather than tearing the session down.

pub mod agent;
pub mod ai;
pub mod mcp;
pub mod paths;
pub mod process;
pub mod session;
pub mod tools;
pub mod transcript;

pub use agent::{
    AgentConfig, AgentEvent, AgentLoop, AgentServices, DoneInfo, DoneReason, HookDecision,
    HookEvent, HookHandler, HookInput, HookRegistry, WorkerManager, WorkerSpec, WorkerState,
};
pub use ai::{
    ApiClient, ApiConfig, ApiError, Content, CredentialSource, MessageRequest, ModelMessage,
    ModelTransport, Role, StaticCredentials, StopReason, Usage,
};
pub use mcp::{McpManager, McpServerConfig};
pub use process::SubprocessRuntime;
pub use session::Session;
pub use tools::{Tool, ToolContext, ToolError, ToolRegistry, ToolResult};
pub use transcript::{load_transcript, LoadedTranscript, TranscriptWriter, TruncationInfo};

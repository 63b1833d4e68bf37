//! Canonical event protocol for the agentic loop.
//!
//! `AgentEvent` is everything the loop emits. Embedders (a TUI, a server, a
//! worker harvesting a nested loop) consume these and map them to their own
//! presentation.

use serde::Serialize;
use serde_json::Value;

use crate::ai::types::Usage;

/// Events emitted by the agentic loop, in causal order within a session.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // ── Streaming ──────────────────────────────────────────────────────
    /// Text fragment from the live assistant stream.
    Text { text: String },

    /// A completed thinking block. Emitted once per block, never per delta.
    Thinking { text: String },

    /// A completed tool request with fully parsed input.
    ToolUse { id: String, name: String, input: Value },

    /// Server-executed tool invocation (pass-through).
    ServerToolUse { id: String, name: String, input: Value },

    /// Server-side web search results (pass-through).
    WebSearchResult { tool_use_id: String, content: Value },

    // ── Tool dispatch ──────────────────────────────────────────────────
    /// A local tool finished (or was blocked/failed).
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },

    // ── Turn lifecycle ─────────────────────────────────────────────────
    /// One request/response cycle completed.
    TurnComplete { turn: usize, usage: Usage },

    /// History was replaced by the compactor.
    Compact {
        previous_message_count: usize,
        new_message_count: usize,
    },

    /// Transport or stream error. Followed by a `done` event.
    Error { message: String },

    /// The loop has terminated. Always the final event.
    Done(DoneInfo),
}

/// Summary carried by the terminal `done` event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DoneInfo {
    pub total_usage: Usage,
    pub stop_reason: DoneReason,
    pub turn_count: usize,
    pub session_id: String,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    EndTurn,
    MaxTokens,
    MaxTurns,
    Cancelled,
}

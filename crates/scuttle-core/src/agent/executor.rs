//! Tool dispatch for one assistant turn.
//!
//! Runs the PreToolUse chain, executes each call sequentially through the
//! registry, applies PostToolUse appends, and batches every result into a
//! single user message. Tool failures become error results the model can
//! see and recover from; only cancellation stops the cycle.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::ai::types::{Content, ToolCallRequest, ToolResultContent};
use crate::tools::registry::{ToolContext, ToolError, ToolRegistry, ToolResult};

use super::events::AgentEvent;
use super::hooks::{HookEvent, HookInput};

/// Execute a turn's tool calls in order. Returns the `tool_result` blocks
/// for the follow-up user message, or `None` when the cycle was cancelled
/// (in which case nothing must be appended).
pub(crate) async fn run_tool_cycle(
    tool_calls: &[ToolCallRequest],
    registry: &Arc<ToolRegistry>,
    ctx: &ToolContext,
    event_tx: &mpsc::UnboundedSender<AgentEvent>,
) -> Option<Vec<Content>> {
    let mut results = Vec::with_capacity(tool_calls.len());

    for call in tool_calls {
        if ctx.cancel.is_cancelled() {
            return None;
        }

        // ── PreToolUse ─────────────────────────────────────────────
        let pre = ctx
            .hooks
            .run(
                HookEvent::PreToolUse,
                HookInput::tool_call(&call.name, call.input.clone()),
            )
            .await;

        if !pre.allow {
            let reason = pre.reason.unwrap_or_else(|| "blocked by hook".to_string());
            let content = format!("Tool blocked: {}", reason);
            push_result(&mut results, event_tx, &call.id, content.into(), true);
            continue;
        }
        let effective_input = pre.input;

        // ── Dispatch ───────────────────────────────────────────────
        let result = match registry
            .execute(&call.name, effective_input.clone(), ctx, None)
            .await
        {
            Ok(result) => result,
            Err(ToolError::Cancelled) => return None,
            Err(error) => {
                warn!(tool = %call.name, %error, "tool execution failed");
                ToolResult::error(error.to_string())
            }
        };

        // ── PostToolUse ────────────────────────────────────────────
        let mut content = result.content;
        let post = ctx
            .hooks
            .run(
                HookEvent::PostToolUse,
                HookInput::tool_call(&call.name, effective_input)
                    .with_result(content.render_text(), result.is_error),
            )
            .await;
        if !post.appended.is_empty() {
            content.append_text(&post.appended);
        }

        push_result(&mut results, event_tx, &call.id, content, result.is_error);
    }

    Some(results)
}

fn push_result(
    results: &mut Vec<Content>,
    event_tx: &mpsc::UnboundedSender<AgentEvent>,
    tool_use_id: &str,
    content: ToolResultContent,
    is_error: bool,
) {
    let _ = event_tx.send(AgentEvent::ToolResult {
        tool_use_id: tool_use_id.to_string(),
        content: content.render_text(),
        is_error,
    });
    results.push(Content::ToolResult {
        tool_use_id: tool_use_id.to_string(),
        content,
        is_error: if is_error { Some(true) } else { None },
    });
}

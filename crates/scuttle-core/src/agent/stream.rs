//! Stream reassembly for a single model turn.
//!
//! `TurnAccumulator` is a state machine over parser events: each applied
//! event may emit one live `AgentEvent`, and finalization materializes the
//! assistant message from the per-index block array.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::ai::sse::{BlockDelta, BlockStart, StreamEvent};
use crate::ai::types::{Content, StopReason, ToolCallRequest, Usage};

use super::events::AgentEvent;

/// One content block being reassembled at a stream index.
enum BlockAccumulator {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
    Thinking {
        text: String,
        signature: String,
    },
    /// Finished blocks, and blocks that arrive complete (server tools).
    Ready(Content),
    /// Unrecognized block type; dropped at finalization.
    Ignored,
}

/// Result of a fully reassembled turn.
pub struct TurnOutcome {
    pub content: Vec<Content>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl TurnOutcome {
    /// The turn's locally dispatchable tool requests, in block order.
    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::ToolUse { id, name, input } => Some(ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Reassembles indexed, delta-encoded content blocks into a message while
/// emitting live agent events.
#[derive(Default)]
pub struct TurnAccumulator {
    blocks: BTreeMap<usize, BlockAccumulator>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one parser event; returns the agent event to surface, if any.
    pub fn apply(&mut self, event: StreamEvent) -> Option<AgentEvent> {
        match event {
            StreamEvent::MessageStart { usage } => {
                self.usage.input_tokens = usage.input_tokens;
                self.usage.output_tokens = usage.output_tokens;
                self.usage.cache_creation_input_tokens = usage.cache_creation_input_tokens;
                self.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
                None
            }

            StreamEvent::ContentBlockStart { index, block } => self.start_block(index, block),

            StreamEvent::ContentBlockDelta { index, delta } => self.apply_delta(index, delta),

            StreamEvent::ContentBlockStop { index } => self.stop_block(index),

            StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if let Some(tokens) = output_tokens {
                    self.usage.output_tokens = tokens;
                }
                None
            }

            StreamEvent::MessageStop | StreamEvent::Ping => None,

            StreamEvent::Error { message } => Some(AgentEvent::Error { message }),
        }
    }

    fn start_block(&mut self, index: usize, block: BlockStart) -> Option<AgentEvent> {
        match block {
            BlockStart::Text { text } => {
                let event = if text.is_empty() {
                    None
                } else {
                    Some(AgentEvent::Text { text: text.clone() })
                };
                self.blocks.insert(index, BlockAccumulator::Text(text));
                event
            }
            BlockStart::ToolUse { id, name } => {
                self.blocks.insert(
                    index,
                    BlockAccumulator::ToolUse {
                        id,
                        name,
                        input_json: String::new(),
                    },
                );
                None
            }
            BlockStart::Thinking => {
                self.blocks.insert(
                    index,
                    BlockAccumulator::Thinking {
                        text: String::new(),
                        signature: String::new(),
                    },
                );
                None
            }
            BlockStart::ServerToolUse { id, name, input } => {
                let event = AgentEvent::ServerToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                };
                self.blocks.insert(
                    index,
                    BlockAccumulator::Ready(Content::ServerToolUse { id, name, input }),
                );
                Some(event)
            }
            BlockStart::WebSearchToolResult {
                tool_use_id,
                content,
            } => {
                let event = AgentEvent::WebSearchResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                };
                self.blocks.insert(
                    index,
                    BlockAccumulator::Ready(Content::WebSearchToolResult {
                        tool_use_id,
                        content,
                    }),
                );
                Some(event)
            }
            BlockStart::Other => {
                self.blocks.insert(index, BlockAccumulator::Ignored);
                None
            }
        }
    }

    fn apply_delta(&mut self, index: usize, delta: BlockDelta) -> Option<AgentEvent> {
        let Some(acc) = self.blocks.get_mut(&index) else {
            warn!(index, "delta for unknown content block");
            return None;
        };

        match (acc, delta) {
            (BlockAccumulator::Text(text), BlockDelta::Text(fragment)) => {
                text.push_str(&fragment);
                Some(AgentEvent::Text { text: fragment })
            }
            (BlockAccumulator::ToolUse { input_json, .. }, BlockDelta::InputJson(fragment)) => {
                input_json.push_str(&fragment);
                None
            }
            // Thinking is surfaced only once the block is complete.
            (BlockAccumulator::Thinking { text, .. }, BlockDelta::Thinking(fragment)) => {
                text.push_str(&fragment);
                None
            }
            (BlockAccumulator::Thinking { signature, .. }, BlockDelta::Signature(fragment)) => {
                signature.push_str(&fragment);
                None
            }
            _ => {
                warn!(index, "delta type does not match open block");
                None
            }
        }
    }

    fn stop_block(&mut self, index: usize) -> Option<AgentEvent> {
        let acc = self.blocks.remove(&index)?;
        let (content, event) = match acc {
            BlockAccumulator::Text(text) => (Content::Text { text }, None),
            BlockAccumulator::ToolUse {
                id,
                name,
                input_json,
            } => {
                let input = parse_tool_input(&name, &input_json);
                let event = AgentEvent::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                };
                (Content::ToolUse { id, name, input }, Some(event))
            }
            BlockAccumulator::Thinking { text, signature } => {
                let event = AgentEvent::Thinking { text: text.clone() };
                let signature = if signature.is_empty() {
                    None
                } else {
                    Some(signature)
                };
                (
                    Content::Thinking {
                        thinking: text,
                        signature,
                    },
                    Some(event),
                )
            }
            BlockAccumulator::Ready(content) => (content, None),
            BlockAccumulator::Ignored => return None,
        };
        self.blocks.insert(index, BlockAccumulator::Ready(content));
        event
    }

    /// Materialize the final assistant content in index order.
    pub fn finish(mut self) -> TurnOutcome {
        let mut content = Vec::with_capacity(self.blocks.len());
        // Close any block the stream left open.
        let open: Vec<usize> = self.blocks.keys().copied().collect();
        for index in open {
            self.stop_block(index);
        }
        for (_, acc) in std::mem::take(&mut self.blocks) {
            if let BlockAccumulator::Ready(block) = acc {
                content.push(block);
            }
        }
        TurnOutcome {
            content,
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
            usage: self.usage,
        }
    }
}

/// Parse accumulated tool-input JSON. Empty and malformed both become an
/// empty object; malformed input is flagged in the logs.
fn parse_tool_input(name: &str, input_json: &str) -> Value {
    if input_json.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(input_json) {
        Ok(value) => value,
        Err(error) => {
            warn!(tool = name, %error, "malformed tool input JSON; substituting empty object");
            Value::Object(Default::default())
        }
    }
}

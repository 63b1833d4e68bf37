//! Server-Sent Events framing and typed stream events
//!
//! The provider streams a turn as SSE: each event is a group of lines
//! separated from the next event by a blank line. Only `event:` and `data:`
//! lines matter here; the data payload is JSON. Events with no type, no
//! data, or unparseable data are dropped.

use serde_json::Value;
use tracing::debug;

use super::types::{StopReason, Usage};

/// A typed event from the provider's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Start of a message; carries the initial usage snapshot.
    MessageStart { usage: Usage },
    /// A new content block opened at `index`.
    ContentBlockStart { index: usize, block: BlockStart },
    /// Incremental payload for the block at `index`.
    ContentBlockDelta { index: usize, delta: BlockDelta },
    /// The block at `index` is complete.
    ContentBlockStop { index: usize },
    /// Carries the stop reason and the updated output-token count.
    MessageDelta {
        stop_reason: Option<StopReason>,
        output_tokens: Option<u64>,
    },
    MessageStop,
    Ping,
    /// Provider-reported stream error.
    Error { message: String },
}

/// Initial shape of a content block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text { text: String },
    ToolUse { id: String, name: String },
    Thinking,
    /// Arrives complete; never dispatched locally.
    ServerToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Arrives complete; paired with a prior server tool use.
    WebSearchToolResult { tool_use_id: String, content: Value },
    /// Unrecognized block type; the reassembler ignores it.
    Other,
}

/// Delta shapes for an open content block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    Text(String),
    InputJson(String),
    Thinking(String),
    Signature(String),
}

/// Incremental SSE framer over a byte stream.
///
/// Bytes are buffered until a blank line completes an event; the trailing
/// fragment stays buffered across `feed` calls, so events may be split at
/// arbitrary byte boundaries, including mid-codepoint.
#[derive(Default)]
pub struct SseFramer {
    buf: Vec<u8>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every completed event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut start = 0usize;

        while let Some(pos) = find_blank_line(&self.buf[start..]) {
            let segment = &self.buf[start..start + pos];
            if let Some(event) = parse_event_block(segment) {
                events.push(event);
            }
            start += pos + 2;
        }

        if start > 0 {
            self.buf.drain(..start);
        }
        events
    }

    /// End of stream: parse any residual fragment once.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buf);
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        parse_event_block(&rest)
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Parse one event's lines. The last `event:` and `data:` values win.
fn parse_event_block(segment: &[u8]) -> Option<StreamEvent> {
    let text = String::from_utf8_lossy(segment);

    let mut event_type: Option<&str> = None;
    let mut data: Option<&str> = None;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim());
        }
    }

    let event_type = event_type?;
    let data = data?;
    let json: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => {
            debug!(event_type, "dropping SSE event with invalid JSON data");
            return None;
        }
    };

    decode_stream_event(event_type, &json)
}

fn str_field<'a>(json: &'a Value, key: &str) -> &'a str {
    json.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn index_field(json: &Value) -> usize {
    json.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize
}

fn parse_usage(usage: &Value) -> Usage {
    let field = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    Usage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_creation_input_tokens: field("cache_creation_input_tokens"),
        cache_read_input_tokens: field("cache_read_input_tokens"),
    }
}

/// Decode one typed stream event from its SSE type and JSON payload.
pub fn decode_stream_event(event_type: &str, json: &Value) -> Option<StreamEvent> {
    match event_type {
        "message_start" => {
            let usage = json
                .get("message")
                .and_then(|m| m.get("usage"))
                .map(parse_usage)
                .unwrap_or_default();
            Some(StreamEvent::MessageStart { usage })
        }

        "content_block_start" => {
            let index = index_field(json);
            let block = json.get("content_block")?;
            let start = match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => BlockStart::Text {
                    text: str_field(block, "text").to_string(),
                },
                Some("tool_use") => BlockStart::ToolUse {
                    id: str_field(block, "id").to_string(),
                    name: str_field(block, "name").to_string(),
                },
                Some("thinking") => BlockStart::Thinking,
                Some("server_tool_use") => BlockStart::ServerToolUse {
                    id: str_field(block, "id").to_string(),
                    name: str_field(block, "name").to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                },
                Some("web_search_tool_result") => BlockStart::WebSearchToolResult {
                    tool_use_id: str_field(block, "tool_use_id").to_string(),
                    content: block.get("content").cloned().unwrap_or(Value::Null),
                },
                _ => BlockStart::Other,
            };
            Some(StreamEvent::ContentBlockStart { index, block: start })
        }

        "content_block_delta" => {
            let index = index_field(json);
            let delta = json.get("delta")?;
            let delta = match delta.get("type").and_then(|t| t.as_str()) {
                Some("text_delta") => BlockDelta::Text(str_field(delta, "text").to_string()),
                Some("input_json_delta") => {
                    BlockDelta::InputJson(str_field(delta, "partial_json").to_string())
                }
                Some("thinking_delta") => {
                    BlockDelta::Thinking(str_field(delta, "thinking").to_string())
                }
                Some("signature_delta") => {
                    BlockDelta::Signature(str_field(delta, "signature").to_string())
                }
                _ => return None,
            };
            Some(StreamEvent::ContentBlockDelta { index, delta })
        }

        "content_block_stop" => Some(StreamEvent::ContentBlockStop {
            index: index_field(json),
        }),

        "message_delta" => {
            let stop_reason = json
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|s| s.as_str())
                .map(StopReason::parse);
            let output_tokens = json
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|t| t.as_u64());
            Some(StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            })
        }

        "message_stop" => Some(StreamEvent::MessageStop),
        "ping" => Some(StreamEvent::Ping),

        "error" => {
            let message = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown stream error")
                .to_string();
            Some(StreamEvent::Error { message })
        }

        _ => None,
    }
}

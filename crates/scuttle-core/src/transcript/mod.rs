//! Append-only JSON-lines transcript
//!
//! One JSON object per line. User and assistant entries carry the message
//! plus session metadata; readers tolerate unknown fields. Loading
//! reconstructs the message history and truncates at the first interrupted
//! tool cycle so resume is always safe.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::ai::types::{Content, ModelMessage, Role, StopReason, Usage};
use crate::paths;

/// Append-only writer for one session's transcript.
pub struct TranscriptWriter {
    path: PathBuf,
    session_id: String,
    cwd: PathBuf,
}

impl TranscriptWriter {
    pub fn new(root: &Path, working_dir: &Path, session_id: &str) -> Self {
        Self {
            path: paths::transcript_file(root, working_dir, session_id),
            session_id: session_id.to_string(),
            cwd: working_dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a user-role entry (inputs and tool-result batches).
    pub async fn append_user(&self, message: &ModelMessage) -> Result<()> {
        let record = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": message.content,
            },
            "sessionId": self.session_id,
            "timestamp": Utc::now().to_rfc3339(),
            "uuid": uuid::Uuid::new_v4().to_string(),
            "cwd": self.cwd.to_string_lossy(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        self.append_line(&record).await
    }

    /// Append an assistant-role entry with model metadata and usage.
    pub async fn append_assistant(
        &self,
        message: &ModelMessage,
        model: &str,
        stop_reason: StopReason,
        usage: &Usage,
        request_id: &str,
    ) -> Result<()> {
        let record = json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": message.content,
                "model": model,
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "stop_reason": stop_reason.as_str(),
                "stop_sequence": Value::Null,
                "usage": usage,
            },
            "sessionId": self.session_id,
            "timestamp": Utc::now().to_rfc3339(),
            "uuid": uuid::Uuid::new_v4().to_string(),
            "cwd": self.cwd.to_string_lossy(),
            "version": env!("CARGO_PKG_VERSION"),
            "requestId": request_id,
        });
        self.append_line(&record).await
    }

    async fn append_line(&self, record: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating transcript dir {:?}", parent))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening transcript {:?}", self.path))?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Why and where a loaded history was cut short.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncationInfo {
    pub truncated: bool,
    pub reason: String,
}

/// A transcript reconstructed from disk.
#[derive(Debug)]
pub struct LoadedTranscript {
    pub messages: Vec<ModelMessage>,
    /// Number of raw lines in the file, malformed included.
    pub raw_line_count: usize,
    pub truncation: Option<TruncationInfo>,
}

impl LoadedTranscript {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Load a transcript file: malformed lines are ignored, only user and
/// assistant entries are kept, and the history is truncated at the first
/// assistant message whose tool uses lack matching results.
pub async fn load_transcript(path: &Path) -> Result<LoadedTranscript> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading transcript {:?}", path))?;

    let mut messages = Vec::new();
    let mut raw_line_count = 0usize;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        raw_line_count += 1;

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                warn!("ignoring malformed transcript line");
                continue;
            }
        };

        let entry_type = value.get("type").and_then(|t| t.as_str());
        let role = match entry_type {
            Some("user") => Role::User,
            Some("assistant") => Role::Assistant,
            _ => {
                debug!(entry_type = ?entry_type, "skipping non-message transcript entry");
                continue;
            }
        };

        let Some(content) = value.pointer("/message/content") else {
            warn!("ignoring transcript entry without message content");
            continue;
        };
        let Some(blocks) = content.as_array() else {
            warn!("ignoring transcript entry with non-array content");
            continue;
        };

        // Unknown block types are skipped rather than failing the load.
        let mut parsed = Vec::with_capacity(blocks.len());
        for block in blocks {
            match serde_json::from_value::<Content>(block.clone()) {
                Ok(c) => parsed.push(c),
                Err(_) => debug!("skipping unrecognized content block"),
            }
        }

        messages.push(ModelMessage {
            role,
            content: parsed,
        });
    }

    let truncation = enforce_tool_cycles(&mut messages);

    Ok(LoadedTranscript {
        messages,
        raw_line_count,
        truncation,
    })
}

/// Every assistant `tool_use` must be answered by a matching `tool_result`
/// in the immediately following user message. Truncate at the first
/// violation.
fn enforce_tool_cycles(messages: &mut Vec<ModelMessage>) -> Option<TruncationInfo> {
    for index in 0..messages.len() {
        let message = &messages[index];
        if message.role != Role::Assistant {
            continue;
        }
        let tool_use_ids = message.tool_use_ids();
        if tool_use_ids.is_empty() {
            continue;
        }

        let satisfied = match messages.get(index + 1) {
            Some(next) if next.role == Role::User => {
                let result_ids = next.tool_result_ids();
                tool_use_ids
                    .iter()
                    .all(|id| result_ids.contains(id))
            }
            _ => false,
        };

        if !satisfied {
            let reason = format!(
                "assistant message {} has tool_use blocks without matching tool_result entries",
                index
            );
            warn!(%reason, "truncating transcript at interrupted tool cycle");
            messages.truncate(index);
            return Some(TruncationInfo {
                truncated: true,
                reason,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::ToolResultContent;
    use serde_json::json;
    use tempfile::TempDir;

    fn writer(dir: &TempDir) -> TranscriptWriter {
        TranscriptWriter::new(dir.path(), Path::new("/work/project"), "session-1")
    }

    fn tool_use_message(id: &str) -> ModelMessage {
        ModelMessage::assistant(vec![Content::ToolUse {
            id: id.to_string(),
            name: "read".to_string(),
            input: json!({"file_path": "/tmp/x"}),
        }])
    }

    fn tool_result_message(id: &str) -> ModelMessage {
        ModelMessage::user(vec![Content::ToolResult {
            tool_use_id: id.to_string(),
            content: ToolResultContent::Text("42 bytes".to_string()),
            is_error: None,
        }])
    }

    #[tokio::test]
    async fn round_trip_reproduces_history() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);

        let history = vec![
            ModelMessage::user_text("read /tmp/x then report size"),
            tool_use_message("t1"),
            tool_result_message("t1"),
            ModelMessage::assistant(vec![Content::Text {
                text: "42 bytes".to_string(),
            }]),
        ];

        writer.append_user(&history[0]).await.unwrap();
        writer
            .append_assistant(
                &history[1],
                "test-model",
                StopReason::ToolUse,
                &Usage::default(),
                "req-1",
            )
            .await
            .unwrap();
        writer.append_user(&history[2]).await.unwrap();
        writer
            .append_assistant(
                &history[3],
                "test-model",
                StopReason::EndTurn,
                &Usage::default(),
                "req-2",
            )
            .await
            .unwrap();

        let loaded = load_transcript(writer.path()).await.unwrap();
        assert_eq!(loaded.raw_line_count, 4);
        assert!(loaded.truncation.is_none());
        assert_eq!(loaded.messages, history);
    }

    #[tokio::test]
    async fn loading_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer
            .append_user(&ModelMessage::user_text("hello"))
            .await
            .unwrap();

        let first = load_transcript(writer.path()).await.unwrap();
        let second = load_transcript(writer.path()).await.unwrap();
        assert_eq!(first.messages, second.messages);
    }

    #[tokio::test]
    async fn interrupted_tool_cycle_truncates_trailing_assistant() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);

        writer
            .append_user(&ModelMessage::user_text("do something"))
            .await
            .unwrap();
        writer
            .append_assistant(
                &tool_use_message("t9"),
                "test-model",
                StopReason::ToolUse,
                &Usage::default(),
                "req-1",
            )
            .await
            .unwrap();

        let loaded = load_transcript(writer.path()).await.unwrap();
        assert_eq!(loaded.raw_line_count, 2);
        assert_eq!(loaded.message_count(), loaded.raw_line_count - 1);
        let truncation = loaded.truncation.unwrap();
        assert!(truncation.truncated);
        assert!(matches!(loaded.messages.last().unwrap().role, Role::User));
    }

    #[tokio::test]
    async fn partial_tool_results_also_truncate() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);

        let assistant = ModelMessage::assistant(vec![
            Content::ToolUse {
                id: "a".to_string(),
                name: "read".to_string(),
                input: json!({}),
            },
            Content::ToolUse {
                id: "b".to_string(),
                name: "read".to_string(),
                input: json!({}),
            },
        ]);

        writer
            .append_user(&ModelMessage::user_text("go"))
            .await
            .unwrap();
        writer
            .append_assistant(
                &assistant,
                "test-model",
                StopReason::ToolUse,
                &Usage::default(),
                "req-1",
            )
            .await
            .unwrap();
        // Only one of the two results made it to disk.
        writer.append_user(&tool_result_message("a")).await.unwrap();

        let loaded = load_transcript(writer.path()).await.unwrap();
        assert_eq!(loaded.message_count(), 1);
        assert!(loaded.truncation.unwrap().truncated);
    }

    #[tokio::test]
    async fn malformed_lines_are_ignored() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer
            .append_user(&ModelMessage::user_text("hello"))
            .await
            .unwrap();

        // Corrupt the file with garbage and an unknown entry type.
        let mut raw = tokio::fs::read_to_string(writer.path()).await.unwrap();
        raw.push_str("not json at all\n");
        raw.push_str("{\"type\":\"summary\",\"note\":\"ignored\"}\n");
        tokio::fs::write(writer.path(), raw).await.unwrap();

        let loaded = load_transcript(writer.path()).await.unwrap();
        assert_eq!(loaded.message_count(), 1);
        assert_eq!(loaded.raw_line_count, 3);
        assert!(loaded.truncation.is_none());
    }

    #[tokio::test]
    async fn transcript_file_length_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);

        let mut last_len = 0u64;
        for turn in 0..4 {
            writer
                .append_user(&ModelMessage::user_text(format!("turn {}", turn)))
                .await
                .unwrap();
            let len = tokio::fs::metadata(writer.path()).await.unwrap().len();
            assert!(len > last_len);
            last_len = len;
        }
    }

    #[tokio::test]
    async fn records_carry_required_fields() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir);
        writer
            .append_assistant(
                &ModelMessage::assistant(vec![Content::Text {
                    text: "hi".to_string(),
                }]),
                "test-model",
                StopReason::EndTurn,
                &Usage {
                    input_tokens: 10,
                    output_tokens: 2,
                    ..Default::default()
                },
                "req-42",
            )
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(writer.path()).await.unwrap();
        let record: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(record["type"], "assistant");
        assert_eq!(record["sessionId"], "session-1");
        assert_eq!(record["requestId"], "req-42");
        assert_eq!(record["cwd"], "/work/project");
        assert_eq!(record["message"]["model"], "test-model");
        assert_eq!(record["message"]["stop_reason"], "end_turn");
        assert_eq!(record["message"]["usage"]["input_tokens"], 10);
        assert!(record["uuid"].as_str().is_some());
        assert!(record["timestamp"].as_str().is_some());
    }
}

//! Local web-search stub.
//!
//! The real search tool is server-executed; this local registration only
//! exists so a model that calls `web_search` against a session without the
//! server-side tool gets an explanation instead of `not_found`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::registry::{Tool, ToolContext, ToolResult};

pub struct WebSearchStub;

#[async_trait]
impl Tool for WebSearchStub {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Executed server-side when enabled for the session."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _input: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::error(
            "Web search runs server-side and is not enabled for this \
             session. Enable the server-side web_search tool to use it.",
        ))
    }
}

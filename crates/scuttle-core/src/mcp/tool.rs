//! MCP tool projection
//!
//! Exposes each connected server's tools through the tool registry under
//! `mcp__<server>__<tool>`. Connection failures and tool errors degrade to
//! `is_error` results so the agent loop keeps going.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::registry::{Tool, ToolContext, ToolRegistry, ToolResult};

use super::manager::McpManager;
use super::protocol::{render_tool_content, McpToolDef};

/// Registry adapter for one projected MCP tool.
pub struct McpToolAdapter {
    manager: McpManager,
    server: String,
    tool: McpToolDef,
    projected_name: String,
    description: String,
}

impl McpToolAdapter {
    pub fn new(manager: McpManager, server: &str, tool: McpToolDef) -> Self {
        let projected_name = projected_tool_name(server, &tool.name);
        let description = tool
            .description
            .clone()
            .unwrap_or_else(|| format!("Tool '{}' from MCP server '{}'", tool.name, server));
        Self {
            manager,
            server: server.to_string(),
            tool,
            projected_name,
            description,
        }
    }
}

/// `mcp__<server>__<tool>`
pub fn projected_tool_name(server: &str, tool: &str) -> String {
    format!("mcp__{}__{}", server, tool)
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.projected_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.tool.input_schema.clone()
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        match self.manager.call_tool(&self.server, &self.tool.name, input).await {
            Ok(result) => {
                let content = render_tool_content(&result.content);
                Ok(ToolResult {
                    content: content.into(),
                    is_error: result.is_error,
                })
            }
            // Degrade to an error result; the loop continues.
            Err(failure) => Ok(ToolResult::error(format!(
                "MCP tool '{}' on server '{}' failed: {}",
                self.tool.name, self.server, failure
            ))),
        }
    }
}

/// Project every connected server's tools into the registry, replacing any
/// previous projection.
pub async fn project_mcp_tools(registry: &ToolRegistry, manager: &McpManager) {
    registry.unregister_by_prefix("mcp__").await;
    for (server, tool) in manager.connected_tools().await {
        let adapter = McpToolAdapter::new(manager.clone(), &server, tool);
        registry.register(Arc::new(adapter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projected_names_are_namespaced() {
        assert_eq!(projected_tool_name("fs", "read_file"), "mcp__fs__read_file");
    }

    #[tokio::test]
    async fn unavailable_server_degrades_to_error_result() {
        let manager = McpManager::new(std::path::PathBuf::from("/tmp"));
        // No server registered at all: call must degrade, not fail.
        let adapter = McpToolAdapter::new(
            manager,
            "ghost",
            McpToolDef {
                name: "read".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
        );

        let result = adapter
            .execute(json!({}), &ToolContext::default())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.render_text().contains("ghost"));
    }
}

//! Shell tool: foreground and background command execution.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{
    parse_input, Tool, ToolContext, ToolResult, SHELL_TOOL_TIMEOUT,
};

const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 120_000;
const MAX_COMMAND_TIMEOUT_MS: u64 = 600_000;

pub struct ShellTool;

#[derive(Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    run_in_background: Option<bool>,
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the session working directory. Output is \
         captured and truncated; set run_in_background:true for servers and \
         watchers, then poll with task_output."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout": {
                    "type": "number",
                    "description": "Optional timeout in milliseconds (max 600000)"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Return immediately with a bg_N id"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn timeout(&self) -> Duration {
        SHELL_TOOL_TIMEOUT
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let params = match parse_input::<Params>(input) {
            Ok(p) => p,
            Err(e) => return Ok(e),
        };

        let Some(runtime) = &ctx.subprocesses else {
            return Ok(ToolResult::error("subprocess runtime not available"));
        };

        if params.run_in_background.unwrap_or(false) {
            let id = runtime
                .spawn_background(&params.command, &ctx.working_dir, &ctx.env)
                .await?;
            return Ok(ToolResult::text(format!(
                "Started background process with id {}",
                id
            )));
        }

        let timeout_ms = params
            .timeout
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS)
            .min(MAX_COMMAND_TIMEOUT_MS);

        let outcome = runtime
            .run_foreground(
                &params.command,
                &ctx.working_dir,
                &ctx.env,
                Duration::from_millis(timeout_ms),
                &ctx.cancel,
            )
            .await?;

        if outcome.timed_out {
            let mut message = format!("Command timed out after {} ms", timeout_ms);
            if !outcome.output.is_empty() {
                message.push('\n');
                message.push_str(&outcome.output);
            }
            return Ok(ToolResult::error(message));
        }

        let result = ToolResult {
            content: outcome.output.clone().into(),
            is_error: outcome.exit_code != Some(0),
        };
        Ok(result)
    }
}

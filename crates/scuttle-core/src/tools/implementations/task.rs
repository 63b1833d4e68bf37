//! Task tools: worker spawning and background-shell bookkeeping.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::worker::{WorkerArchetype, WorkerSpec, WorkerState};
use crate::tools::registry::{parse_input, Tool, ToolContext, ToolResult};

/// Spawn a nested agent for a delegated sub-task.
pub struct TaskTool;

#[derive(Deserialize)]
struct TaskParams {
    prompt: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    archetype: Option<WorkerArchetype>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tools: Option<Vec<String>>,
    #[serde(default)]
    max_turns: Option<usize>,
    #[serde(default)]
    background: Option<bool>,
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Delegate a sub-task to a nested agent. Foreground tasks block and \
         return the agent's report; background tasks return a worker id."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task for the nested agent"
                },
                "name": {
                    "type": "string",
                    "description": "Short display name for the worker"
                },
                "archetype": {
                    "type": "string",
                    "enum": ["general", "explorer", "reviewer"],
                    "description": "System-prompt archetype"
                },
                "model": {
                    "type": "string",
                    "description": "Model override for the worker"
                },
                "tools": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Restrict the worker to these tools"
                },
                "max_turns": {
                    "type": "number",
                    "description": "Turn budget for the worker"
                },
                "background": {
                    "type": "boolean",
                    "description": "Run detached and return the worker id"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let params = match parse_input::<TaskParams>(input) {
            Ok(p) => p,
            Err(e) => return Ok(e),
        };

        let Some(workers) = &ctx.workers else {
            return Ok(ToolResult::error("worker manager not available"));
        };

        let mut spec = WorkerSpec::new(
            params.name.unwrap_or_else(|| "task".to_string()),
            params.prompt,
        );
        if let Some(archetype) = params.archetype {
            spec = spec.with_archetype(archetype);
        }
        if let Some(model) = params.model {
            spec = spec.with_model(model);
        }
        if let Some(tools) = params.tools {
            spec = spec.with_tools(tools);
        }
        if let Some(max_turns) = params.max_turns {
            spec = spec.with_max_turns(max_turns);
        }

        if params.background.unwrap_or(false) {
            let id = workers.spawn_background(spec).await;
            return Ok(ToolResult::text(format!(
                "Started background worker with id {}",
                id
            )));
        }

        let outcome = workers.run_foreground(spec).await;
        match outcome.state {
            WorkerState::Completed => Ok(ToolResult::text(outcome.output)),
            WorkerState::Cancelled => Ok(ToolResult::error("worker was cancelled")),
            _ => Ok(ToolResult::error(format!(
                "worker failed: {}",
                outcome.error.unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }
}

/// Poll a background shell for its accumulated output.
pub struct TaskOutputTool;

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[async_trait]
impl Tool for TaskOutputTool {
    fn name(&self) -> &str {
        "task_output"
    }

    fn description(&self) -> &str {
        "Retrieve the output of a background shell started with \
         run_in_background. Finished processes are removed after the first \
         retrieval."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "The bg_N id returned by the shell tool"
                }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let params = match parse_input::<IdParams>(input) {
            Ok(p) => p,
            Err(e) => return Ok(e),
        };

        // Worker ids deliberately do not route through here; they have
        // their own harvest path on the worker manager.
        if let Some(workers) = &ctx.workers {
            if workers.contains(&params.id).await {
                return Ok(ToolResult::error(format!(
                    "'{}' is a worker, not a background shell; workers are \
                     harvested by the worker manager",
                    params.id
                )));
            }
        }

        let Some(runtime) = &ctx.subprocesses else {
            return Ok(ToolResult::error("subprocess runtime not available"));
        };

        match runtime.get_output(&params.id).await {
            Ok(snapshot) => {
                let status = match &snapshot.status {
                    crate::process::BackgroundStatus::Running => "running".to_string(),
                    crate::process::BackgroundStatus::Exited { exit_code } => {
                        format!("exited ({:?})", exit_code)
                    }
                    crate::process::BackgroundStatus::Killed => "killed".to_string(),
                };
                Ok(ToolResult::text(format!(
                    "[{}] {}\n{}",
                    snapshot.id, status, snapshot.output
                )))
            }
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

/// Kill a background shell.
pub struct KillShellTool;

#[async_trait]
impl Tool for KillShellTool {
    fn name(&self) -> &str {
        "kill_shell"
    }

    fn description(&self) -> &str {
        "Stop a background shell by its bg_N id."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "The bg_N id to kill"
                }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let params = match parse_input::<IdParams>(input) {
            Ok(p) => p,
            Err(e) => return Ok(e),
        };

        let Some(runtime) = &ctx.subprocesses else {
            return Ok(ToolResult::error("subprocess runtime not available"));
        };

        match runtime.kill(&params.id).await {
            Ok(()) => Ok(ToolResult::text(format!("Killed {}", params.id))),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SubprocessRuntime;
    use std::sync::Arc;

    fn ctx() -> ToolContext {
        ToolContext::new(std::path::PathBuf::from("/tmp"), "test-session")
            .with_subprocesses(Arc::new(SubprocessRuntime::new()))
    }

    #[tokio::test]
    async fn unknown_background_id_is_an_error_result() {
        let result = TaskOutputTool
            .execute(json!({"id": "bg_999"}), &ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.render_text().contains("bg_999"));
    }

    async fn start_background(ctx: &ToolContext, command: &str) -> String {
        ctx.subprocesses
            .as_ref()
            .unwrap()
            .spawn_background(command, &ctx.working_dir, &ctx.env)
            .await
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_shell_output_round_trips_through_tools() {
        let ctx = ctx();
        let started = start_background(&ctx, "echo from-bg").await;

        // Poll until the process finishes.
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let result = TaskOutputTool
                .execute(json!({"id": started.clone()}), &ctx)
                .await
                .unwrap();
            if result.content.render_text().contains("exited") {
                assert!(result.content.render_text().contains("from-bg"));
                return;
            }
        }
        panic!("background process never finished");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_shell_stops_a_runaway_process() {
        let ctx = ctx();
        let started = start_background(&ctx, "sleep 60").await;

        let result = KillShellTool
            .execute(json!({"id": started.clone()}), &ctx)
            .await
            .unwrap();
        assert!(!result.is_error);

        let output = TaskOutputTool
            .execute(json!({"id": started}), &ctx)
            .await
            .unwrap();
        assert!(output.content.render_text().contains("killed"));
    }

    #[tokio::test]
    async fn task_without_worker_manager_reports_unavailable() {
        let result = TaskTool
            .execute(json!({"prompt": "do things"}), &ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result
            .content
            .render_text()
            .contains("worker manager not available"));
    }
}

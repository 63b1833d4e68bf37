//! Built-in tools owned by the core: the shell family over the subprocess
//! runtime, worker delegation, and the web-search stub. File tools and the
//! rest of the built-in surface live with the embedder.

pub mod shell;
pub mod task;
pub mod web_search;

use std::sync::Arc;

use crate::tools::registry::ToolRegistry;

pub use shell::ShellTool;
pub use task::{KillShellTool, TaskOutputTool, TaskTool};
pub use web_search::WebSearchStub;

/// Register the core's built-in tools.
pub async fn register_core_tools(registry: &ToolRegistry) {
    registry.register(Arc::new(ShellTool)).await;
    registry.register(Arc::new(TaskTool)).await;
    registry.register(Arc::new(TaskOutputTool)).await;
    registry.register(Arc::new(KillShellTool)).await;
    registry.register(Arc::new(WebSearchStub)).await;
}

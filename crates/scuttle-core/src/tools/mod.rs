//! Tool registry and built-in implementations.

pub mod implementations;
pub mod registry;

pub use implementations::register_core_tools;
pub use registry::{
    parse_input, Tool, ToolContext, ToolError, ToolRegistry, ToolResult, DEFAULT_TOOL_TIMEOUT,
    SHELL_TOOL_TIMEOUT,
};

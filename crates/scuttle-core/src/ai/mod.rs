//! Transport, streaming, and wire types for the model endpoint.

pub mod auth;
pub mod client;
pub mod error;
pub mod sse;
pub mod types;

pub use auth::{CredentialSource, StaticCredentials};
pub use client::{
    build_request_body, ApiClient, ApiConfig, MessageRequest, ModelTransport,
    REQUIRED_SYSTEM_PREFIX,
};
pub use error::ApiError;
pub use sse::{BlockDelta, BlockStart, SseFramer, StreamEvent};
pub use types::{
    Content, ImageSource, ModelMessage, Role, StopReason, ThinkingConfig, ToolCallRequest,
    ToolDefinition, ToolResultContent, ToolResultPart, Usage,
};

//! Streaming transport client for the Messages API
//!
//! Builds the request body (system prefix, cache-control markers, tools,
//! thinking config), sends it with the protocol headers, retries once on a
//! 401 after refreshing credentials, and pumps the SSE response into a
//! channel of typed stream events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::CredentialSource;
use super::error::ApiError;
use super::sse::{SseFramer, StreamEvent};
use super::types::{ModelMessage, ThinkingConfig, ToolDefinition};

/// Protocol-required system prefix; always the first system block.
pub const REQUIRED_SYSTEM_PREFIX: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_MAX_TOKENS: usize = 8_192;

/// Default wall-clock timeout for one streaming request.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(300);

/// One streaming request to the model.
#[derive(Debug, Clone, Default)]
pub struct MessageRequest {
    pub messages: Vec<ModelMessage>,
    /// Caller system blocks, appended after the required prefix.
    pub system: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    /// Opaque server-side tool specs appended after the local definitions.
    pub server_tools: Vec<Value>,
    pub thinking: Option<ThinkingConfig>,
    pub model: Option<String>,
    pub max_tokens: Option<usize>,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: usize,
    pub beta_features: Vec<String>,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            beta_features: vec!["interleaved-thinking-2025-05-14".to_string()],
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
        }
    }
}

/// The seam the agent loop drives. Implemented by `ApiClient` and by test
/// doubles that script turns.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Model id requests go out with unless overridden per request.
    fn model(&self) -> String;

    /// Open a streaming turn. The receiver yields typed stream events until
    /// the turn ends; transport failures after this returns surface as
    /// `StreamEvent::Error` items.
    async fn stream_message(
        &self,
        request: MessageRequest,
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ApiError>;
}

/// HTTP client for the Messages endpoint.
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
    credentials: Arc<dyn CredentialSource>,
}

impl ApiClient {
    pub fn new(config: ApiConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            credentials,
        }
    }

    async fn send_once(&self, body: &Value, token: &str) -> Result<reqwest::Response, ApiError> {
        let request = self
            .http
            .post(&self.config.base_url)
            .header("authorization", format!("Bearer {}", token))
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", self.config.beta_features.join(","))
            .header("accept", "text/event-stream")
            .json(body);

        match tokio::time::timeout(self.config.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ApiError::Transport(e.to_string())),
            Err(_) => Err(ApiError::Timeout(self.config.timeout)),
        }
    }
}

#[async_trait]
impl ModelTransport for ApiClient {
    fn model(&self) -> String {
        self.config.model.clone()
    }

    async fn stream_message(
        &self,
        request: MessageRequest,
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ApiError> {
        let body = build_request_body(&self.config, &request);

        let token = self
            .credentials
            .bearer_token()
            .await
            .map_err(|e| ApiError::Authentication(e.to_string()))?;

        let mut response = self.send_once(&body, &token).await?;

        // One silent credential refresh on 401, same request body.
        if response.status().as_u16() == 401 {
            info!("credential rejected; refreshing once and retrying");
            let refreshed = self
                .credentials
                .refresh()
                .await
                .map_err(|e| ApiError::Authentication(e.to_string()))?;
            response = self.send_once(&body, &refreshed).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), text, retry_after));
        }

        debug!("stream opened");
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = cancel.clone();
        let deadline = tokio::time::Instant::now() + self.config.timeout;

        tokio::spawn(async move {
            let mut framer = SseFramer::new();
            let stream = response.bytes_stream();
            tokio::pin!(stream);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("stream aborted by cancellation");
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        let _ = tx.send(StreamEvent::Error {
                            message: "transport timeout while streaming".to_string(),
                        });
                        return;
                    }
                    chunk = stream.next() => {
                        match chunk {
                            Some(Ok(bytes)) => {
                                for event in framer.feed(&bytes) {
                                    if tx.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(%e, "stream read error");
                                let _ = tx.send(StreamEvent::Error {
                                    message: format!("stream read error: {}", e),
                                });
                                return;
                            }
                            None => {
                                if let Some(event) = framer.finish() {
                                    let _ = tx.send(event);
                                }
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Build the JSON body for one streaming request.
///
/// Cache-control markers go on the required system prefix, the last caller
/// system block, and the last content block of the second-to-last user
/// message. Thinking blocks never receive markers.
pub fn build_request_body(config: &ApiConfig, request: &MessageRequest) -> Value {
    let cache_marker = json!({"type": "ephemeral"});

    // System array: required prefix first, caller blocks after.
    let mut system = vec![json!({
        "type": "text",
        "text": REQUIRED_SYSTEM_PREFIX,
        "cache_control": cache_marker,
    })];
    for (idx, block) in request.system.iter().enumerate() {
        let mut entry = json!({"type": "text", "text": block});
        if idx + 1 == request.system.len() {
            entry["cache_control"] = cache_marker.clone();
        }
        system.push(entry);
    }

    let mut messages =
        serde_json::to_value(&request.messages).expect("messages are serializable");
    apply_history_cache_marker(&mut messages);

    let mut body = json!({
        "model": request.model.clone().unwrap_or_else(|| config.model.clone()),
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(config.max_tokens),
        "system": system,
        "stream": true,
    });

    let mut tools: Vec<Value> = request
        .tools
        .iter()
        .map(|t| serde_json::to_value(t).expect("tool definition is serializable"))
        .collect();
    tools.extend(request.server_tools.iter().cloned());
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }

    if let Some(thinking) = &request.thinking {
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": thinking.budget_tokens,
        });
    }

    body
}

/// Conversation-history cache breakpoint: the last content block of the
/// second-to-last user message, unless that block is a thinking block.
fn apply_history_cache_marker(messages: &mut Value) {
    let Some(list) = messages.as_array_mut() else {
        return;
    };

    let user_indexes: Vec<usize> = list
        .iter()
        .enumerate()
        .filter(|(_, m)| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        .map(|(i, _)| i)
        .collect();

    if user_indexes.len() < 2 {
        return;
    }
    let target = user_indexes[user_indexes.len() - 2];

    if let Some(blocks) = list[target].get_mut("content").and_then(|c| c.as_array_mut()) {
        if let Some(last) = blocks.last_mut() {
            if last.get("type").and_then(|t| t.as_str()) != Some("thinking") {
                last["cache_control"] = json!({"type": "ephemeral"});
            }
        }
    }
}

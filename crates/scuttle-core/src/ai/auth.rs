//! Credential boundary
//!
//! The credential file reader/refresher lives outside this crate; the
//! transport only needs a bearer token and a way to ask for a fresh one
//! after a 401.

use async_trait::async_trait;

/// Source of bearer credentials for the transport client.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current bearer token.
    async fn bearer_token(&self) -> anyhow::Result<String>;

    /// Refresh and return a new token. Called at most once per request,
    /// on HTTP 401.
    async fn refresh(&self) -> anyhow::Result<String>;
}

/// Fixed-token credentials (API keys, tests). `refresh` returns the same
/// token, so a second 401 surfaces to the caller.
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn bearer_token(&self) -> anyhow::Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> anyhow::Result<String> {
        Ok(self.token.clone())
    }
}

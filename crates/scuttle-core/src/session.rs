//! Session identity and accounting

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::ai::types::{ModelMessage, Usage};
use crate::paths;
use crate::transcript::{load_transcript, TruncationInfo};

/// One conversation: identity, working directory, message history, and
/// accumulated token usage. The agent loop owns the live history.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub messages: Vec<ModelMessage>,
    pub cumulative_usage: Usage,
}

impl Session {
    /// Fresh session with a generated id.
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            working_dir,
            messages: Vec::new(),
            cumulative_usage: Usage::default(),
        }
    }

    /// Resume a session from its transcript under `root`. Returns the
    /// session together with truncation info when an interrupted tool cycle
    /// was repaired.
    pub async fn resume(
        root: &Path,
        working_dir: PathBuf,
        session_id: &str,
    ) -> Result<(Self, Option<TruncationInfo>)> {
        let path = paths::transcript_file(root, &working_dir, session_id);
        let loaded = load_transcript(&path).await?;
        Ok((
            Self {
                session_id: session_id.to_string(),
                working_dir,
                messages: loaded.messages,
                cumulative_usage: Usage::default(),
            },
            loaded.truncation,
        ))
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.cumulative_usage.add(usage);
    }
}

//! Centralized path utilities

use std::path::{Path, PathBuf};

/// Root directory for transcripts (`~/.claude/projects`).
pub fn transcript_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

/// Per-project transcript directory: the working directory with path
/// separators replaced by dashes.
pub fn project_dir(root: &Path, working_dir: &Path) -> PathBuf {
    root.join(dashed_working_dir(working_dir))
}

pub fn dashed_working_dir(working_dir: &Path) -> String {
    working_dir
        .to_string_lossy()
        .replace(['/', '\\'], "-")
}

/// Transcript file for one session.
pub fn transcript_file(root: &Path, working_dir: &Path, session_id: &str) -> PathBuf {
    project_dir(root, working_dir).join(format!("{}.jsonl", session_id))
}

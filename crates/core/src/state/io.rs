//! # IO Utilities
//!
//! File system helpers for the `.crucible` runtime directory and the
//! human-readable experiment logs kept next to the code.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Directory (relative to a project or worktree root) holding experiment logs
pub const EXPERIMENT_LOG_DIR: &str = "docs/experiments";

const EXPERIMENT_LOG_TEMPLATE: &str = include_str!("templates/experiment.md");

/// Get the runtime directory path (.crucible)
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var("CRUCIBLE_RUNTIME_PATH") {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".crucible")
}

/// Ensure the runtime directory exists
pub async fn ensure_runtime_dir() -> Result<PathBuf> {
    let path = get_runtime_path();
    fs::create_dir_all(&path)
        .await
        .with_context(|| format!("Failed to create runtime directory: {:?}", path))?;
    Ok(path)
}

/// Render the experiment log template
pub fn render_experiment_log(ordinal: &str, slug: &str, hypothesis: &str, branch: &str) -> String {
    EXPERIMENT_LOG_TEMPLATE
        .replace("{{ordinal}}", ordinal)
        .replace("{{slug}}", slug)
        .replace("{{hypothesis}}", hypothesis)
        .replace("{{branch}}", branch)
        .replace("{{date}}", &Utc::now().format("%Y-%m-%d").to_string())
}

/// Seed `docs/experiments/<ordinal>-<slug>.md` under `root`.
///
/// An existing log is left untouched.
pub async fn seed_experiment_log(
    root: &Path,
    ordinal: &str,
    slug: &str,
    hypothesis: &str,
    branch: &str,
) -> Result<PathBuf> {
    let dir = root.join(EXPERIMENT_LOG_DIR);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create log directory: {:?}", dir))?;

    let path = dir.join(format!("{}-{}.md", ordinal, slug));
    if fs::metadata(&path).await.is_ok() {
        return Ok(path);
    }

    let content = render_experiment_log(ordinal, slug, hypothesis, branch);
    fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write experiment log: {:?}", path))?;
    Ok(path)
}

//! Centralized path resolution for ptygate
//!
//! Single source of truth for all ptygate directory and file paths.
//! Respects PTYGATE_DIR / PTYGATE_AGENT_DIR env vars via Config.

use std::path::PathBuf;

use crate::config::Config;

/// Get the ptygate base directory.
pub fn ptygate_dir() -> PathBuf {
    Config::get().ptygate_dir
}

/// Get the log file path (ptygate_dir/logs/ptygate.log)
pub fn log_path() -> PathBuf {
    ptygate_dir().join("logs").join("ptygate.log")
}

/// Get the per-project session index root (agent_dir/projects).
///
/// Each project gets a subdirectory named by encoding its absolute path
/// (see store::encode_project_path); the index document lives inside it.
pub fn projects_dir() -> PathBuf {
    Config::get().agent_dir.join("projects")
}

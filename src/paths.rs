//! Centralized path resolution for ccc
//!
//! Single source of truth for the cache directory and every file-based
//! coordination artifact. Respects CCC_CACHE_DIR for tests/dev, falls back
//! to the user cache directory.

use std::path::PathBuf;

/// Get the ccc cache directory (CCC_CACHE_DIR or ~/.cache/ccc).
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CCC_CACHE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ccc")
}

/// Get the database path (cache_dir/ccc.db)
pub fn db_path() -> PathBuf {
    cache_dir().join("ccc.db")
}

/// Get the single-instance lock file path (cache_dir/ccc.lock).
/// The listener writes its pid into this file; hooks read it to send SIGUSR1.
pub fn lock_path() -> PathBuf {
    cache_dir().join("ccc.lock")
}

/// Get the hook debug log path (cache_dir/hook-debug.log)
pub fn hook_log_path() -> PathBuf {
    cache_dir().join("hook-debug.log")
}

/// Get the per-session tool-state lock path
pub fn tool_state_lock_path(session: &str) -> PathBuf {
    cache_dir().join(format!("tool-state-{}.lock", session))
}

/// Get the config file path (CCC_CONFIG_PATH or ~/.config/ccc/config.json)
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("CCC_CONFIG_PATH") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ccc")
        .join("config.json")
}

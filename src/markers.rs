//! Cross-process marker files under the cache directory.
//!
//! These are the process-wide coordination primitives shared by the
//! listener and the transient hook processes:
//! - `telegram-active-<window>`: last chat-originated input for a window
//!   (mtime = when it arrived). Consulted by the pre-tool hook to decide
//!   whether the OTP gate applies.
//! - `thinking-<session>`: the assistant is mid-turn; drives the typing
//!   indicator.
//! - `prompt-ack-<session>`: the user-prompt hook confirms a chat prompt
//!   reached the assistant.
//!
//! The reader removes a marker on consumption; removals are best-effort.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// How long a chat-input marker keeps the OTP gate armed.
pub const TELEGRAM_ACTIVE_TTL: Duration = Duration::from_secs(5 * 60);
/// Thinking flags older than this are considered leaked (missed stop hook).
pub const THINKING_TTL: Duration = Duration::from_secs(10 * 60);

pub fn telegram_active_path(window: &str) -> PathBuf {
    crate::paths::cache_dir().join(format!("telegram-active-{}", window))
}

pub fn thinking_path(session: &str) -> PathBuf {
    crate::paths::cache_dir().join(format!("thinking-{}", session))
}

pub fn prompt_ack_path(session: &str) -> PathBuf {
    crate::paths::cache_dir().join(format!("prompt-ack-{}", session))
}

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = fs::write(path, b"1");
}

/// Mark a window as driven from chat (refreshes mtime when already set).
pub fn set_telegram_active(window: &str) {
    touch(&telegram_active_path(window));
}

pub fn clear_telegram_active(window: &str) {
    let _ = fs::remove_file(telegram_active_path(window));
}

/// True if the chat-input marker exists and is younger than its TTL.
pub fn telegram_active_fresh(window: &str) -> bool {
    fresh(&telegram_active_path(window), TELEGRAM_ACTIVE_TTL)
}

pub fn set_thinking(session: &str) {
    touch(&thinking_path(session));
}

pub fn clear_thinking(session: &str) {
    let _ = fs::remove_file(thinking_path(session));
}

/// Thinking flag state: Some(true) fresh, Some(false) stale, None absent.
pub fn thinking_state(session: &str) -> Option<bool> {
    let meta = fs::metadata(thinking_path(session)).ok()?;
    let age = meta.modified().ok().and_then(|m| SystemTime::now().duration_since(m).ok())?;
    Some(age <= THINKING_TTL)
}

pub fn write_prompt_ack(session: &str) {
    touch(&prompt_ack_path(session));
}

pub fn clear_prompt_ack(session: &str) {
    let _ = fs::remove_file(prompt_ack_path(session));
}

/// Poll for the prompt ack, consuming it when found.
pub fn wait_prompt_ack(session: &str, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    let path = prompt_ack_path(session);
    while std::time::Instant::now() < deadline {
        if path.exists() {
            let _ = fs::remove_file(&path);
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

/// True if `path` exists and its mtime is within `ttl`.
pub fn fresh(path: &Path, ttl: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    match meta.modified().ok().and_then(|m| SystemTime::now().duration_since(m).ok()) {
        Some(age) => age <= ttl,
        None => false,
    }
}

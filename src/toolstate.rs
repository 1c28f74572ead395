//! Live tool-call aggregation.
//!
//! Each session gets at most one "this turn" chat message that accumulates
//! tool invocations and interleaved assistant text, edited in place. The
//! critical section (load state → append → send/edit → save) is guarded by
//! a per-session file lock shared across the listener and hook processes;
//! without it, two parallel tool hooks both observe msg_id=0 and each
//! create their own live message.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

use crate::db::ToolState;
use crate::format::{html_escape, truncate};
use crate::hooks::HookData;

/// Exclusive advisory lock on tool-state-<session>.lock.
/// Held across the store round trip and the chat send — the "one live
/// message per turn" contract is worth the brief stall.
pub struct ToolStateLock {
    file: Option<File>,
}

impl ToolStateLock {
    /// Acquire the lock, blocking until available. A lock file that cannot
    /// be opened degrades to an unlocked guard rather than failing the hook.
    pub fn acquire(session: &str) -> ToolStateLock {
        let path = crate::paths::tool_state_lock_path(session);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = match OpenOptions::new().create(true).read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(_) => return ToolStateLock { file: None },
        };
        let rc = unsafe { nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_EX) };
        if rc != 0 {
            return ToolStateLock { file: None };
        }
        ToolStateLock { file: Some(file) }
    }
}

impl Drop for ToolStateLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            unsafe { nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_UN) };
        }
    }
}

/// Build the tool lines without the blockquote wrapper.
pub fn format_tool_lines(state: &ToolState) -> String {
    let mut lines = Vec::with_capacity(state.tools.len());
    for entry in &state.tools {
        let line = if entry.is_text {
            format!("💬 {}", html_escape(&entry.input))
        } else if entry.name.is_empty() {
            format!("⚙️ {}", html_escape(&entry.input))
        } else if !entry.input.is_empty() {
            format!("⚙️ {}: {}", html_escape(&entry.name), html_escape(&entry.input))
        } else {
            format!("⚙️ {}", html_escape(&entry.name))
        };
        lines.push(line);
    }
    lines.join("\n")
}

/// Render the full live message body (expandable blockquote).
pub fn format_tool_message(state: &ToolState) -> String {
    format!("<blockquote>{}</blockquote>", format_tool_lines(state))
}

/// Extract a short human-readable summary of a tool's input, bounded at
/// 80 characters. Paths are kept whole; free-form inputs are truncated.
pub fn tool_input_summary(hook: &HookData) -> String {
    const TRUNC_AT: usize = 80;
    let input = &hook.tool_input;
    match hook.tool_name.as_str() {
        "Bash" => truncate(&input.command, TRUNC_AT),
        "Read" | "Write" => input.file_path.clone(),
        "Edit" => {
            let mut s = input.file_path.clone();
            if !input.old_string.is_empty() {
                let preview = truncate(&input.old_string, 40).replace('\n', "↵");
                s.push_str(&format!(" `{}`", preview));
            }
            s
        }
        "Grep" | "Glob" => {
            if !input.pattern.is_empty() {
                truncate(&input.pattern, TRUNC_AT)
            } else {
                input.description.clone()
            }
        }
        "WebSearch" => truncate(&input.query, TRUNC_AT),
        "WebFetch" => truncate(&input.url, TRUNC_AT),
        "Task" => truncate(&input.description, TRUNC_AT),
        _ => {
            if !input.description.is_empty() {
                truncate(&input.description, TRUNC_AT)
            } else {
                String::new()
            }
        }
    }
}

//! File-based logging for ccc
//!
//! Two sinks, matching the two process roles:
//! - `hook_log`: appends to cache_dir/hook-debug.log. Used by short-lived
//!   hook processes that must never write to the terminal.
//! - `listen_log`: timestamped lines on stdout. Under a service manager,
//!   stdout is redirected to the service log; writing the file directly
//!   would double-write.

use chrono::Local;
use std::fs::{create_dir_all, OpenOptions};
use std::io::Write;

/// Append a debug line to hook-debug.log. Silently ignores I/O errors —
/// a failed log write must never break a hook.
pub fn hook_log(msg: &str) {
    let path = crate::paths::hook_log_path();
    if let Some(parent) = path.parent() {
        let _ = create_dir_all(parent);
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "[{}] {}", Local::now().format("%H:%M:%S"), msg);
    }
}

/// Log a listener line to stdout with timestamp and pid.
pub fn listen_log(msg: &str) {
    println!(
        "[{}] [pid:{}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        std::process::id(),
        msg
    );
}

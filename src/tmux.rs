//! tmux integration.
//!
//! Windows are addressed by their opaque `@id` whenever one is stored in
//! the registry; name lookup is the fallback for windows created before the
//! id was captured. All tmux interaction goes through the binary as a child
//! process — the bridge never owns a PTY itself.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_TMUX_SESSION: &str = "ccc";

/// Convert a session name to a tmux-safe window name
/// (dots are interpreted as window/pane separators in tmux targets).
pub fn tmux_safe_name(name: &str) -> String {
    name.replace('.', "_")
}

/// Locate the tmux binary once. PATH first, then common install locations.
pub fn tmux_path() -> Option<&'static PathBuf> {
    static TMUX: OnceLock<Option<PathBuf>> = OnceLock::new();
    TMUX.get_or_init(|| {
        if let Ok(path) = which::which("tmux") {
            return Some(path);
        }
        ["/opt/homebrew/bin/tmux", "/usr/local/bin/tmux", "/usr/bin/tmux"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    })
    .as_ref()
}

/// Locate the claude binary. PATH first, then the usual npm/local spots.
pub fn claude_path() -> Option<&'static PathBuf> {
    static CLAUDE: OnceLock<Option<PathBuf>> = OnceLock::new();
    CLAUDE
        .get_or_init(|| {
            if let Ok(path) = which::which("claude") {
                return Some(path);
            }
            let home = dirs::home_dir()?;
            [home.join(".local/bin/claude"), PathBuf::from("/usr/local/bin/claude")]
                .into_iter()
                .find(|p| p.exists())
        })
        .as_ref()
}

/// Locate our own binary for hook commands inside windows.
/// Prefer ~/bin/ccc (the canonical install path), then PATH, then argv[0].
pub fn ccc_path() -> PathBuf {
    static CCC: OnceLock<PathBuf> = OnceLock::new();
    CCC.get_or_init(|| {
        if let Some(home) = dirs::home_dir() {
            let installed = home.join("bin/ccc");
            if installed.exists() {
                return installed;
            }
        }
        if let Ok(path) = which::which("ccc") {
            return path;
        }
        std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ccc"))
    })
    .clone()
}

fn tmux() -> Result<Command> {
    let path = tmux_path().context("tmux binary not found")?;
    Ok(Command::new(path))
}

fn tmux_output(args: &[&str]) -> Result<String> {
    let out = tmux()?.args(args).output().context("tmux invocation failed")?;
    if !out.status.success() {
        bail!("tmux {:?} exited with {}", args.first().unwrap_or(&""), out.status);
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn tmux_run(args: &[&str]) -> Result<()> {
    let status = tmux()?.args(args).status().context("tmux invocation failed")?;
    if !status.success() {
        bail!("tmux {:?} exited with {}", args.first().unwrap_or(&""), status);
    }
    Ok(())
}

/// Return an existing tmux session name, creating the default one if none.
pub fn get_target_session() -> Result<String> {
    if let Ok(out) = tmux_output(&["list-sessions", "-F", "#{session_name}"]) {
        if let Some(name) = out.lines().find(|l| !l.is_empty()) {
            return Ok(name.to_string());
        }
    }
    tmux_run(&["new-session", "-d", "-s", DEFAULT_TMUX_SESSION])?;
    let _ = tmux_run(&["set-option", "-t", DEFAULT_TMUX_SESSION, "mouse", "on"]);
    Ok(DEFAULT_TMUX_SESSION.to_string())
}

/// Resolve a send target: stored window id, else name lookup.
pub fn target_by_id(window_id: &str, window_name: &str) -> String {
    if !window_id.is_empty() {
        return window_id.to_string();
    }
    target_by_name(window_name)
}

fn target_by_name(window_name: &str) -> String {
    if let Ok(out) = tmux_output(&["list-windows", "-a", "-F", "#{window_id}\t#{window_name}"]) {
        for line in out.lines() {
            if let Some((id, name)) = line.split_once('\t') {
                if name == window_name {
                    return id.to_string();
                }
            }
        }
    }
    format!("{}:{}", DEFAULT_TMUX_SESSION, window_name)
}

/// True if the window is alive. Name lookup only when the id is empty.
pub fn window_exists(window_id: &str, window_name: &str) -> bool {
    if !window_id.is_empty() {
        return tmux_output(&["list-windows", "-a", "-F", "#{window_id}"])
            .map(|out| out.lines().any(|l| l == window_id))
            .unwrap_or(false);
    }
    tmux_output(&["list-windows", "-a", "-F", "#{window_name}"])
        .map(|out| out.lines().any(|l| l == window_name))
        .unwrap_or(false)
}

/// Create a detached window running `ccc run` and return its window id.
pub fn create_window(window_name: &str, work_dir: &str, continue_session: bool) -> Result<String> {
    let mut ccc_cmd = format!("{} run", ccc_path().display());
    if continue_session {
        ccc_cmd.push_str(" -c");
    }

    let session = get_target_session()?;
    let target = format!("{}:", session);
    let out = tmux_output(&[
        "new-window", "-P", "-F", "#{window_id}", "-t", &target, "-n", window_name, "-c", work_dir,
    ])?;
    let window_id = out.trim().to_string();

    // Give the shell a moment before typing the command at it.
    std::thread::sleep(Duration::from_millis(200));
    let _ = tmux_run(&["send-keys", "-t", &window_id, &ccc_cmd, "C-m"]);

    Ok(window_id)
}

pub fn kill_window(window_id: &str, window_name: &str) -> Result<()> {
    let target = target_by_id(window_id, window_name);
    tmux_run(&["kill-window", "-t", &target])
}

pub fn kill_session(name: &str) -> Result<()> {
    tmux_run(&["kill-session", "-t", name])
}

/// Capture the visible pane content for a target.
pub fn capture_pane(target: &str, scrollback: Option<i32>) -> Result<String> {
    match scrollback {
        Some(lines) => {
            let start = lines.to_string();
            tmux_output(&["capture-pane", "-t", target, "-p", "-S", &start])
        }
        None => tmux_output(&["capture-pane", "-t", target, "-p"]),
    }
}

/// Send a single named key (e.g. "Down", "Enter", "C-m").
pub fn send_key(target: &str, key: &str) {
    let _ = tmux_run(&["send-keys", "-t", target, key]);
}

/// Pre-send settle delay: 50 ms base + 0.5 ms per character, capped at 5 s.
/// Long pastes need the TUI to keep up before Enter arrives.
pub fn paced_delay(text_len: usize) -> Duration {
    let delay = Duration::from_millis(50) + Duration::from_micros(text_len as u64 * 500);
    delay.min(Duration::from_secs(5))
}

/// Send literal text to a window followed by a double Enter
/// (the assistant's TUI needs the second one to submit).
pub fn send_text(target: &str, text: &str) -> Result<()> {
    send_text_with_delay(target, text, paced_delay(text.len()))
}

pub fn send_text_with_delay(target: &str, text: &str, delay: Duration) -> Result<()> {
    if !delay.is_zero() {
        crate::log::hook_log(&format!("tmux-send: waiting {:?} before send-keys", delay));
        std::thread::sleep(delay);
    }

    crate::log::hook_log(&format!(
        "tmux-send: target={} textLen={} text={:?}",
        target,
        text.len(),
        crate::format::truncate(text, 100)
    ));

    tmux_run(&["send-keys", "-t", target, "-l", text]).map_err(|err| {
        crate::log::hook_log(&format!("tmux-send: send-keys failed: {}", err));
        err
    })?;

    std::thread::sleep(Duration::from_millis(100));
    send_key(target, "C-m");
    std::thread::sleep(Duration::from_millis(50));
    send_key(target, "C-m");
    Ok(())
}

/// Send chat-originated text: arms the telegram-active marker first so the
/// pre-tool hook knows this input requires the OTP gate.
pub fn send_text_from_telegram(target: &str, window_name: &str, text: &str) -> Result<()> {
    crate::markers::set_telegram_active(window_name);
    send_text(target, text)
}

pub fn send_text_from_telegram_with_delay(
    target: &str,
    window_name: &str,
    text: &str,
    delay: Duration,
) -> Result<()> {
    crate::markers::set_telegram_active(window_name);
    send_text_with_delay(target, text, delay)
}

/// Poll the pane until the assistant's input prompt ("❯") appears.
pub fn wait_for_claude(target: &str, timeout: Duration) -> Result<()> {
    let interval = if timeout > Duration::from_secs(10) {
        Duration::from_millis(500)
    } else {
        Duration::from_millis(100)
    };
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if let Ok(content) = capture_pane(target, None) {
            if content.contains('❯') {
                return Ok(());
            }
        }
        std::thread::sleep(interval);
    }
    bail!("timeout waiting for Claude to start")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_table() {
        let cases = [
            ("myproject", "myproject"),
            ("my-project", "my-project"),
            ("my.project", "my_project"),
            ("", ""),
            ("my project", "my project"),
        ];
        for (input, want) in cases {
            assert_eq!(tmux_safe_name(input), want);
        }
    }

    #[test]
    fn paced_delay_scales_and_caps() {
        assert_eq!(paced_delay(0), Duration::from_millis(50));
        assert_eq!(paced_delay(100), Duration::from_millis(100));
        // 20000 chars would be 10s+; capped at 5s
        assert_eq!(paced_delay(20_000), Duration::from_secs(5));
    }
}

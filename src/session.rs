//! Session lifecycle: creating, attaching, restarting, and deleting the
//! (topic, window, directory) triples that make up a session.
//!
//! Session names are length-capped at creation so the inline-button
//! callback payload `name:qIdx:total:optIdx` always fits Telegram's
//! 64-byte limit — truncating payloads later would corrupt the encoding.

use anyhow::{bail, Context, Result};
use std::process::Command;
use std::time::Duration;

use crate::config::{Config, SessionInfo};
use crate::telegram::Api;
use crate::tmux;

/// Maximum session name length in bytes.
pub const MAX_SESSION_NAME_LEN: usize = 48;

/// Reject names that are empty, oversized, or would break tmux targets.
pub fn validate_session_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("session name must not be empty");
    }
    if name.len() > MAX_SESSION_NAME_LEN {
        bail!(
            "session name too long ({} bytes, max {})",
            name.len(),
            MAX_SESSION_NAME_LEN
        );
    }
    if name.contains(':') {
        bail!("session name must not contain ':'");
    }
    Ok(())
}

/// Delete a session: window killed, registry entry dropped. The caller
/// deletes the chat topic (it needs the thread for error reporting).
pub fn kill_session(config: &mut Config, name: &str) -> Result<()> {
    if !config.sessions.contains_key(name) {
        bail!("session '{}' not found", name);
    }
    let window_id = config
        .sessions
        .get(name)
        .map(|info| info.window_id.clone())
        .unwrap_or_default();
    let _ = tmux::kill_window(&window_id, &tmux::tmux_safe_name(name));
    config.sessions.remove(name);
    config.save()?;
    Ok(())
}

/// Recreate a session's window (used by /new, /continue, and auto-start).
/// Persists the fresh window id and returns it.
pub fn restart_window(config: &mut Config, name: &str, continue_session: bool) -> Result<String> {
    let window = tmux::tmux_safe_name(name);
    let info = config
        .sessions
        .get(name)
        .cloned()
        .with_context(|| format!("session '{}' not found", name))?;
    if tmux::window_exists(&info.window_id, &window) {
        let _ = tmux::kill_window(&info.window_id, &window);
        std::thread::sleep(Duration::from_millis(300));
    }
    let work_dir = if info.path.is_empty() {
        config.resolve_project_path(name).to_string_lossy().into_owned()
    } else {
        info.path
    };
    if !std::path::Path::new(&work_dir).exists() {
        std::fs::create_dir_all(&work_dir)?;
    }
    let window_id = tmux::create_window(&window, &work_dir, continue_session)?;
    if let Some(entry) = config.sessions.get_mut(name) {
        entry.window_id = window_id.clone();
    }
    config.save()?;
    Ok(window_id)
}

/// Bare `ccc` / `ccc -c`: start or attach the session for the cwd.
pub fn start_session(continue_session: bool) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let name = cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let window = tmux::tmux_safe_name(&name);

    let Ok(mut config) = Config::load() else {
        // Not configured yet: just run the assistant directly.
        return run_claude_raw(continue_session);
    };

    // Register a topic for this directory on first use.
    if config.group_id != 0 && !config.sessions.contains_key(&name) {
        if let Err(err) = validate_session_name(&name) {
            bail!("cannot bridge this directory: {}", err);
        }
        let api = Api::new(&config.bot_token);
        if let Ok(topic_id) = api.create_forum_topic(config.group_id, &name) {
            config.sessions.insert(
                name.clone(),
                SessionInfo {
                    topic_id,
                    path: cwd.to_string_lossy().into_owned(),
                    ..Default::default()
                },
            );
            config.save()?;
            println!("📱 Created Telegram topic: {}", name);
        }
    }

    let window_id = config
        .sessions
        .get(&name)
        .map(|info| info.window_id.clone())
        .unwrap_or_default();

    if tmux::window_exists(&window_id, &window) {
        return attach(&tmux::target_by_id(&window_id, &window));
    }

    let window_id = tmux::create_window(&window, &cwd.to_string_lossy(), continue_session)?;
    if let Some(entry) = config.sessions.get_mut(&name) {
        entry.window_id = window_id.clone();
        config.save()?;
    }
    attach(&tmux::target_by_id(&window_id, &window))
}

/// Select the window and attach (or just select when already inside tmux).
fn attach(target: &str) -> Result<()> {
    let tmux_bin = tmux::tmux_path().context("tmux binary not found")?;
    let session_name = target.split(':').next().unwrap_or(target).to_string();
    if std::env::var("TMUX").is_ok() {
        let status = Command::new(tmux_bin)
            .args(["select-window", "-t", target])
            .status()?;
        if !status.success() {
            bail!("tmux select-window failed");
        }
        return Ok(());
    }
    let _ = Command::new(tmux_bin).args(["select-window", "-t", target]).status();
    let status = Command::new(tmux_bin)
        .args(["attach-session", "-t", session_name.as_str()])
        .status()?;
    if !status.success() {
        bail!("tmux attach-session failed");
    }
    Ok(())
}

/// `ccc start <name> <dir> <prompt>`: detached session with initial prompt.
pub fn start_detached(name: &str, work_dir: &str, prompt: &str) -> Result<()> {
    validate_session_name(name)?;
    let mut config = Config::load().context("failed to load config")?;
    let api = Api::new(&config.bot_token);

    let topic_id = api
        .create_forum_topic(config.group_id, name)
        .context("failed to create topic")?;

    let window = tmux::tmux_safe_name(name);
    let old_window_id = config
        .sessions
        .get(name)
        .map(|info| info.window_id.clone())
        .unwrap_or_default();
    if tmux::window_exists(&old_window_id, &window) {
        let _ = tmux::kill_window(&old_window_id, &window);
        std::thread::sleep(Duration::from_millis(300));
    }

    let window_id =
        tmux::create_window(&window, work_dir, false).context("failed to create tmux window")?;

    config.sessions.insert(
        name.to_string(),
        SessionInfo {
            topic_id,
            path: work_dir.to_string(),
            window_id: window_id.clone(),
            claude_session_id: String::new(),
        },
    );
    config.save().context("failed to save config")?;

    let target = tmux::target_by_id(&window_id, &window);
    tmux::wait_for_claude(&target, Duration::from_secs(30))
        .context("claude did not start in time")?;
    tmux::send_text(&target, prompt).context("failed to send prompt")?;

    println!("Session '{}' started in window '{}' with topic {}", name, window, topic_id);
    Ok(())
}

/// `ccc run`: exec the assistant inside a tmux window.
pub fn run_claude_raw(continue_session: bool) -> Result<()> {
    let claude = tmux::claude_path().context("claude binary not found")?;

    // Clean a stale chat-input marker left by a previous session in this window.
    if let Some(tmux_bin) = tmux::tmux_path() {
        if let Ok(out) = Command::new(tmux_bin)
            .args(["display-message", "-p", "#{window_name}"])
            .output()
        {
            let window = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !window.is_empty() {
                crate::markers::clear_telegram_active(&window);
            }
        }
    }

    let mut cmd = Command::new(claude);
    if continue_session {
        cmd.arg("-c");
    }
    // Make the OAuth token from config available unless already set.
    if std::env::var("CLAUDE_CODE_OAUTH_TOKEN").unwrap_or_default().is_empty() {
        if let Ok(config) = Config::load() {
            if !config.oauth_token.is_empty() {
                cmd.env("CLAUDE_CODE_OAUTH_TOKEN", &config.oauth_token);
            }
        }
    }
    let status = cmd.status().context("failed to run claude")?;
    if !status.success() {
        bail!("claude exited with {}", status);
    }
    Ok(())
}

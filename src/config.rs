//! Configuration file and session registry.
//!
//! The config is a single JSON document in the user config directory,
//! mode 0600 (it holds the bot token and OTP secret). It is the source of
//! truth for bot credentials, the authorized chat, the forum group, and the
//! per-session records binding topic ↔ tmux window ↔ working directory.
//!
//! Every access loads the file in full; writes go through a temp file +
//! rename so a crashed writer never leaves a torn config behind.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One configured session: Telegram topic + tmux window + working directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub topic_id: i64,
    #[serde(default)]
    pub path: String,
    /// Opaque tmux window id (e.g. "@12"). Empty until the window is created.
    #[serde(default)]
    pub window_id: String,
    /// Assistant session id, captured from the first hook that fires.
    #[serde(default)]
    pub claude_session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: i64,
    #[serde(default)]
    pub group_id: i64,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionInfo>,
    #[serde(default)]
    pub projects_dir: String,
    /// External transcription command; receives the audio path as last arg.
    #[serde(default)]
    pub transcription_cmd: String,
    #[serde(default)]
    pub otp_secret: String,
    #[serde(default)]
    pub oauth_token: String,
    #[serde(default)]
    pub away: bool,
}

impl Config {
    /// Load the config from disk. Errors if the file is missing or invalid.
    pub fn load() -> Result<Config> {
        let path = crate::paths::config_path();
        let data = fs::read(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save the config atomically (write temp, rename) with mode 0600.
    pub fn save(&self) -> Result<()> {
        let path = crate::paths::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }

    pub fn is_otp_enabled(&self) -> bool {
        !self.otp_secret.is_empty()
    }

    /// Find the session name mapped to a Telegram topic id.
    pub fn session_by_topic(&self, topic_id: i64) -> Option<&str> {
        if topic_id == 0 {
            return None;
        }
        self.sessions
            .iter()
            .find(|(_, info)| info.topic_id == topic_id)
            .map(|(name, _)| name.as_str())
    }

    /// Find a session by the assistant session id persisted from hooks.
    pub fn session_by_claude_id(&self, claude_session_id: &str) -> Option<(&str, i64)> {
        if claude_session_id.is_empty() {
            return None;
        }
        self.sessions
            .iter()
            .find(|(_, info)| info.claude_session_id == claude_session_id)
            .map(|(name, info)| (name.as_str(), info.topic_id))
    }

    /// Find a session whose working directory covers `cwd`: exact match,
    /// prefix match on the stored path, or basename match on the name.
    pub fn session_by_cwd(&self, cwd: &str) -> Option<(&str, i64)> {
        self.sessions
            .iter()
            .find(|(name, info)| {
                cwd == info.path
                    || (!info.path.is_empty() && cwd.starts_with(&format!("{}/", info.path)))
                    || cwd.ends_with(&format!("/{}", name))
            })
            .map(|(name, info)| (name.as_str(), info.topic_id))
    }

    /// Map an inbound hook to a session: assistant id first, cwd fallback.
    pub fn find_session(&self, cwd: &str, claude_session_id: &str) -> Option<(&str, i64)> {
        self.session_by_claude_id(claude_session_id)
            .or_else(|| self.session_by_cwd(cwd))
    }

    /// Persist the assistant session id for future lookups, if it changed.
    pub fn persist_claude_session_id(&mut self, session: &str, claude_session_id: &str) {
        if claude_session_id.is_empty() || session.is_empty() {
            return;
        }
        let changed = match self.sessions.get_mut(session) {
            Some(info) if info.claude_session_id != claude_session_id => {
                info.claude_session_id = claude_session_id.to_string();
                true
            }
            _ => false,
        };
        if changed {
            if self.save().is_ok() {
                crate::log::hook_log(&format!(
                    "persisted claude_session_id={} for session={}",
                    claude_session_id, session
                ));
            }
        }
    }

    /// Resolve the working directory for a session name. Absolute paths and
    /// `~/` are honored; bare names land under projects_dir (default ~/).
    pub fn resolve_project_path(&self, name: &str) -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        if let Some(rest) = name.strip_prefix("~/") {
            return home.join(rest);
        }
        if Path::new(name).is_absolute() {
            return PathBuf::from(name);
        }
        let base = if self.projects_dir.is_empty() {
            home
        } else if let Some(rest) = self.projects_dir.strip_prefix("~/") {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(rest)
        } else {
            PathBuf::from(&self.projects_dir)
        };
        base.join(name)
    }
}

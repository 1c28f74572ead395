//! The listener process: single-instance lock, Telegram long-poll loop,
//! update dispatch, typing indicator, and the delivery thread.
//!
//! Exactly one listener runs per machine (advisory lock on ccc.lock; a
//! second instance exits 0 so the service manager does not flap). The lock
//! file holds our pid — hook processes read it to send SIGUSR1.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::commands;
use crate::config::Config;
use crate::db::{now_nanos, Db, MessageRecord};
use crate::format::truncate;
use crate::log::listen_log;
use crate::markers;
use crate::otp;
use crate::session;
use crate::telegram::{Api, CallbackQuery, Message, Update};
use crate::tmux;

const TYPING_INTERVAL: Duration = Duration::from_secs(4);
const AUTH_TMUX_SESSION: &str = "claude-auth";

/// Dispatch state that survives across poll iterations.
struct Listener {
    api: Api,
    otp_attempts: HashMap<String, u32>,
    auth_in_progress: Arc<AtomicBool>,
    auth_waiting_code: Arc<AtomicBool>,
}

/// Main entry for `ccc listen`.
pub fn listen() -> Result<()> {
    // Small stagger so racing instances at boot resolve the lock cleanly.
    std::thread::sleep(Duration::from_millis((std::process::id() % 500) as u64));

    let _lock = match acquire_instance_lock()? {
        Some(lock) => lock,
        None => {
            println!("Another ccc listen instance is already running, exiting quietly");
            std::process::exit(0);
        }
    };

    let config = Config::load().context("not configured. Run: ccc setup <bot_token>")?;
    listen_log(&format!(
        "Bot started (chat: {}, group: {}, sessions: {})",
        config.chat_id,
        config.group_id,
        config.sessions.len()
    ));

    let api = Api::new(&config.bot_token);
    api.set_bot_commands();

    // Delivery loop in its own thread with its own client.
    {
        let token = config.bot_token.clone();
        std::thread::spawn(move || {
            let api = Api::new(&token);
            crate::delivery::run_delivery_loop(&api);
        });
    }

    // Clean shutdown on SIGINT/SIGTERM.
    std::thread::spawn(|| {
        let mut signals = signal_hook::iterator::Signals::new([
            signal_hook::consts::SIGINT,
            signal_hook::consts::SIGTERM,
        ])
        .expect("signal handler installation");
        if let Some(sig) = signals.forever().next() {
            listen_log(&format!("Shutting down (signal: {})", sig));
            std::process::exit(0);
        }
    });

    // Typing indicator: scan thinking flags, clear stale ones.
    {
        let token = config.bot_token.clone();
        std::thread::spawn(move || {
            let api = Api::new(&token);
            loop {
                std::thread::sleep(TYPING_INTERVAL);
                let Ok(config) = Config::load() else {
                    continue;
                };
                if config.group_id == 0 {
                    continue;
                }
                for (name, info) in &config.sessions {
                    if info.topic_id == 0 {
                        continue;
                    }
                    match markers::thinking_state(name) {
                        Some(true) => api.send_typing(config.group_id, info.topic_id),
                        Some(false) => markers::clear_thinking(name),
                        None => {}
                    }
                }
            }
        });
    }

    let mut listener = Listener {
        api,
        otp_attempts: HashMap::new(),
        auth_in_progress: Arc::new(AtomicBool::new(false)),
        auth_waiting_code: Arc::new(AtomicBool::new(false)),
    };

    let mut offset = 0i64;
    loop {
        let updates = match listener.api.get_updates(offset) {
            Ok(updates) => updates,
            Err(err) => {
                listen_log(&format!("Poll error: {} (retrying...)", err));
                std::thread::sleep(Duration::from_secs(5));
                continue;
            }
        };
        for update in updates {
            offset = update.update_id + 1;
            listener.handle_update(update);
        }
    }
}

/// Held for the lifetime of the listener; the advisory lock dies with it.
struct InstanceLock {
    _file: std::fs::File,
}

fn acquire_instance_lock() -> Result<Option<InstanceLock>> {
    use std::os::unix::fs::OpenOptionsExt;

    let path = crate::paths::lock_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;

    let rc = unsafe {
        nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_EX | nix::libc::LOCK_NB)
    };
    if rc != 0 {
        return Ok(None);
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(Some(InstanceLock { _file: file }))
}

impl Listener {
    fn handle_update(&mut self, update: Update) {
        let Ok(config) = Config::load() else {
            return;
        };

        if let Some(cb) = update.callback_query {
            if cb.from.id == config.chat_id {
                self.handle_callback(&config, cb);
            }
            return;
        }

        let Some(msg) = update.message else {
            return;
        };
        if msg.from.id != config.chat_id {
            return;
        }

        let is_group = msg.chat.chat_type == "supergroup";
        let thread_id = msg.message_thread_id;

        if msg.voice.is_some() && is_group && thread_id > 0 {
            self.handle_voice(&config, &msg);
            return;
        }
        if !msg.photo.is_empty() && is_group && thread_id > 0 {
            self.handle_photo(&config, &msg);
            return;
        }
        if msg.document.is_some() && is_group && thread_id > 0 {
            self.handle_document(&config, &msg);
            return;
        }

        let text = strip_bot_mention(msg.text.trim());
        if text.is_empty() {
            return;
        }
        listen_log(&format!("[{}] @{}: {}", msg.chat.chat_type, msg.from.username, text));

        self.handle_text(config, &msg, &text, update.update_id);
    }

    // --- Callback buttons (structured questions) ---

    fn handle_callback(&mut self, config: &Config, cb: CallbackQuery) {
        self.api.answer_callback_query(&cb.id);

        let Some((session_name, q_idx, total, opt_idx)) = parse_callback_payload(&cb.data) else {
            return;
        };

        // Record the choice on the question message and drop its keyboard.
        if let Some(msg) = &cb.message {
            let new_text = format!("{}\n\n✓ Selected option {}", msg.text, opt_idx + 1);
            let _ = self
                .api
                .edit_message_remove_keyboard(msg.chat.id, msg.message_id, &new_text);
        }

        let window = tmux::tmux_safe_name(&session_name);
        let window_id = config
            .sessions
            .get(&session_name)
            .map(|info| info.window_id.clone())
            .unwrap_or_default();
        if !tmux::window_exists(&window_id, &window) {
            return;
        }
        let target = tmux::target_by_id(&window_id, &window);

        // Walk the selector to the chosen option and confirm.
        for _ in 0..opt_idx {
            tmux::send_key(&target, "Down");
            std::thread::sleep(Duration::from_millis(50));
        }
        tmux::send_key(&target, "Enter");
        listen_log(&format!(
            "[callback] Selected option {} for {} (question {}/{})",
            opt_idx,
            session_name,
            q_idx + 1,
            total
        ));

        // After the last question, submit the whole answer batch.
        if total > 0 && q_idx == total - 1 {
            std::thread::sleep(Duration::from_millis(300));
            tmux::send_key(&target, "Enter");
            listen_log(&format!("[callback] Auto-submitted answers for {}", session_name));
        }
    }

    // --- Media ---

    fn handle_voice(&mut self, config: &Config, msg: &Message) {
        let thread_id = msg.message_thread_id;
        let Some(session_name) = config.session_by_topic(thread_id).map(str::to_string) else {
            return;
        };
        let window = tmux::tmux_safe_name(&session_name);
        let window_id = config
            .sessions
            .get(&session_name)
            .map(|info| info.window_id.clone())
            .unwrap_or_default();
        if !tmux::window_exists(&window_id, &window) {
            return;
        }
        let Some(voice) = &msg.voice else {
            return;
        };

        let _ = self.api.send_message(msg.chat.id, thread_id, "🎤 Transcribing...");
        let audio_path = std::env::temp_dir().join(format!("voice_{}.ogg", now_nanos()));
        if let Err(err) = self.api.download_file(&voice.file_id, &audio_path) {
            let _ = self
                .api
                .send_message(msg.chat.id, thread_id, &format!("❌ Download failed: {}", err));
            return;
        }
        let transcription = transcribe_audio(config, &audio_path);
        let _ = std::fs::remove_file(&audio_path);
        let text = match transcription {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => return,
            Err(err) => {
                let _ = self.api.send_message(
                    msg.chat.id,
                    thread_id,
                    &format!("❌ Transcription failed: {}", err),
                );
                return;
            }
        };

        listen_log(&format!("[voice] @{}: {}", msg.from.username, text));
        let _ = self.api.send_message(msg.chat.id, thread_id, &format!("📝 {}", text));
        let voice_text = format!("[Audio transcription, may contain errors]: {}", text);

        if let Ok(db) = Db::open() {
            db.clear_tool_state(&session_name);
            let _ = db.append_message(&MessageRecord {
                id: format!("tg:{}:voice", msg.message_id),
                session: session_name.clone(),
                kind: "user_prompt".into(),
                text: voice_text.clone(),
                origin: "telegram".into(),
                tg_delivered: true,
                ..Default::default()
            });
        }
        let target = tmux::target_by_id(&window_id, &window);
        let _ = tmux::send_text_from_telegram(&target, &window, &voice_text);
    }

    fn handle_photo(&mut self, config: &Config, msg: &Message) {
        let thread_id = msg.message_thread_id;
        let Some(session_name) = config.session_by_topic(thread_id).map(str::to_string) else {
            return;
        };
        let window = tmux::tmux_safe_name(&session_name);
        let window_id = config
            .sessions
            .get(&session_name)
            .map(|info| info.window_id.clone())
            .unwrap_or_default();
        if !tmux::window_exists(&window_id, &window) {
            return;
        }
        // Sizes come smallest-first; the last one is the original.
        let Some(photo) = msg.photo.last() else {
            return;
        };

        let img_path = std::env::temp_dir().join(format!("telegram_{}.jpg", now_nanos()));
        if let Err(err) = self.api.download_file(&photo.file_id, &img_path) {
            let _ = self
                .api
                .send_message(msg.chat.id, thread_id, &format!("❌ Download failed: {}", err));
            return;
        }

        let caption = if msg.caption.is_empty() { "Analyze this image:" } else { &msg.caption };
        let prompt = format!("{} {}", caption, img_path.display());
        listen_log(&format!("[photo] caption={:?} path={}", caption, img_path.display()));
        let _ = self
            .api
            .send_message(msg.chat.id, thread_id, "📷 Image saved, sending to Claude...");

        if let Ok(db) = Db::open() {
            db.clear_tool_state(&session_name);
            let _ = db.append_message(&MessageRecord {
                id: format!("tg:{}:photo", msg.message_id),
                session: session_name.clone(),
                kind: "user_prompt".into(),
                text: caption.to_string(),
                origin: "telegram".into(),
                tg_delivered: true,
                ..Default::default()
            });
        }
        let target = tmux::target_by_id(&window_id, &window);
        if let Err(err) =
            tmux::send_text_from_telegram_with_delay(&target, &window, &prompt, Duration::from_secs(2))
        {
            listen_log(&format!("[photo] send to tmux failed: {}", err));
        }
    }

    fn handle_document(&mut self, config: &Config, msg: &Message) {
        let thread_id = msg.message_thread_id;
        let Some(session_name) = config.session_by_topic(thread_id).map(str::to_string) else {
            return;
        };
        let window = tmux::tmux_safe_name(&session_name);
        let window_id = config
            .sessions
            .get(&session_name)
            .map(|info| info.window_id.clone())
            .unwrap_or_default();
        if !tmux::window_exists(&window_id, &window) {
            return;
        }
        let Some(document) = &msg.document else {
            return;
        };

        let dest_dir = config
            .sessions
            .get(&session_name)
            .map(|info| info.path.clone())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| config.resolve_project_path(&session_name));
        let dest = dest_dir.join(&document.file_name);
        if let Err(err) = self.api.download_file(&document.file_id, &dest) {
            let _ = self
                .api
                .send_message(msg.chat.id, thread_id, &format!("❌ Download failed: {}", err));
            return;
        }

        let caption = if msg.caption.is_empty() {
            format!("I sent you this file: {}", dest.display())
        } else {
            format!("{}\n\nFile: {}", msg.caption, dest.display())
        };
        let _ = self
            .api
            .send_message(msg.chat.id, thread_id, &format!("📎 File saved: {}", dest.display()));

        if let Ok(db) = Db::open() {
            db.clear_tool_state(&session_name);
            let _ = db.append_message(&MessageRecord {
                id: format!("tg:{}:doc", msg.message_id),
                session: session_name.clone(),
                kind: "user_prompt".into(),
                text: caption.clone(),
                origin: "telegram".into(),
                tg_delivered: true,
                ..Default::default()
            });
        }
        let target = tmux::target_by_id(&window_id, &window);
        let _ = tmux::send_text_from_telegram(&target, &window, &caption);
    }

    // --- Text and commands ---

    fn handle_text(&mut self, mut config: Config, msg: &Message, text: &str, update_id: i64) {
        let chat_id = msg.chat.id;
        let thread_id = msg.message_thread_id;
        let is_group = msg.chat.chat_type == "supergroup";

        // A pending OTP request intercepts bare codes.
        if config.is_otp_enabled() && !text.starts_with('/') {
            if let Some(pending) = otp::find_pending_session() {
                self.handle_otp_code(&config, chat_id, thread_id, &pending, text);
                return;
            }
        }

        if let Some(cmd_str) = text.strip_prefix("/c ") {
            let result = commands::execute_command(cmd_str);
            let output = match result.error {
                Some(err) => format!("⚠️ {}\n\nExit: {}", result.output, err),
                None => result.output,
            };
            let _ = self.api.send_message(chat_id, thread_id, &output);
            return;
        }

        match text {
            "/update" => {
                self.handle_update_command(chat_id, thread_id);
                return;
            }
            "/restart" => {
                let _ = self.api.send_message(chat_id, thread_id, "🔄 Restarting ccc service...");
                std::thread::spawn(|| {
                    std::thread::sleep(Duration::from_millis(500));
                    if let Ok(exe) = std::env::current_exe() {
                        let _ = std::process::Command::new(exe).arg("listen").spawn();
                    }
                    std::process::exit(0);
                });
                return;
            }
            "/stats" => {
                let _ = self.api.send_message(chat_id, thread_id, &commands::system_stats());
                return;
            }
            "/version" => {
                let _ = self
                    .api
                    .send_message(chat_id, thread_id, &format!("ccc {}", commands::VERSION));
                return;
            }
            "/auth" => {
                self.handle_auth(chat_id, thread_id);
                return;
            }
            _ => {}
        }

        // The auth flow consumes the next non-command message as the code.
        if self.auth_waiting_code.load(Ordering::Acquire) && !text.starts_with('/') {
            self.handle_auth_code(chat_id, thread_id, text);
            return;
        }

        if text == "/continue" && is_group && thread_id > 0 {
            self.restart_session_command(&mut config, chat_id, thread_id, true);
            return;
        }
        if text == "/delete" && is_group && thread_id > 0 {
            self.delete_session_command(&mut config, chat_id, thread_id);
            return;
        }
        if text == "/cleanup" {
            self.cleanup_command(&mut config, chat_id, thread_id);
            return;
        }
        if let Some(arg) = text.strip_prefix("/new") {
            if is_group {
                self.new_session_command(&mut config, chat_id, thread_id, arg.trim());
                return;
            }
        }

        if is_group && thread_id > 0 {
            self.thread_prompt(&mut config, msg, text, update_id);
            return;
        }

        if !is_group {
            self.private_oneshot(msg, text);
        }
    }

    fn handle_otp_code(
        &mut self,
        config: &Config,
        chat_id: i64,
        thread_id: i64,
        pending_session: &str,
        code: &str,
    ) {
        if otp::validate(&config.otp_secret, code) {
            let _ = otp::write_response(pending_session, true);
            self.otp_attempts.remove(pending_session);
            let _ = self
                .api
                .send_message(chat_id, thread_id, "✅ Permission approved (valid for 5 min)");
            return;
        }
        let attempts = self.otp_attempts.entry(pending_session.to_string()).or_insert(0);
        *attempts += 1;
        let remaining = 5u32.saturating_sub(*attempts);
        if remaining == 0 {
            let _ = otp::write_response(pending_session, false);
            self.otp_attempts.remove(pending_session);
            let _ = self
                .api
                .send_message(chat_id, thread_id, "❌ Too many failed attempts - permission denied");
        } else {
            let _ = self.api.send_message(
                chat_id,
                thread_id,
                &format!("❌ Invalid code — {} attempts remaining", remaining),
            );
        }
    }

    fn handle_update_command(&mut self, chat_id: i64, thread_id: i64) {
        let _ = self.api.send_message(chat_id, thread_id, "🔄 Updating ccc...");
        match commands::self_update() {
            Ok(version) => {
                let _ = self.api.send_message(
                    chat_id,
                    thread_id,
                    &format!("✅ Updated to {} — restarting...", version),
                );
                std::thread::spawn(|| {
                    std::thread::sleep(Duration::from_millis(500));
                    if let Ok(exe) = std::env::current_exe() {
                        let _ = std::process::Command::new(exe).arg("listen").spawn();
                    }
                    std::process::exit(0);
                });
            }
            Err(err) => {
                let _ = self
                    .api
                    .send_message(chat_id, thread_id, &format!("❌ Update failed: {}", err));
            }
        }
    }

    // --- Session commands ---

    fn restart_session_command(
        &mut self,
        config: &mut Config,
        chat_id: i64,
        thread_id: i64,
        continue_session: bool,
    ) {
        let Some(name) = config.session_by_topic(thread_id).map(str::to_string) else {
            let _ = self.api.send_message(
                chat_id,
                thread_id,
                "❌ No session mapped to this topic. Use /new <name> to create one.",
            );
            return;
        };
        match session::restart_window(config, &name, continue_session) {
            Ok(window_id) => {
                std::thread::sleep(Duration::from_millis(500));
                let window = tmux::tmux_safe_name(&name);
                if tmux::window_exists(&window_id, &window) {
                    let note = if continue_session {
                        format!("🔄 Session '{}' restarted with conversation history", name)
                    } else {
                        format!("🚀 Session '{}' restarted", name)
                    };
                    let _ = self.api.send_message(chat_id, thread_id, &note);
                } else {
                    let _ = self.api.send_message(chat_id, thread_id, "⚠️ Session died immediately");
                }
            }
            Err(err) => {
                let _ = self
                    .api
                    .send_message(chat_id, thread_id, &format!("❌ Failed to start: {}", err));
            }
        }
    }

    fn delete_session_command(&mut self, config: &mut Config, chat_id: i64, thread_id: i64) {
        let Some(name) = config.session_by_topic(thread_id).map(str::to_string) else {
            let _ = self
                .api
                .send_message(chat_id, thread_id, "❌ No session mapped to this topic.");
            return;
        };
        let topic_id = config.sessions.get(&name).map(|info| info.topic_id).unwrap_or(0);
        let _ = session::kill_session(config, &name);
        if let Err(err) = self.api.delete_forum_topic(config.group_id, topic_id) {
            let _ = self.api.send_message(
                chat_id,
                thread_id,
                &format!("⚠️ Session deleted but failed to delete thread: {}", err),
            );
        }
        // No success message — the thread is gone.
    }

    fn cleanup_command(&mut self, config: &mut Config, chat_id: i64, thread_id: i64) {
        if config.sessions.is_empty() {
            let _ = self.api.send_message(chat_id, thread_id, "No sessions to clean up.");
            return;
        }

        let mut cleaned = Vec::new();
        let mut errors = Vec::new();
        let sessions: Vec<(String, i64, String)> = config
            .sessions
            .iter()
            .map(|(name, info)| (name.clone(), info.topic_id, info.window_id.clone()))
            .collect();
        for (name, topic_id, window_id) in sessions {
            let window = tmux::tmux_safe_name(&name);
            if tmux::window_exists(&window_id, &window) {
                let _ = tmux::kill_window(&window_id, &window);
            }
            // Project folders are left alone; only windows and topics go.
            if topic_id > 0 && config.group_id != 0 {
                if let Err(err) = self.api.delete_forum_topic(config.group_id, topic_id) {
                    errors.push(format!("{}: {}", name, err));
                }
            }
            cleaned.push(name);
        }

        config.sessions.clear();
        let _ = config.save();

        let mut note = format!("🧹 Cleaned {} sessions: {}", cleaned.len(), cleaned.join(", "));
        if !errors.is_empty() {
            note.push_str(&format!("\n\n⚠️ Errors:\n{}", errors.join("\n")));
        }
        let _ = self.api.send_message(chat_id, thread_id, &note);
    }

    fn new_session_command(
        &mut self,
        config: &mut Config,
        chat_id: i64,
        thread_id: i64,
        arg: &str,
    ) {
        if !arg.is_empty() {
            // /new <name>: brand-new session + topic.
            if let Err(err) = session::validate_session_name(arg) {
                let _ = self.api.send_message(chat_id, thread_id, &format!("❌ {}", err));
                return;
            }
            if let Some(existing) = config.sessions.get(arg) {
                if existing.topic_id != 0 {
                    let _ = self.api.send_message(
                        chat_id,
                        thread_id,
                        &format!(
                            "⚠️ Session '{}' already exists. Use /new without args in that topic to restart.",
                            arg
                        ),
                    );
                    return;
                }
            }
            let topic_id = match self.api.create_forum_topic(config.group_id, arg) {
                Ok(id) => id,
                Err(err) => {
                    let _ = self.api.send_message(
                        chat_id,
                        thread_id,
                        &format!("❌ Failed to create topic: {}", err),
                    );
                    return;
                }
            };
            // Preserve a preset path when the session was pre-declared.
            let work_dir = config
                .sessions
                .get(arg)
                .map(|info| info.path.clone())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| config.resolve_project_path(arg).to_string_lossy().into_owned());
            config.sessions.insert(
                arg.to_string(),
                crate::config::SessionInfo {
                    topic_id,
                    path: work_dir.clone(),
                    ..Default::default()
                },
            );
            let _ = config.save();
            if !std::path::Path::new(&work_dir).exists() {
                let _ = std::fs::create_dir_all(&work_dir);
            }
            let window = tmux::tmux_safe_name(arg);
            match tmux::create_window(&window, &work_dir, false) {
                Ok(window_id) => {
                    if let Some(entry) = config.sessions.get_mut(arg) {
                        entry.window_id = window_id.clone();
                    }
                    let _ = config.save();
                    std::thread::sleep(Duration::from_millis(500));
                    if tmux::window_exists(&window_id, &window) {
                        let _ = self.api.send_message(
                            config.group_id,
                            topic_id,
                            &format!(
                                "🚀 Session '{}' started!\n\nSend messages here to interact with Claude.",
                                arg
                            ),
                        );
                    } else {
                        let _ = self.api.send_message(
                            config.group_id,
                            topic_id,
                            &format!(
                                "⚠️ Session '{}' created but died immediately. Check if ~/bin/ccc works.",
                                arg
                            ),
                        );
                    }
                }
                Err(err) => {
                    let _ = self.api.send_message(
                        config.group_id,
                        topic_id,
                        &format!("❌ Failed to start tmux: {}", err),
                    );
                }
            }
            return;
        }

        // /new without args: restart the session of the current topic.
        if thread_id > 0 {
            self.restart_session_command(config, chat_id, thread_id, false);
        } else {
            let _ = self
                .api
                .send_message(chat_id, thread_id, "Usage: /new <name> to create a new session");
        }
    }

    /// Free text in a session thread: record, mark chat-active, inject.
    fn thread_prompt(&mut self, config: &mut Config, msg: &Message, text: &str, update_id: i64) {
        let chat_id = msg.chat.id;
        let thread_id = msg.message_thread_id;
        let Some(name) = config.session_by_topic(thread_id).map(str::to_string) else {
            let _ = self.api.send_message(
                chat_id,
                thread_id,
                "⚠️ No session linked to this topic. Use /new <name> to create one.",
            );
            return;
        };

        let window = tmux::tmux_safe_name(&name);
        let mut window_id = config
            .sessions
            .get(&name)
            .map(|info| info.window_id.clone())
            .unwrap_or_default();

        if !tmux::window_exists(&window_id, &window) {
            // Auto-start a dead session before injecting.
            match session::restart_window(config, &name, false) {
                Ok(new_id) => {
                    window_id = new_id;
                    let _ = self.api.send_message(
                        chat_id,
                        thread_id,
                        &format!("🚀 Session '{}' auto-started", name),
                    );
                    // Give the assistant time to fully start.
                    std::thread::sleep(Duration::from_secs(3));
                }
                Err(err) => {
                    let _ = self.api.send_message(
                        chat_id,
                        thread_id,
                        &format!("❌ Failed to start session: {}", err),
                    );
                    return;
                }
            }
        }
        let target = tmux::target_by_id(&window_id, &window);
        listen_log(&format!("sendToTmux: target={} window={}", target, window));

        if let Ok(db) = Db::open() {
            // New prompt: the previous turn's tool display is over.
            db.clear_tool_state(&name);
            let _ = db.append_message(&MessageRecord {
                id: format!("tg:{}", update_id),
                session: name.clone(),
                kind: "user_prompt".into(),
                text: text.to_string(),
                origin: "telegram".into(),
                tg_delivered: true,
                ..Default::default()
            });
        }

        markers::clear_prompt_ack(&name);
        if let Err(err) = tmux::send_text_from_telegram(&target, &window, text) {
            listen_log(&format!("sendToTmux FAILED: target={} err={}", target, err));
            let _ = self
                .api
                .send_message(chat_id, thread_id, &format!("❌ Failed to send: {}", err));
            return;
        }

        // The user-prompt hook acks the hand-off; a missing ack usually
        // means the injection landed in a dead or busy pane.
        let session_name = name.clone();
        std::thread::spawn(move || {
            if !markers::wait_prompt_ack(&session_name, Duration::from_secs(10)) {
                listen_log(&format!(
                    "prompt ack missing for {} (injection may not have reached Claude)",
                    session_name
                ));
            }
        });
    }

    /// Free text in the private chat: one-shot assistant run.
    fn private_oneshot(&mut self, msg: &Message, text: &str) {
        let chat_id = msg.chat.id;
        let _ = self.api.send_message(chat_id, 0, "🤖 Running Claude...");

        let mut prompt = text.to_string();
        if let Some(reply) = &msg.reply_to_message {
            if !reply.text.is_empty() {
                // Replying to a message that starts with a project directory
                // keeps the one-shot in that directory.
                if let Some(first_word) = reply.text.split_whitespace().next() {
                    if let Some(home) = dirs::home_dir() {
                        if home.join(first_word).is_dir() {
                            prompt = format!("{} {}", first_word, prompt);
                        }
                    }
                }
                prompt = format!("Original message:\n{}\n\nReply:\n{}", reply.text, prompt);
            }
        }

        let token = {
            let Ok(config) = Config::load() else {
                return;
            };
            config.bot_token
        };
        std::thread::spawn(move || {
            let api = Api::new(&token);
            let result = std::panic::catch_unwind(|| commands::run_claude_oneshot(&prompt));
            let output = match result {
                Ok(result) => match result.error {
                    Some(err) if err == "timeout" => {
                        format!("⏱️ Timeout (10min)\n\n{}", result.output)
                    }
                    Some(err) => format!("⚠️ {}\n\nExit: {}", result.output, err),
                    None => result.output,
                },
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown".into());
                    format!("💥 Panic: {}", reason)
                }
            };
            let _ = api.send_message(chat_id, 0, &output);
        });
    }

    // --- Claude OAuth via a scratch tmux session ---

    fn handle_auth(&mut self, chat_id: i64, thread_id: i64) {
        if self
            .auth_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let _ = self.api.send_message(chat_id, thread_id, "⚠️ Auth already in progress");
            return;
        }
        let _ = self.api.send_message(chat_id, thread_id, "🔐 Starting Claude auth...");

        let _ = tmux::kill_session(AUTH_TMUX_SESSION);
        std::thread::sleep(Duration::from_millis(500));

        let Some(tmux_bin) = tmux::tmux_path() else {
            let _ = self.api.send_message(chat_id, thread_id, "❌ tmux not found");
            self.auth_in_progress.store(false, Ordering::Release);
            return;
        };
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        if std::process::Command::new(tmux_bin)
            .args(["new-session", "-d", "-s", AUTH_TMUX_SESSION, "-c"])
            .arg(&home)
            .status()
            .map(|s| !s.success())
            .unwrap_or(true)
        {
            let _ = self
                .api
                .send_message(chat_id, thread_id, "❌ Failed to create tmux session");
            self.auth_in_progress.store(false, Ordering::Release);
            return;
        }

        std::thread::sleep(Duration::from_millis(500));
        let claude = tmux::claude_path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "claude".into());
        let _ = std::process::Command::new(tmux_bin)
            .args(["send-keys", "-t", AUTH_TMUX_SESSION])
            .arg(format!("{} --dangerously-skip-permissions", claude))
            .arg("C-m")
            .status();

        let mut oauth_url = String::new();
        for _ in 0..30 {
            std::thread::sleep(Duration::from_millis(500));
            let Ok(pane) = tmux::capture_pane(AUTH_TMUX_SESSION, Some(-30)) else {
                continue;
            };
            if pane.contains("Dark mode") || pane.contains('❯') || pane.contains("Welcome back") {
                let _ = self
                    .api
                    .send_message(chat_id, thread_id, "✅ Claude is already authenticated!");
                let _ = tmux::kill_session(AUTH_TMUX_SESSION);
                self.auth_in_progress.store(false, Ordering::Release);
                return;
            }
            if pane.contains("claude.ai/oauth/authorize") {
                let mut capturing = false;
                for line in pane.lines() {
                    let line = line.trim();
                    if line.starts_with("https://claude.ai/oauth/") {
                        oauth_url = line.to_string();
                        capturing = true;
                    } else if capturing
                        && !line.is_empty()
                        && !line.contains("Paste code")
                        && !line.contains("Browser")
                    {
                        oauth_url.push_str(line);
                    } else if capturing {
                        capturing = false;
                    }
                }
                break;
            }
        }

        if oauth_url.is_empty() {
            let _ = self
                .api
                .send_message(chat_id, thread_id, "❌ Could not find OAuth URL. Try again.");
            let _ = tmux::kill_session(AUTH_TMUX_SESSION);
            self.auth_in_progress.store(false, Ordering::Release);
            return;
        }

        self.auth_waiting_code.store(true, Ordering::Release);
        let _ = self.api.send_message(
            chat_id,
            thread_id,
            &format!("🔗 Open this URL and authorize:\n\n{}\n\nThen paste the code here.", oauth_url),
        );
    }

    fn handle_auth_code(&mut self, chat_id: i64, thread_id: i64, code: &str) {
        self.auth_waiting_code.store(false, Ordering::Release);
        let code = code.trim();
        let _ = self.api.send_message(chat_id, thread_id, "🔄 Sending code to Claude...");

        let Some(tmux_bin) = tmux::tmux_path() else {
            return;
        };
        let _ = std::process::Command::new(tmux_bin)
            .args(["send-keys", "-t", AUTH_TMUX_SESSION, "-l", code])
            .status();
        std::thread::sleep(Duration::from_millis(200));
        tmux::send_key(AUTH_TMUX_SESSION, "C-m");

        for _ in 0..10 {
            std::thread::sleep(Duration::from_secs(2));
            let Ok(pane) = tmux::capture_pane(AUTH_TMUX_SESSION, None) else {
                continue;
            };
            if pane.contains("Yes, I accept") {
                tmux::send_key(AUTH_TMUX_SESSION, "Down");
                std::thread::sleep(Duration::from_millis(200));
                tmux::send_key(AUTH_TMUX_SESSION, "C-m");
                continue;
            }
            if pane.contains("Press Enter") || pane.contains("Enter to confirm") {
                tmux::send_key(AUTH_TMUX_SESSION, "C-m");
                continue;
            }
            if pane.contains('❯') {
                let _ = self
                    .api
                    .send_message(chat_id, thread_id, "✅ Auth successful! Claude is ready.");
                let _ = tmux::kill_session(AUTH_TMUX_SESSION);
                self.auth_in_progress.store(false, Ordering::Release);
                return;
            }
        }

        let pane = tmux::capture_pane(AUTH_TMUX_SESSION, None).unwrap_or_default();
        if pane.contains("Login successful") || pane.contains('❯') {
            let _ = self.api.send_message(chat_id, thread_id, "✅ Auth successful!");
        } else {
            let _ = self
                .api
                .send_message(chat_id, thread_id, "⚠️ Auth may have failed. Check the host manually.");
        }
        let _ = tmux::kill_session(AUTH_TMUX_SESSION);
        self.auth_in_progress.store(false, Ordering::Release);
    }
}

/// Run the configured transcription command against an audio file.
fn transcribe_audio(config: &Config, audio_path: &std::path::Path) -> Result<String> {
    if config.transcription_cmd.is_empty() {
        anyhow::bail!("no transcription command configured (ccc config transcription-cmd ...)");
    }
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("{} {}", config.transcription_cmd, audio_path.display()))
        .output()
        .context("transcription command failed to start")?;
    if !output.status.success() {
        anyhow::bail!(
            "transcription command exited with {}: {}",
            output.status,
            truncate(&String::from_utf8_lossy(&output.stderr), 200)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Strip an @botname suffix from a leading command
/// (e.g. "/ping@mybot arg" → "/ping arg").
pub fn strip_bot_mention(text: &str) -> String {
    if !text.starts_with('/') {
        return text.to_string();
    }
    let Some(at_idx) = text.find('@') else {
        return text.to_string();
    };
    let space_idx = text.find(' ');
    if let Some(space) = space_idx {
        if at_idx > space {
            return text.to_string();
        }
        format!("{}{}", &text[..at_idx], &text[space..]).trim().to_string()
    } else {
        text[..at_idx].to_string()
    }
}

/// Parse a callback payload `session:qIdx:totalQuestions:optIdx`. The
/// legacy 3-part form `session:qIdx:optIdx` is still accepted.
pub fn parse_callback_payload(data: &str) -> Option<(String, usize, usize, usize)> {
    let parts: Vec<&str> = data.split(':').collect();
    match parts.as_slice() {
        [session, q_idx, total, opt_idx] => Some((
            session.to_string(),
            q_idx.parse().ok()?,
            total.parse().ok()?,
            opt_idx.parse().ok()?,
        )),
        [session, q_idx, opt_idx] => Some((
            session.to_string(),
            q_idx.parse().ok()?,
            0,
            opt_idx.parse().ok()?,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_bot_mentions_from_commands() {
        assert_eq!(strip_bot_mention("/ping@mybot"), "/ping");
        assert_eq!(strip_bot_mention("/ping@mybot arg"), "/ping arg");
        assert_eq!(strip_bot_mention("/ping"), "/ping");
        assert_eq!(strip_bot_mention("plain text"), "plain text");
        assert_eq!(strip_bot_mention("/c echo a@b"), "/c echo a@b");
    }

    #[test]
    fn parses_callback_payloads() {
        assert_eq!(
            parse_callback_payload("web:0:2:1"),
            Some(("web".into(), 0, 2, 1))
        );
        // Legacy 3-part form
        assert_eq!(
            parse_callback_payload("web:1:2"),
            Some(("web".into(), 1, 0, 2))
        );
        assert_eq!(parse_callback_payload("junk"), None);
        assert_eq!(parse_callback_payload("a:b:c:d"), None);
    }
}

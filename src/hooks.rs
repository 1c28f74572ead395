//! Hook handlers — short-lived subprocesses the assistant spawns at its
//! lifecycle points.
//!
//! Hard rules, shared by every handler:
//! - stdin is read with a 2-second timeout and parsed tolerantly;
//! - a hook never propagates an error to the assistant: any failure means
//!   exit 0 with no side effects (the permission hook emits a deny);
//! - every handler that writes a message row wakes the listener with
//!   SIGUSR1 so delivery starts within milliseconds instead of next tick.

use anyhow::Result;
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

use crate::config::Config;
use crate::db::{content_hash, now_millis, now_nanos, Db, MessageRecord, ToolEntry};
use crate::delivery::notify_listener;
use crate::format::{markdown_to_html, truncate};
use crate::log::hook_log;
use crate::markers;
use crate::otp;
use crate::telegram::{Api, InlineKeyboardButton};
use crate::toolstate::{format_tool_message, tool_input_summary, ToolStateLock};
use crate::transcript::extract_recent_assistant_texts;

/// How many transcript entries the text flush looks back over.
const TRANSCRIPT_TAIL: usize = 80;

/// Structured tool input. Claude sends a different shape per tool; the
/// fields below are the union the summaries and the OTP gate care about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolInput {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub old_string: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuestionOption {
    #[serde(default)]
    pub label: String,
}

/// The hook input schema. Unknown fields are tolerated everywhere.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookData {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub transcript_path: String,
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: ToolInput,
    /// Raw tool_input JSON, kept for the OTP description fallback.
    #[serde(skip)]
    pub tool_input_raw: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub notification_type: String,
    #[serde(default)]
    pub trigger: String,
}

/// Parse hook stdin JSON, capturing the raw tool_input alongside the
/// structured decode.
pub fn parse_hook_data(raw: &[u8]) -> Result<HookData> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    let tool_input_raw = value
        .get("tool_input")
        .map(|v| v.to_string())
        .unwrap_or_default();
    let mut hook: HookData = serde_json::from_value(value)?;
    hook.tool_input_raw = tool_input_raw;
    Ok(hook)
}

/// Read stdin with a bounded wait. The assistant normally writes and closes
/// immediately; the timeout guards against a wedged parent.
fn read_hook_stdin() -> Vec<u8> {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let mut data = Vec::new();
        let _ = std::io::stdin().read_to_end(&mut data);
        let _ = tx.send(data);
    });
    rx.recv_timeout(Duration::from_secs(2)).unwrap_or_default()
}

/// Common preamble: stdin → HookData → Config → session. `None` means the
/// hook should silently succeed without side effects.
fn hook_context() -> Option<(HookData, Config, String, i64)> {
    let raw = read_hook_stdin();
    if raw.is_empty() {
        return None;
    }
    let hook = parse_hook_data(&raw).ok()?;
    let mut config = Config::load().ok()?;
    let (session, topic_id) = config
        .find_session(&hook.cwd, &hook.session_id)
        .map(|(s, t)| (s.to_string(), t))?;
    if config.group_id == 0 {
        return None;
    }
    config.persist_claude_session_id(&session, &hook.session_id);
    Some((hook, config, session, topic_id))
}

// --- Stop hook ---

pub fn handle_stop() -> Result<()> {
    let Some((hook, config, session, topic_id)) = hook_context() else {
        return Ok(());
    };
    if topic_id == 0 {
        return Ok(());
    }

    hook_log(&format!(
        "stop-hook: session={} claude_session_id={} transcript={}",
        session, hook.session_id, hook.transcript_path
    ));

    // Turn over: clear the chat-input and thinking flags.
    let window = crate::tmux::tmux_safe_name(&session);
    markers::clear_telegram_active(&window);
    markers::clear_thinking(&session);

    let Ok(db) = Db::open() else {
        return Ok(());
    };
    let sent = queue_unsent_texts(&db, &session, &hook.transcript_path);
    hook_log(&format!("stop-hook: sent={}", sent));
    db.clear_tool_state(&session);
    if sent > 0 {
        notify_listener();
    }

    // The transcript may not be flushed yet when this hook fires. A thread
    // dies with the hook process, so the retry runs as a detached child.
    let _ = std::process::Command::new(crate::tmux::ccc_path())
        .arg("hook-stop-retry")
        .arg(&session)
        .arg(topic_id.to_string())
        .arg(&hook.transcript_path)
        .spawn();

    Ok(())
}

/// Detached retry child: re-runs the text flush to catch transcript writes
/// delayed past hook completion. Self-terminates after 3 cycles.
pub fn handle_stop_retry(session: &str, _topic_id: i64, transcript_path: &str) -> Result<()> {
    let Ok(db) = Db::open() else {
        return Ok(());
    };
    for attempt in 1..=3 {
        std::thread::sleep(Duration::from_secs(2));
        let n = queue_unsent_texts(&db, session, transcript_path);
        hook_log(&format!("stop-retry: {}/3 sent={} session={}", attempt, n, session));
        if n > 0 {
            notify_listener();
        }
    }
    Ok(())
}

/// Queue assistant text blocks not yet in the log (stop-hook path): the
/// rows are inserted undelivered and the delivery loop echoes them.
/// Idempotent — the `reply:{requestId}:{hash}` id dedups re-reads.
pub fn queue_unsent_texts(db: &Db, session: &str, transcript_path: &str) -> usize {
    let blocks = extract_recent_assistant_texts(transcript_path, TRANSCRIPT_TAIL);
    if let Some(last) = blocks.last() {
        hook_log(&format!(
            "deliver-unsent: found {} blocks, last={}",
            blocks.len(),
            truncate(&last.text, 60)
        ));
    }

    let mut sent = 0;
    for block in blocks {
        let block_id = format!("reply:{}:{}", block.request_id, content_hash(&block.text));
        if db.is_delivered(&block_id) {
            continue;
        }
        db.clear_tool_state(session);
        let _ = db.append_message(&MessageRecord {
            id: block_id,
            session: session.into(),
            kind: "assistant_text".into(),
            text: block.text,
            origin: "claude".into(),
            ..Default::default()
        });
        sent += 1;
    }
    sent
}

/// Flush assistant text that appears between tool calls (pre-tool path):
/// merged into the live blockquote when one exists, sent directly otherwise
/// so ordering relative to the tool display is preserved.
fn merge_unsent_texts(
    api: &Api,
    config: &Config,
    db: &Db,
    session: &str,
    topic_id: i64,
    transcript_path: &str,
) -> usize {
    let blocks = extract_recent_assistant_texts(transcript_path, TRANSCRIPT_TAIL);
    let mut sent = 0;
    for block in blocks {
        let block_id = format!("reply:{}:{}", block.request_id, content_hash(&block.text));
        if db.is_delivered(&block_id) {
            continue;
        }
        hook_log(&format!(
            "deliver-text: rid={} len={} preview={}",
            block.request_id,
            block.text.len(),
            truncate(&block.text, 80)
        ));

        let guard = ToolStateLock::acquire(session);
        let mut state = db.load_tool_state(session);
        if state.msg_id != 0 {
            state.tools.push(ToolEntry {
                input: block.text.clone(),
                is_text: true,
                time: now_millis(),
                ..Default::default()
            });
            db.save_tool_state(session, &state);
            drop(guard);
            let _ = api.edit_message_html(config.group_id, state.msg_id, &format_tool_message(&state));
            let _ = db.append_message(&MessageRecord {
                id: block_id,
                session: session.into(),
                kind: "assistant_text".into(),
                text: block.text,
                origin: "claude".into(),
                tg_delivered: true,
                tg_msg_id: state.msg_id,
                ..Default::default()
            });
        } else {
            drop(guard);
            let html = format!("<b>{}:</b>\n{}", session, markdown_to_html(&block.text));
            let result = api.send_message_html_get_id(config.group_id, topic_id, &html);
            if let Err(ref err) = result {
                hook_log(&format!("deliver-text: direct send failed: {}", err));
            }
            let _ = db.append_message(&MessageRecord {
                id: block_id,
                session: session.into(),
                kind: "assistant_text".into(),
                text: block.text,
                origin: "claude".into(),
                tg_delivered: result.is_ok(),
                tg_msg_id: result.unwrap_or(0),
                ..Default::default()
            });
        }
        sent += 1;
    }
    sent
}

// --- User prompt hook ---

pub fn handle_user_prompt() -> Result<()> {
    let raw = read_hook_stdin();
    if raw.is_empty() {
        return Ok(());
    }
    let Ok(hook) = parse_hook_data(&raw) else {
        return Ok(());
    };
    if hook.prompt.is_empty() {
        return Ok(());
    }
    let Ok(mut config) = Config::load() else {
        return Ok(());
    };
    let Some((session, topic_id)) = config
        .find_session(&hook.cwd, &hook.session_id)
        .map(|(s, t)| (s.to_string(), t))
    else {
        return Ok(());
    };
    if config.group_id == 0 || topic_id == 0 {
        return Ok(());
    }
    config.persist_claude_session_id(&session, &hook.session_id);

    let Ok(db) = Db::open() else {
        return Ok(());
    };
    user_prompt_inner(&db, &session, &hook);
    Ok(())
}

/// Core of the user-prompt hook, separated from process plumbing.
pub fn user_prompt_inner(db: &Db, session: &str, hook: &HookData) {
    hook_log(&format!(
        "user-prompt: session={} prompt={:?}",
        session,
        truncate(&hook.prompt, 100)
    ));

    // A new turn begins: previous turn's tool display is stale.
    db.clear_tool_state(session);

    let window = crate::tmux::tmux_safe_name(session);
    if db.is_from_telegram(session, &hook.prompt) {
        // Loopback: the prompt is already visible in chat. Absorb it.
        hook_log("user-prompt: matched telegram origin, skipping echo");
        markers::clear_telegram_active(&window);
        markers::write_prompt_ack(session);
        markers::set_thinking(session);
        db.log_event(session, "prompt_confirmed", "hook-user-prompt", "", &hook.prompt);
        return;
    }

    hook_log("user-prompt: NOT from telegram, will echo to telegram");
    markers::clear_telegram_active(&window);
    markers::set_thinking(session);

    let _ = db.append_message(&MessageRecord {
        id: format!("prompt:{}:{}", hook.session_id, now_nanos()),
        session: session.into(),
        kind: "user_prompt".into(),
        text: hook.prompt.clone(),
        origin: "terminal".into(),
        ..Default::default()
    });
    db.log_event(session, "prompt_terminal", "hook-user-prompt", "", &hook.prompt);
    notify_listener();
}

// --- Pre-tool hook (tool display + permission gate) ---

pub fn handle_pre_tool() -> Result<()> {
    let Some((hook, config, session, topic_id)) = hook_context() else {
        return Ok(());
    };

    hook_log(&format!("pre-tool: session={} tool={}", session, hook.tool_name));

    let api = Api::new(&config.bot_token);
    let Ok(db) = Db::open() else {
        return Ok(());
    };

    // Assistant text emitted before this tool call goes out first so the
    // chat reads in the same order the terminal does.
    if topic_id != 0 && !hook.transcript_path.is_empty() {
        merge_unsent_texts(&api, &config, &db, &session, topic_id, &hook.transcript_path);
    }

    if !hook.tool_name.is_empty() && hook.tool_name != "AskUserQuestion" && topic_id != 0 {
        record_tool_invocation(&api, &config, &db, &session, topic_id, &hook);
    }

    if hook.tool_name == "AskUserQuestion" && !hook.tool_input.questions.is_empty() {
        post_questions(&api, &config, &session, topic_id, &hook);
        return Ok(());
    }

    run_permission_gate(&api, &config, &db, &session, topic_id, &hook);
    Ok(())
}

/// Append the tool call to the live blockquote message (creating it when
/// this is the first tool of the turn) and record it in the log.
fn record_tool_invocation(
    api: &Api,
    config: &Config,
    db: &Db,
    session: &str,
    topic_id: i64,
    hook: &HookData,
) {
    let summary = tool_input_summary(hook);

    let guard = ToolStateLock::acquire(session);
    let mut state = db.load_tool_state(session);
    state.tools.push(ToolEntry {
        name: hook.tool_name.clone(),
        input: summary.clone(),
        time: now_millis(),
        ..Default::default()
    });
    let text = format_tool_message(&state);
    if state.msg_id == 0 {
        if let Ok(msg_id) = api.send_message_html_get_id(config.group_id, topic_id, &text) {
            if msg_id > 0 {
                state.msg_id = msg_id;
            }
        }
    } else {
        let _ = api.edit_message_html(config.group_id, state.msg_id, &text);
    }
    db.save_tool_state(session, &state);
    drop(guard);

    let _ = db.append_message(&MessageRecord {
        id: format!(
            "tool:{}:{}:{}",
            hook.session_id,
            content_hash(&format!("{}{}", hook.tool_name, summary)),
            now_nanos()
        ),
        session: session.into(),
        kind: "tool_call".into(),
        text: format!("{}: {}", hook.tool_name, summary),
        origin: "claude".into(),
        tg_delivered: state.msg_id != 0,
        tg_msg_id: state.msg_id,
        ..Default::default()
    });
}

/// Post each structured question as a chat message with one inline button
/// per option. Answers come back through the callback path of the poller.
fn post_questions(api: &Api, config: &Config, session: &str, topic_id: i64, hook: &HookData) {
    let total = hook.tool_input.questions.len();
    for (q_idx, q) in hook.tool_input.questions.iter().enumerate() {
        if q.question.is_empty() {
            continue;
        }
        let msg = format!("❓ {}\n\n{}", q.header, q.question);
        let buttons: Vec<Vec<InlineKeyboardButton>> = q
            .options
            .iter()
            .enumerate()
            .filter(|(_, opt)| !opt.label.is_empty())
            .map(|(opt_idx, opt)| {
                vec![InlineKeyboardButton {
                    text: opt.label.clone(),
                    callback_data: callback_payload(session, q_idx, total, opt_idx),
                }]
            })
            .collect();
        if !buttons.is_empty() {
            let _ = api.send_message_with_keyboard(config.group_id, topic_id, &msg, &buttons);
        }
    }
}

/// Encode a button payload. Session names are length-capped at creation, so
/// the encoding always fits Telegram's 64-byte callback limit.
pub fn callback_payload(session: &str, q_idx: usize, total: usize, opt_idx: usize) -> String {
    format!("{}:{}:{}:{}", session, q_idx, total, opt_idx)
}

/// The OTP permission gate for chat-driven sessions.
fn run_permission_gate(
    api: &Api,
    config: &Config,
    _db: &Db,
    session: &str,
    topic_id: i64,
    hook: &HookData,
) {
    if !config.is_otp_enabled() {
        output_permission_decision("allow", "OTP not configured");
        return;
    }

    // The gate only arms when recent input came from chat. Local terminal
    // use keeps the assistant's own interactive permission flow.
    let window = crate::tmux::tmux_safe_name(session);
    if !markers::telegram_active_fresh(&window) {
        return;
    }

    if otp::has_valid_grant(&window) {
        output_permission_decision("allow", "OTP grant still valid");
        return;
    }

    let mut input_str = match hook.tool_name.as_str() {
        "Bash" => hook.tool_input.command.clone(),
        "Read" | "Write" | "Edit" => hook.tool_input.file_path.clone(),
        _ => String::new(),
    };
    if input_str.is_empty() {
        input_str = hook.tool_input_raw.clone();
    }
    let input_str = truncate(&input_str, 500);

    let session_id = if hook.session_id.is_empty() { session } else { &hook.session_id };

    // Only the first parallel hook sends the chat prompt; siblings piggyback
    // on the existing request and wait for the shared grant.
    let already_requested = otp::request_already_sent(session_id);
    let _ = otp::write_request(
        session_id,
        &otp::PermissionRequest {
            session_name: session.into(),
            tool_name: hook.tool_name.clone(),
            tool_input: input_str.clone(),
            timestamp: now_millis() / 1000,
        },
    );

    if !already_requested {
        let msg = format!(
            "🔐 Permission request:\n\n🔧 {}\n📋 {}\n\nSend your OTP code to approve:",
            hook.tool_name, input_str
        );
        let _ = api.send_message(config.group_id, topic_id, &msg);
    }

    hook_log(&format!(
        "otp-request: waiting for OTP response for session={} tool={} already={}",
        session, hook.tool_name, already_requested
    ));

    match otp::wait_for_response(session_id, &window, otp::OTP_WAIT_TIMEOUT) {
        Ok(true) => {
            hook_log(&format!("otp-request: approved for session={} tool={}", session, hook.tool_name));
            otp::write_grant(&window);
            output_permission_decision("allow", "Approved via OTP");
        }
        Ok(false) => {
            hook_log(&format!("otp-request: denied for session={} tool={}", session, hook.tool_name));
            output_permission_decision("deny", "Denied via OTP");
        }
        Err(err) => {
            hook_log(&format!("otp-request: timeout or error: {}", err));
            let _ = api.send_message(config.group_id, topic_id, "⏰ OTP timeout - permission denied");
            output_permission_decision("deny", "OTP approval timed out");
        }
    }
}

/// Render the PreToolUse stdout decision document.
pub fn permission_decision_json(decision: &str, reason: &str) -> String {
    serde_json::json!({
        "hookSpecificOutput": {
            "hookEventName": "PreToolUse",
            "permissionDecision": decision,
            "permissionDecisionReason": reason,
        }
    })
    .to_string()
}

fn output_permission_decision(decision: &str, reason: &str) {
    println!("{}", permission_decision_json(decision, reason));
}

// --- Post-tool hook ---

/// No-op: tool completion is implied by the next tool starting.
pub fn handle_post_tool() -> Result<()> {
    Ok(())
}

// --- Compaction hooks ---

pub fn handle_compact() -> Result<()> {
    let Some((hook, _config, session, topic_id)) = hook_context() else {
        return Ok(());
    };
    if topic_id == 0 {
        return Ok(());
    }
    let Ok(db) = Db::open() else {
        return Ok(());
    };
    compact_inner(&db, &session, &hook);
    notify_listener();
    Ok(())
}

pub fn compact_inner(db: &Db, session: &str, hook: &HookData) {
    let msg = if hook.hook_event_name == "PreCompact" {
        let trigger = if hook.trigger.is_empty() { "auto" } else { &hook.trigger };
        format!("☕️ Compacting conversation ({}). Have a cup of coffee.", trigger)
    } else {
        // SessionStart with the compact matcher fires after compaction.
        "☕️ Context compacted".to_string()
    };
    let _ = db.append_message(&MessageRecord {
        id: format!("compact:{}:{}", hook.session_id, now_nanos()),
        session: session.into(),
        kind: "notification".into(),
        text: msg.clone(),
        origin: "claude".into(),
        ..Default::default()
    });
    db.log_event(session, "compact", "hook-compact", "", &msg);
}

// --- Notification hook ---

pub fn handle_notification() -> Result<()> {
    let Some((hook, _config, session, topic_id)) = hook_context() else {
        return Ok(());
    };
    if topic_id == 0 {
        return Ok(());
    }
    let Ok(db) = Db::open() else {
        return Ok(());
    };
    if notification_inner(&db, &session, &hook) {
        notify_listener();
    }
    Ok(())
}

/// Returns true when a row was written (caller wakes the listener).
pub fn notification_inner(db: &Db, session: &str, hook: &HookData) -> bool {
    // idle_prompt means the assistant is waiting for input — stop "typing".
    if hook.notification_type == "idle_prompt" {
        markers::clear_thinking(session);
        return false;
    }

    let body = if !hook.message.is_empty() {
        &hook.message
    } else if !hook.title.is_empty() {
        &hook.title
    } else if !hook.notification_type.is_empty() {
        &hook.notification_type
    } else {
        return false;
    };

    let _ = db.append_message(&MessageRecord {
        id: format!("notif:{}:{}", hook.session_id, now_nanos()),
        session: session.into(),
        kind: "notification".into(),
        text: format!("🔔 {}", body),
        origin: "claude".into(),
        ..Default::default()
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_cache_dir<F: FnOnce()>(f: F) {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("CCC_CACHE_DIR", dir.path());
        f();
        std::env::remove_var("CCC_CACHE_DIR");
    }

    fn test_db(dir: &tempfile::TempDir) -> Db {
        Db::open_at(&dir.path().join("test.db")).unwrap()
    }

    // ---- parsing ----

    #[test]
    fn parses_basic_hook_data() {
        let raw = br#"{"cwd":"/Users/test/project","transcript_path":"/tmp/transcript.jsonl","session_id":"abc123"}"#;
        let hook = parse_hook_data(raw).unwrap();
        assert_eq!(hook.cwd, "/Users/test/project");
        assert_eq!(hook.transcript_path, "/tmp/transcript.jsonl");
        assert_eq!(hook.session_id, "abc123");
    }

    #[test]
    fn captures_raw_tool_input() {
        let raw = br#"{"tool_name":"Bash","tool_input":{"command":"ls","timeout":5}}"#;
        let hook = parse_hook_data(raw).unwrap();
        assert_eq!(hook.tool_input.command, "ls");
        assert!(hook.tool_input_raw.contains("\"timeout\":5"));
    }

    #[test]
    fn parses_questions() {
        let raw = br#"{"tool_name":"AskUserQuestion","tool_input":{"questions":[
            {"header":"H1","question":"Pick one","options":[{"label":"a"},{"label":"b"}]},
            {"header":"H2","question":"Pick two","options":[{"label":"x"},{"label":"y"},{"label":"z"}]}
        ]}}"#;
        let hook = parse_hook_data(raw).unwrap();
        assert_eq!(hook.tool_input.questions.len(), 2);
        assert_eq!(hook.tool_input.questions[1].options.len(), 3);
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(parse_hook_data(b"not json").is_err());
        assert!(parse_hook_data(b"").is_err());
    }

    // ---- permission decision output ----

    #[test]
    fn permission_decision_shape() {
        let out = permission_decision_json("allow", "Approved via OTP");
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        let inner = &value["hookSpecificOutput"];
        assert_eq!(inner["hookEventName"], "PreToolUse");
        assert_eq!(inner["permissionDecision"], "allow");
        assert_eq!(inner["permissionDecisionReason"], "Approved via OTP");
    }

    #[test]
    fn callback_payload_encoding() {
        assert_eq!(callback_payload("web", 0, 2, 1), "web:0:2:1");
        // A capped session name always fits Telegram's 64-byte limit.
        let long = "s".repeat(crate::session::MAX_SESSION_NAME_LEN);
        assert!(callback_payload(&long, 9, 10, 9).len() <= 64);
    }

    // ---- streaming supersession + idempotence (stop-hook flush) ----

    #[test]
    #[serial]
    fn queue_unsent_texts_supersedes_and_dedups() {
        with_cache_dir(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(&dir);
            let transcript = dir.path().join("t.jsonl");
            std::fs::write(
                &transcript,
                concat!(
                    r#"{"type":"assistant","requestId":"req_7","message":{"role":"assistant","content":[{"type":"text","text":"partial..."}]}}"#,
                    "\n",
                    r#"{"type":"assistant","requestId":"req_7","message":{"role":"assistant","content":[{"type":"text","text":"complete with more detail"}]}}"#,
                ),
            )
            .unwrap();

            let sent = queue_unsent_texts(&db, "sess", transcript.to_str().unwrap());
            assert_eq!(sent, 1);
            let pending = db.find_pending("sess");
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].text, "complete with more detail");
            let expected_id =
                format!("reply:req_7:{}", content_hash("complete with more detail"));
            assert_eq!(pending[0].id, expected_id);

            // Running the flush again appends nothing new.
            let sent = queue_unsent_texts(&db, "sess", transcript.to_str().unwrap());
            assert_eq!(sent, 0);
            assert_eq!(db.find_pending("sess").len(), 1);
        });
    }

    #[test]
    #[serial]
    fn queue_unsent_skips_rows_already_delivered() {
        with_cache_dir(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(&dir);
            let transcript = dir.path().join("t.jsonl");
            std::fs::write(
                &transcript,
                r#"{"type":"assistant","requestId":"req_1","message":{"role":"assistant","content":[{"type":"text","text":"answer"}]}}"#,
            )
            .unwrap();

            queue_unsent_texts(&db, "sess", transcript.to_str().unwrap());
            let id = format!("reply:req_1:{}", content_hash("answer"));
            db.mark_delivered(&id, 42).unwrap();

            assert_eq!(queue_unsent_texts(&db, "sess", transcript.to_str().unwrap()), 0);
        });
    }

    // ---- loopback (§8 round-trip) ----

    #[test]
    #[serial]
    fn chat_originated_prompt_is_absorbed() {
        with_cache_dir(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(&dir);

            // The poller recorded the chat prompt as already delivered.
            db.append_message(&MessageRecord {
                id: "tg:99".into(),
                session: "web".into(),
                kind: "user_prompt".into(),
                text: "fix the auth bug".into(),
                origin: "telegram".into(),
                tg_delivered: true,
                ..Default::default()
            })
            .unwrap();

            let hook = HookData {
                session_id: "claude-1".into(),
                prompt: "fix the auth bug".into(),
                ..Default::default()
            };
            user_prompt_inner(&db, "web", &hook);

            // No terminal-origin duplicate was inserted.
            assert!(db.find_pending("web").is_empty());
            // The ack and thinking markers were set.
            assert!(crate::markers::prompt_ack_path("web").exists());
            assert_eq!(crate::markers::thinking_state("web"), Some(true));
        });
    }

    #[test]
    #[serial]
    fn terminal_prompt_is_echoed() {
        with_cache_dir(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(&dir);

            let hook = HookData {
                session_id: "claude-1".into(),
                prompt: "local work".into(),
                ..Default::default()
            };
            user_prompt_inner(&db, "web", &hook);

            let pending = db.find_pending("web");
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].kind, "user_prompt");
            assert_eq!(pending[0].origin, "terminal");
            assert_eq!(pending[0].text, "local work");
        });
    }

    #[test]
    #[serial]
    fn user_prompt_clears_previous_tool_state() {
        with_cache_dir(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(&dir);
            db.save_tool_state(
                "web",
                &crate::db::ToolState { msg_id: 5, tools: vec![ToolEntry::default()] },
            );
            let hook = HookData { prompt: "new turn".into(), ..Default::default() };
            user_prompt_inner(&db, "web", &hook);
            assert_eq!(db.load_tool_state("web").msg_id, 0);
        });
    }

    // ---- compact / notification ----

    #[test]
    #[serial]
    fn compact_messages_for_both_phases() {
        with_cache_dir(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(&dir);

            let hook = HookData {
                hook_event_name: "PreCompact".into(),
                trigger: "manual".into(),
                session_id: "c1".into(),
                ..Default::default()
            };
            compact_inner(&db, "web", &hook);

            let hook = HookData {
                hook_event_name: "SessionStart".into(),
                session_id: "c1".into(),
                ..Default::default()
            };
            compact_inner(&db, "web", &hook);

            let pending = db.find_pending("web");
            assert_eq!(pending.len(), 2);
            assert_eq!(pending[0].text, "☕️ Compacting conversation (manual). Have a cup of coffee.");
            assert_eq!(pending[1].text, "☕️ Context compacted");
            assert!(pending.iter().all(|m| m.kind == "notification"));
        });
    }

    #[test]
    #[serial]
    fn idle_notification_clears_thinking_without_row() {
        with_cache_dir(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(&dir);
            crate::markers::set_thinking("web");

            let hook = HookData { notification_type: "idle_prompt".into(), ..Default::default() };
            assert!(!notification_inner(&db, "web", &hook));
            assert_eq!(crate::markers::thinking_state("web"), None);
            assert!(db.find_pending("web").is_empty());
        });
    }

    #[test]
    #[serial]
    fn notification_prefers_message_then_title_then_type() {
        with_cache_dir(|| {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(&dir);

            let hook = HookData {
                message: "needs attention".into(),
                title: "ignored".into(),
                ..Default::default()
            };
            assert!(notification_inner(&db, "web", &hook));
            let hook = HookData { title: "just a title".into(), ..Default::default() };
            assert!(notification_inner(&db, "web", &hook));
            let hook = HookData::default();
            assert!(!notification_inner(&db, "web", &hook));

            let texts: Vec<String> =
                db.find_pending("web").into_iter().map(|m| m.text).collect();
            assert_eq!(texts, vec!["🔔 needs attention", "🔔 just a title"]);
        });
    }
}

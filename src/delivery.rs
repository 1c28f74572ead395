//! Delivery loop: drains pending messages per session, in insertion order,
//! into the chat API.
//!
//! Wakes on a 2-second tick or on SIGUSR1 from a hook process; signals are
//! coalesced through a capacity-1 channel (a wake that arrives while one is
//! already pending is dropped). Within a session, a failing row blocks the
//! rows behind it so FIFO order survives partial failures; across sessions
//! there is no ordering.
//!
//! Retry policy, in order, after incrementing the retry count:
//! - permanent API error (fixed substring allowlist): drop the row
//!   (delivered, external id 0), tell the user once, move on;
//! - retry count reached the cap: same, with a different notice;
//! - second failure and beyond: warn the user, stop this session's drain;
//! - first failure: silently stop this session's drain.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::time::Duration;

use crate::config::Config;
use crate::db::{Db, MAX_RETRIES};
use crate::format::markdown_to_html;
use crate::log::listen_log;
use crate::telegram::Api;

/// Fallback tick between wake signals.
const DELIVERY_TICK: Duration = Duration::from_secs(2);

/// Error substrings that will never succeed on retry.
const PERMANENT_ERRORS: &[&str] = &[
    "chat not found",
    "bot was blocked",
    "bot was kicked",
    "chat_id is empty",
    "not enough rights",
    "PEER_ID_INVALID",
];

pub fn is_permanent_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    PERMANENT_ERRORS.iter().any(|p| lower.contains(&p.to_lowercase()))
}

/// The one seam the delivery loop needs from the chat API. Lets the drain
/// logic run against a recording stub in tests.
pub trait ChatSink {
    /// Send an HTML message, returning the external message id.
    fn send_html(&self, chat_id: i64, thread_id: i64, html: &str) -> anyhow::Result<i64>;
    /// Best-effort plain notice (failures are ignored).
    fn notify(&self, chat_id: i64, thread_id: i64, text: &str);
}

impl ChatSink for Api {
    fn send_html(&self, chat_id: i64, thread_id: i64, html: &str) -> anyhow::Result<i64> {
        self.send_message_html_get_id(chat_id, thread_id, html)
    }

    fn notify(&self, chat_id: i64, thread_id: i64, text: &str) {
        let _ = self.send_message(chat_id, thread_id, text);
    }
}

/// Drain one session's pending rows in order. Returns the number delivered.
pub fn drain_session(
    db: &Db,
    sink: &dyn ChatSink,
    group_id: i64,
    topic_id: i64,
    session: &str,
) -> usize {
    let mut delivered = 0;
    for msg in db.find_pending(session) {
        let html = match msg.kind.as_str() {
            "user_prompt" => format!("💬 {}", markdown_to_html(&msg.text)),
            "assistant_text" => format!("<b>{}:</b>\n{}", session, markdown_to_html(&msg.text)),
            "notification" => markdown_to_html(&msg.text),
            _ => {
                // tool_call rows are live-updated via tool_state; nothing to send.
                let _ = db.mark_delivered(&msg.id, 0);
                continue;
            }
        };

        match sink.send_html(group_id, topic_id, &html) {
            Ok(tg_msg_id) => {
                let _ = db.mark_delivered(&msg.id, tg_msg_id);
                db.log_event(session, "send_ok", "listener", &msg.id, &format!("tg_msg_id={}", tg_msg_id));
                delivered += 1;
            }
            Err(err) => {
                let err_msg = err.to_string();
                db.inc_retry(&msg.id);
                let retry = msg.retry_count + 1;
                db.log_event(
                    session,
                    "send_failed",
                    "listener",
                    &msg.id,
                    &format!("retry={} err={}", retry, err_msg),
                );
                listen_log(&format!(
                    "deliveryLoop: send failed ({}/{}) for {}: {}",
                    retry, MAX_RETRIES, msg.id, err_msg
                ));

                if is_permanent_error(&err_msg) {
                    let _ = db.mark_delivered(&msg.id, 0);
                    sink.notify(
                        group_id,
                        topic_id,
                        &format!("❌ Message dropped (permanent error): {}", err_msg),
                    );
                    continue;
                }
                if retry >= MAX_RETRIES {
                    let _ = db.mark_delivered(&msg.id, 0);
                    sink.notify(
                        group_id,
                        topic_id,
                        &format!("❌ Message dropped after {} retries: {}", retry, err_msg),
                    );
                    continue;
                }
                if retry >= 2 {
                    sink.notify(
                        group_id,
                        topic_id,
                        &format!("⚠️ Send failed ({}/{}): {}", retry, MAX_RETRIES, err_msg),
                    );
                }
                // Stop this session's drain; later rows wait their turn.
                break;
            }
        }
    }
    delivered
}

/// One delivery cycle across every session with pending rows.
pub fn run_cycle(db: &Db, sink: &dyn ChatSink, config: &Config) {
    if config.group_id == 0 {
        return;
    }
    for session in db.all_sessions() {
        let Some(info) = config.sessions.get(&session) else {
            continue;
        };
        if info.topic_id == 0 {
            continue;
        }
        drain_session(db, sink, config.group_id, info.topic_id, &session);
    }
}

/// Install the SIGUSR1 bridge: a dedicated thread forwards each signal into
/// a capacity-1 channel, dropping wakes that arrive while one is pending.
pub fn spawn_signal_bridge() -> Receiver<()> {
    let (tx, rx): (SyncSender<()>, Receiver<()>) = sync_channel(1);
    std::thread::spawn(move || {
        let mut signals = match signal_hook::iterator::Signals::new([signal_hook::consts::SIGUSR1]) {
            Ok(s) => s,
            Err(err) => {
                listen_log(&format!("failed to install SIGUSR1 handler: {}", err));
                return;
            }
        };
        for _ in signals.forever() {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => break,
            }
        }
    });
    rx
}

/// Long-running delivery loop for the listener process.
pub fn run_delivery_loop(api: &Api) {
    let wake = spawn_signal_bridge();
    let db = match Db::open() {
        Ok(db) => db,
        Err(err) => {
            listen_log(&format!("deliveryLoop: failed to open db: {}", err));
            return;
        }
    };

    loop {
        // Tick or wake; both fall through to a drain cycle. A dead signal
        // bridge degrades to pure 2-second polling.
        match wake.recv_timeout(DELIVERY_TICK) {
            Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(DELIVERY_TICK);
            }
        }

        // Reload the registry to pick up new sessions.
        let Ok(config) = Config::load() else {
            continue;
        };
        run_cycle(&db, api, &config);
    }
}

/// Wake the listener's delivery loop from a hook process: read the pid from
/// the lock file and send SIGUSR1. No-op when no listener is running.
pub fn notify_listener() {
    let Ok(data) = std::fs::read_to_string(crate::paths::lock_path()) else {
        return;
    };
    let Ok(pid) = data.trim().parse::<i32>() else {
        return;
    };
    if pid <= 0 {
        return;
    }
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGUSR1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MessageRecord;
    use std::cell::{Cell, RefCell};

    /// Recording sink: fails the first `fail_count` sends with `error`.
    struct StubSink {
        sends: RefCell<Vec<String>>,
        notices: RefCell<Vec<String>>,
        fail_count: Cell<usize>,
        error: String,
        next_id: Cell<i64>,
    }

    impl StubSink {
        fn new(fail_count: usize, error: &str) -> StubSink {
            StubSink {
                sends: RefCell::new(vec![]),
                notices: RefCell::new(vec![]),
                fail_count: Cell::new(fail_count),
                error: error.into(),
                next_id: Cell::new(100),
            }
        }
    }

    impl ChatSink for StubSink {
        fn send_html(&self, _chat_id: i64, _thread_id: i64, html: &str) -> anyhow::Result<i64> {
            if self.fail_count.get() > 0 {
                self.fail_count.set(self.fail_count.get() - 1);
                anyhow::bail!("{}", self.error);
            }
            self.sends.borrow_mut().push(html.to_string());
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            Ok(id)
        }

        fn notify(&self, _chat_id: i64, _thread_id: i64, text: &str) {
            self.notices.borrow_mut().push(text.to_string());
        }
    }

    fn test_db() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_at(&dir.path().join("test.db")).unwrap();
        (db, dir)
    }

    fn insert(db: &Db, id: &str, session: &str, kind: &str, text: &str, ts: i64) {
        db.append_message(&MessageRecord {
            id: id.into(),
            session: session.into(),
            kind: kind.into(),
            text: text.into(),
            origin: "terminal".into(),
            timestamp: ts,
            ..Default::default()
        })
        .unwrap();
    }

    fn retry_count(db: &Db, session: &str, id: &str) -> i64 {
        db.find_pending(session)
            .into_iter()
            .find(|m| m.id == id)
            .map(|m| m.retry_count)
            .unwrap_or(-1)
    }

    // ---- §8 scenario: ordered delivery under transient failure ----

    #[test]
    fn ordered_delivery_under_transient_failure() {
        let (db, _dir) = test_db();
        insert(&db, "m1", "a", "user_prompt", "one", 1);
        insert(&db, "m2", "a", "user_prompt", "two", 2);
        insert(&db, "m3", "a", "user_prompt", "three", 3);

        let sink = StubSink::new(1, "connection reset");
        // First cycle: m1 fails once (silent), session drain stops.
        assert_eq!(drain_session(&db, &sink, -1, 7, "a"), 0);
        assert!(sink.sends.borrow().is_empty());
        assert!(sink.notices.borrow().is_empty(), "first failure is silent");
        assert_eq!(retry_count(&db, "a", "m1"), 1);

        // Next cycle: everything goes out, in order.
        assert_eq!(drain_session(&db, &sink, -1, 7, "a"), 3);
        let sends = sink.sends.borrow();
        assert_eq!(sends.len(), 3);
        assert!(sends[0].contains("one"));
        assert!(sends[1].contains("two"));
        assert!(sends[2].contains("three"));
        assert!(db.find_pending("a").is_empty());
    }

    // ---- §8 scenario: permanent failure drops and notifies ----

    #[test]
    fn permanent_failure_drops_and_notifies() {
        let (db, _dir) = test_db();
        insert(&db, "m1", "b", "user_prompt", "doomed", 1);

        let sink = StubSink::new(10, "Bad Request: chat not found");
        drain_session(&db, &sink, -1, 7, "b");

        assert!(db.is_delivered("m1"), "permanent failure marks delivered");
        let notices = sink.notices.borrow();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("❌ Message dropped (permanent error):"));
        assert!(db.find_pending("b").is_empty());
    }

    #[test]
    fn second_failure_warns_and_stops() {
        let (db, _dir) = test_db();
        insert(&db, "m1", "c", "user_prompt", "flaky", 1);
        insert(&db, "m2", "c", "user_prompt", "waiting", 2);

        let sink = StubSink::new(10, "timeout talking to api");
        drain_session(&db, &sink, -1, 7, "c"); // retry 1, silent
        drain_session(&db, &sink, -1, 7, "c"); // retry 2, warn

        let notices = sink.notices.borrow();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("⚠️ Send failed (2/5):"));
        // m2 untouched behind the failing head
        assert_eq!(retry_count(&db, "c", "m2"), 0);
    }

    #[test]
    fn drops_after_max_retries_with_single_notice() {
        let (db, _dir) = test_db();
        insert(&db, "m1", "d", "user_prompt", "persistent", 1);

        let sink = StubSink::new(100, "timeout talking to api");
        for _ in 0..MAX_RETRIES {
            drain_session(&db, &sink, -1, 7, "d");
        }

        assert!(db.is_delivered("m1"));
        let notices = sink.notices.borrow();
        // Warnings at retries 2..4, final drop notice at 5
        assert_eq!(notices.last().unwrap(), "❌ Message dropped after 5 retries: timeout talking to api");
        assert_eq!(
            notices.iter().filter(|n| n.starts_with("❌ Message dropped after")).count(),
            1
        );
        // Nothing left pending; further cycles send nothing
        drain_session(&db, &sink, -1, 7, "d");
        assert!(sink.sends.borrow().is_empty());
    }

    #[test]
    fn tool_calls_are_marked_delivered_without_send() {
        let (db, _dir) = test_db();
        insert(&db, "t1", "e", "tool_call", "Bash: ls", 1);
        insert(&db, "m1", "e", "assistant_text", "done", 2);

        let sink = StubSink::new(0, "");
        assert_eq!(drain_session(&db, &sink, -1, 7, "e"), 1);
        assert!(db.is_delivered("t1"));
        let sends = sink.sends.borrow();
        assert_eq!(sends.len(), 1);
        assert!(sends[0].contains("done"));
    }

    #[test]
    fn templates_per_kind() {
        let (db, _dir) = test_db();
        insert(&db, "p", "sess", "user_prompt", "a **prompt**", 1);
        insert(&db, "t", "sess", "assistant_text", "an answer", 2);
        insert(&db, "n", "sess", "notification", "☕️ notice", 3);

        let sink = StubSink::new(0, "");
        drain_session(&db, &sink, -1, 7, "sess");
        let sends = sink.sends.borrow();
        assert_eq!(sends[0], "💬 a <b>prompt</b>");
        assert_eq!(sends[1], "<b>sess:</b>\nan answer");
        assert_eq!(sends[2], "☕️ notice");
    }

    // ---- classification ----

    #[test]
    fn permanent_error_allowlist() {
        assert!(is_permanent_error("Bad Request: chat not found"));
        assert!(is_permanent_error("Forbidden: bot was blocked by the user"));
        assert!(is_permanent_error("bot was kicked from the supergroup"));
        assert!(is_permanent_error("PEER_ID_INVALID"));
        assert!(is_permanent_error("peer_id_invalid"));
        assert!(!is_permanent_error("connection reset by peer"));
        assert!(!is_permanent_error("Too Many Requests: retry after 5"));
    }
}

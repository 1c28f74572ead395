//! SQLite-backed message log, event timeline, and tool state.
//!
//! The database is shared by the listener and every short-lived hook
//! process. WAL mode plus a 5 s busy timeout lets concurrent writers
//! serialize without corrupting the upgrade semantics:
//! - `tg_delivered` only ever transitions 0→1
//! - `tg_msg_id` is never overwritten back to 0 once set
//!
//! Both invariants are enforced inside a single UPSERT statement so they
//! hold under any interleaving of processes.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

pub const MAX_RETRIES: i64 = 5;

/// Delivery state of a single message.
#[derive(Debug, Clone, Default)]
pub struct MessageRecord {
    pub id: String,
    pub session: String,
    /// user_prompt / assistant_text / tool_call / notification
    pub kind: String,
    pub text: String,
    /// terminal / telegram / claude
    pub origin: String,
    pub tg_delivered: bool,
    pub tg_msg_id: i64,
    pub retry_count: i64,
    pub timestamp: i64,
}

/// Live tool-call display state for one session.
#[derive(Debug, Clone, Default)]
pub struct ToolState {
    pub msg_id: i64,
    pub tools: Vec<ToolEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_text: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub time: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Database handle. Open per call site — connections are cheap and the
/// short-lived hook processes cannot share one anyway.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the standard cache location.
    pub fn open() -> Result<Self> {
        let path = crate::paths::db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open_at(&path)
    }

    /// Open the database at a specific path (for testing).
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        let db = Self { conn };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                session    TEXT NOT NULL,
                type       TEXT NOT NULL,
                source     TEXT NOT NULL,
                ref_id     TEXT,
                detail     TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_session ON events(session);
            CREATE INDEX IF NOT EXISTS idx_events_ref ON events(ref_id);

            CREATE TABLE IF NOT EXISTS messages (
                id           TEXT PRIMARY KEY,
                session      TEXT NOT NULL,
                type         TEXT NOT NULL,
                text         TEXT,
                origin       TEXT,
                tg_delivered INTEGER DEFAULT 0,
                tg_msg_id    INTEGER DEFAULT 0,
                retry_count  INTEGER DEFAULT 0,
                created_at   INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session);
            CREATE INDEX IF NOT EXISTS idx_messages_pending
                ON messages(session, tg_delivered) WHERE tg_delivered = 0;

            CREATE TABLE IF NOT EXISTS tool_state (
                session    TEXT PRIMARY KEY,
                tg_msg_id  INTEGER DEFAULT 0,
                tools_json TEXT DEFAULT '[]'
            );",
        )?;

        self.migrate_legacy_columns()?;

        // retry_count was added after the first schema; ignore "duplicate
        // column" on databases that already have it.
        let _ = self
            .conn
            .execute("ALTER TABLE messages ADD COLUMN retry_count INTEGER DEFAULT 0", []);

        Ok(())
    }

    /// Rename-migrate the legacy `telegram_*` columns. Idempotent: runs only
    /// when the old column is present, and each step tolerates reruns.
    fn migrate_legacy_columns(&self) -> Result<()> {
        let old_messages: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('messages') WHERE name = 'telegram_delivered'",
            [],
            |row| row.get(0),
        )?;
        if old_messages > 0 {
            self.conn.execute_batch(
                "ALTER TABLE messages RENAME TO messages_old;
                 CREATE TABLE messages (
                    id           TEXT PRIMARY KEY,
                    session      TEXT NOT NULL,
                    type         TEXT NOT NULL,
                    text         TEXT,
                    origin       TEXT,
                    tg_delivered INTEGER DEFAULT 0,
                    tg_msg_id    INTEGER DEFAULT 0,
                    retry_count  INTEGER DEFAULT 0,
                    created_at   INTEGER NOT NULL
                 );
                 INSERT INTO messages (id, session, type, text, origin, tg_delivered, tg_msg_id, created_at)
                    SELECT id, session, type, text, origin, telegram_delivered, telegram_msg_id, created_at
                    FROM messages_old;
                 DROP TABLE messages_old;
                 CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session);
                 CREATE INDEX IF NOT EXISTS idx_messages_pending
                    ON messages(session, tg_delivered) WHERE tg_delivered = 0;",
            )?;
        }

        let old_tool_state: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('tool_state') WHERE name = 'telegram_msg_id'",
            [],
            |row| row.get(0),
        )?;
        if old_tool_state > 0 {
            self.conn.execute_batch(
                "ALTER TABLE tool_state RENAME TO tool_state_old;
                 CREATE TABLE tool_state (
                    session    TEXT PRIMARY KEY,
                    tg_msg_id  INTEGER DEFAULT 0,
                    tools_json TEXT DEFAULT '[]'
                 );
                 INSERT INTO tool_state (session, tg_msg_id, tools_json)
                    SELECT session, telegram_msg_id, tools_json FROM tool_state_old;
                 DROP TABLE tool_state_old;",
            )?;
        }

        Ok(())
    }

    // --- Messages ---

    /// Insert a message record. On id conflict, delivery is only upgraded
    /// (0→1), never downgraded, and a non-zero tg_msg_id is never zeroed.
    /// Text/kind/origin keep the originally inserted values.
    pub fn append_message(&self, rec: &MessageRecord) -> Result<()> {
        let ts = if rec.timestamp == 0 { now_millis() } else { rec.timestamp };
        self.conn.execute(
            "INSERT INTO messages (id, session, type, text, origin, tg_delivered, tg_msg_id, retry_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
             ON CONFLICT(id) DO UPDATE SET
               tg_delivered = MAX(tg_delivered, excluded.tg_delivered),
               tg_msg_id = CASE WHEN excluded.tg_msg_id > 0 THEN excluded.tg_msg_id ELSE tg_msg_id END",
            params![
                rec.id,
                rec.session,
                rec.kind,
                rec.text,
                rec.origin,
                rec.tg_delivered as i64,
                rec.tg_msg_id,
                ts,
            ],
        )?;
        Ok(())
    }

    /// Mark a message delivered with the Telegram message id (0 = dropped).
    pub fn mark_delivered(&self, msg_id: &str, tg_msg_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE messages SET tg_delivered = 1, tg_msg_id = ?1 WHERE id = ?2",
            params![tg_msg_id, msg_id],
        )?;
        Ok(())
    }

    pub fn is_delivered(&self, msg_id: &str) -> bool {
        self.conn
            .query_row(
                "SELECT tg_delivered FROM messages WHERE id = ?1",
                params![msg_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v != 0)
            .unwrap_or(false)
    }

    pub fn inc_retry(&self, msg_id: &str) {
        let _ = self.conn.execute(
            "UPDATE messages SET retry_count = retry_count + 1 WHERE id = ?1",
            params![msg_id],
        );
    }

    /// Undelivered messages for a session, oldest first. Rows that exhausted
    /// their retries are excluded — the drop notice was already sent.
    pub fn find_pending(&self, session: &str) -> Vec<MessageRecord> {
        let mut stmt = match self.conn.prepare(
            "SELECT id, session, type, text, origin, tg_delivered, tg_msg_id, retry_count, created_at
             FROM messages WHERE session = ?1 AND tg_delivered = 0 AND retry_count < ?2
             ORDER BY created_at, rowid",
        ) {
            Ok(s) => s,
            Err(_) => return vec![],
        };
        let rows = stmt.query_map(params![session, MAX_RETRIES], |row| {
            Ok(MessageRecord {
                id: row.get(0)?,
                session: row.get(1)?,
                kind: row.get(2)?,
                text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                origin: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                tg_delivered: row.get::<_, i64>(5)? != 0,
                tg_msg_id: row.get(6)?,
                retry_count: row.get(7)?,
                timestamp: row.get(8)?,
            })
        });
        match rows {
            Ok(iter) => iter.flatten().collect(),
            Err(_) => vec![],
        }
    }

    /// Distinct session names that have undelivered messages.
    pub fn all_sessions(&self) -> Vec<String> {
        let mut stmt = match self
            .conn
            .prepare("SELECT DISTINCT session FROM messages WHERE tg_delivered = 0")
        {
            Ok(s) => s,
            Err(_) => return vec![],
        };
        let result = match stmt.query_map([], |row| row.get::<_, String>(0)) {
            Ok(iter) => iter.flatten().collect(),
            Err(_) => vec![],
        };
        result
    }

    /// Loopback check: does this exact prompt exist as a Telegram-origin
    /// user prompt for the session? Used by the user-prompt hook to avoid
    /// re-echoing chat input back to chat.
    pub fn is_from_telegram(&self, session: &str, prompt: &str) -> bool {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE session = ?1 AND origin = 'telegram' AND type = 'user_prompt' AND text = ?2",
                params![session, prompt],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .unwrap_or(false)
    }

    // --- Events (append-only timeline) ---

    pub fn log_event(&self, session: &str, event_type: &str, source: &str, ref_id: &str, detail: &str) {
        let _ = self.conn.execute(
            "INSERT INTO events (session, type, source, ref_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session, event_type, source, ref_id, detail, now_millis()],
        );
    }

    // --- Tool state ---

    pub fn load_tool_state(&self, session: &str) -> ToolState {
        let row = self.conn.query_row(
            "SELECT tg_msg_id, tools_json FROM tool_state WHERE session = ?1",
            params![session],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        );
        match row {
            Ok((msg_id, tools_json)) => {
                let tools = serde_json::from_str(&tools_json).unwrap_or_default();
                ToolState { msg_id, tools }
            }
            Err(_) => ToolState::default(),
        }
    }

    pub fn save_tool_state(&self, session: &str, state: &ToolState) {
        let tools_json = serde_json::to_string(&state.tools).unwrap_or_else(|_| "[]".into());
        let _ = self.conn.execute(
            "INSERT OR REPLACE INTO tool_state (session, tg_msg_id, tools_json) VALUES (?1, ?2, ?3)",
            params![session, state.msg_id, tools_json],
        );
    }

    pub fn clear_tool_state(&self, session: &str) {
        let _ = self
            .conn
            .execute("DELETE FROM tool_state WHERE session = ?1", params![session]);
    }
}

/// Milliseconds since the epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Nanoseconds since the epoch, for unique message ids.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_else(|| now_millis() * 1_000_000)
}

/// Short hash of content for dedup ids (first 4 bytes of sha256, hex).
pub fn content_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_at(&dir.path().join("test.db")).unwrap();
        (db, dir)
    }

    fn rec(id: &str, session: &str, kind: &str, text: &str) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            session: session.into(),
            kind: kind.into(),
            text: text.into(),
            origin: "claude".into(),
            ..Default::default()
        }
    }

    // ---- upgrade semantics ----

    #[test]
    fn append_and_query() {
        let (db, _dir) = test_db();
        let mut first = rec("test:1", "s", "user_prompt", "hello world");
        first.origin = "telegram".into();
        first.tg_delivered = true;
        db.append_message(&first).unwrap();
        assert!(db.is_delivered("test:1"));

        // Conflict must not downgrade delivery
        let mut again = rec("test:1", "s", "user_prompt", "different text");
        again.origin = "telegram".into();
        db.append_message(&again).unwrap();
        assert!(db.is_delivered("test:1"), "delivery was downgraded");

        db.append_message(&rec("test:2", "s", "assistant_text", "response")).unwrap();
        let pending = db.find_pending("s");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "test:2");

        db.mark_delivered("test:2", 12345).unwrap();
        assert!(db.is_delivered("test:2"));
        assert!(db.find_pending("s").is_empty());

        assert!(db.is_from_telegram("s", "hello world"));
        assert!(!db.is_from_telegram("s", "nonexistent"));

        db.log_event("s", "test_event", "test", "test:1", "detail");
    }

    #[test]
    fn conflict_never_zeroes_msg_id() {
        let (db, _dir) = test_db();
        db.mark_delivered("x", 0).unwrap(); // no row yet, no-op
        let mut delivered = rec("x", "s", "user_prompt", "t");
        delivered.tg_delivered = true;
        delivered.tg_msg_id = 777;
        db.append_message(&delivered).unwrap();

        // Re-append with msg id 0: must keep 777
        db.append_message(&rec("x", "s", "user_prompt", "t")).unwrap();
        let id: i64 = db
            .conn
            .query_row("SELECT tg_msg_id FROM messages WHERE id = 'x'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(id, 777);
    }

    #[test]
    fn conflict_keeps_original_text() {
        let (db, _dir) = test_db();
        db.append_message(&rec("y", "s", "user_prompt", "original")).unwrap();
        db.append_message(&rec("y", "s", "notification", "replacement")).unwrap();
        let (kind, text): (String, String) = db
            .conn
            .query_row("SELECT type, text FROM messages WHERE id = 'y'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(kind, "user_prompt");
        assert_eq!(text, "original");
    }

    // ---- pending scan ----

    #[test]
    fn find_pending_orders_by_created_at() {
        let (db, _dir) = test_db();
        for (id, ts) in [("m3", 3000), ("m1", 1000), ("m2", 2000)] {
            let mut r = rec(id, "s", "user_prompt", id);
            r.timestamp = ts;
            db.append_message(&r).unwrap();
        }
        let ids: Vec<String> = db.find_pending("s").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn find_pending_excludes_exhausted_retries() {
        let (db, _dir) = test_db();
        db.append_message(&rec("m", "s", "user_prompt", "t")).unwrap();
        for _ in 0..MAX_RETRIES {
            db.inc_retry("m");
        }
        assert!(db.find_pending("s").is_empty());
        assert!(!db.is_delivered("m"));
    }

    #[test]
    fn all_sessions_lists_distinct_pending() {
        let (db, _dir) = test_db();
        assert!(db.all_sessions().is_empty());
        db.append_message(&rec("a1", "sess-a", "assistant_text", "hi")).unwrap();
        db.append_message(&rec("b1", "sess-b", "notification", "yo")).unwrap();
        db.append_message(&rec("a2", "sess-a", "assistant_text", "again")).unwrap();
        let mut sessions = db.all_sessions();
        sessions.sort();
        assert_eq!(sessions, vec!["sess-a", "sess-b"]);
    }

    // ---- tool state ----

    #[test]
    fn tool_state_round_trip_and_clear() {
        let (db, _dir) = test_db();
        assert_eq!(db.load_tool_state("s").msg_id, 0);

        let state = ToolState {
            msg_id: 42,
            tools: vec![
                ToolEntry { name: "Bash".into(), input: "ls -la".into(), ..Default::default() },
                ToolEntry { input: "thinking aloud".into(), is_text: true, ..Default::default() },
            ],
        };
        db.save_tool_state("s", &state);
        let loaded = db.load_tool_state("s");
        assert_eq!(loaded.msg_id, 42);
        assert_eq!(loaded.tools.len(), 2);
        assert_eq!(loaded.tools[0].name, "Bash");
        assert!(loaded.tools[1].is_text);

        db.clear_tool_state("s");
        assert_eq!(db.load_tool_state("s").msg_id, 0);
        assert!(db.load_tool_state("s").tools.is_empty());
    }

    // ---- migration ----

    #[test]
    fn migrates_legacy_telegram_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE messages (
                    id TEXT PRIMARY KEY, session TEXT NOT NULL, type TEXT NOT NULL,
                    text TEXT, origin TEXT,
                    telegram_delivered INTEGER DEFAULT 0,
                    telegram_msg_id INTEGER DEFAULT 0,
                    created_at INTEGER NOT NULL
                 );
                 INSERT INTO messages VALUES ('old:1', 's', 'user_prompt', 'kept', 'telegram', 1, 55, 123);",
            )
            .unwrap();
        }
        let db = Db::open_at(&path).unwrap();
        assert!(db.is_delivered("old:1"));
        // Reopening is idempotent
        drop(db);
        let db = Db::open_at(&path).unwrap();
        assert!(db.is_delivered("old:1"));
    }

    // ---- hashing ----

    #[test]
    fn content_hash_is_stable_and_short() {
        let h1 = content_hash("hello world");
        let h2 = content_hash("hello world");
        let h3 = content_hash("different text");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 8);
    }
}

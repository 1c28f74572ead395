//! Telegram Bot API client.
//!
//! A small blocking client over the handful of methods the bridge needs:
//! sending/editing messages, typing actions, long-polling updates, file
//! download/upload, and forum-topic management. All outbound bodies are
//! clamped to the 4000-char limit with a visible truncation sentinel.
//!
//! API errors carry the server's `description` text so the delivery loop
//! can classify permanent failures by substring.

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

use crate::format::clamp_message;

/// Long-poll duration requested from Telegram, in seconds.
pub const POLL_TIMEOUT_SECS: u64 = 30;
/// Client-side timeout; must exceed the long poll.
const HTTP_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    description: String,
    result: Option<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: i64,
    #[serde(default)]
    pub message_thread_id: i64,
    #[serde(default)]
    pub chat: Chat,
    #[serde(default)]
    pub from: User,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub caption: String,
    pub voice: Option<Voice>,
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
    pub document: Option<Document>,
    pub reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Chat {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type", default)]
    pub chat_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub from: User,
    #[serde(default)]
    pub data: String,
    pub message: Option<Box<Message>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicResult {
    #[serde(default)]
    pub message_thread_id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Deserialize)]
struct FileResult {
    file_path: Option<String>,
}

pub struct Api {
    token: String,
    client: reqwest::blocking::Client,
}

impl Api {
    pub fn new(token: &str) -> Api {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Api { token: token.to_string(), client }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    /// POST a method with a JSON body and decode the typed result.
    /// API-level failures surface the server description in the error.
    fn call<T: DeserializeOwned>(&self, method: &str, body: &serde_json::Value) -> Result<T> {
        let resp = self
            .client
            .post(self.url(method))
            .json(body)
            .send()
            .with_context(|| format!("{} request failed", method))?;
        let parsed: ApiResponse<T> = resp
            .json()
            .with_context(|| format!("{} response was not valid JSON", method))?;
        if !parsed.ok {
            bail!("{}: {}", method, parsed.description);
        }
        parsed
            .result
            .ok_or_else(|| anyhow!("{}: missing result", method))
    }

    /// Long-poll for updates starting at `offset`.
    pub fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({ "offset": offset, "timeout": POLL_TIMEOUT_SECS }),
        )
    }

    /// Send a plain-text message (no parse mode). Errors are returned but
    /// callers generally treat these sends as best-effort.
    pub fn send_message(&self, chat_id: i64, thread_id: i64, text: &str) -> Result<()> {
        let mut body = json!({ "chat_id": chat_id, "text": clamp_message(text) });
        if thread_id > 0 {
            body["message_thread_id"] = json!(thread_id);
        }
        let _: Message = self.call("sendMessage", &body)?;
        Ok(())
    }

    /// Send an HTML-formatted message and return its message id.
    pub fn send_message_html_get_id(&self, chat_id: i64, thread_id: i64, html: &str) -> Result<i64> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": clamp_message(html),
            "parse_mode": "HTML",
        });
        if thread_id > 0 {
            body["message_thread_id"] = json!(thread_id);
        }
        let msg: Message = self.call("sendMessage", &body)?;
        Ok(msg.message_id)
    }

    /// Send a message with an inline keyboard (one button per row).
    pub fn send_message_with_keyboard(
        &self,
        chat_id: i64,
        thread_id: i64,
        text: &str,
        buttons: &[Vec<InlineKeyboardButton>],
    ) -> Result<i64> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": clamp_message(text),
            "reply_markup": { "inline_keyboard": buttons },
        });
        if thread_id > 0 {
            body["message_thread_id"] = json!(thread_id);
        }
        let msg: Message = self.call("sendMessage", &body)?;
        Ok(msg.message_id)
    }

    /// Replace an existing message's HTML body.
    pub fn edit_message_html(&self, chat_id: i64, message_id: i64, html: &str) -> Result<()> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": clamp_message(html),
            "parse_mode": "HTML",
        });
        let _: serde_json::Value = self.call("editMessageText", &body)?;
        Ok(())
    }

    /// Replace a message's text and strip its inline keyboard.
    pub fn edit_message_remove_keyboard(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<()> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": clamp_message(text),
            "reply_markup": { "inline_keyboard": [] },
        });
        let _: serde_json::Value = self.call("editMessageText", &body)?;
        Ok(())
    }

    pub fn answer_callback_query(&self, callback_id: &str) {
        let _ = self.call::<serde_json::Value>(
            "answerCallbackQuery",
            &json!({ "callback_query_id": callback_id }),
        );
    }

    pub fn send_typing(&self, chat_id: i64, thread_id: i64) {
        let mut body = json!({ "chat_id": chat_id, "action": "typing" });
        if thread_id > 0 {
            body["message_thread_id"] = json!(thread_id);
        }
        let _ = self.call::<serde_json::Value>("sendChatAction", &body);
    }

    /// Download a file by id into `dest`.
    pub fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
        let file: FileResult = self.call("getFile", &json!({ "file_id": file_id }))?;
        let file_path = file.file_path.ok_or_else(|| anyhow!("getFile: no file_path"))?;
        let url = format!("https://api.telegram.org/file/bot{}/{}", self.token, file_path);
        let bytes = self
            .client
            .get(url)
            .send()
            .context("file download failed")?
            .bytes()
            .context("file download read failed")?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &bytes)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        Ok(())
    }

    /// Upload a local file as a document to a thread.
    pub fn send_document(&self, chat_id: i64, thread_id: i64, path: &Path) -> Result<()> {
        let mut form = reqwest::blocking::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .file("document", path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if thread_id > 0 {
            form = form.text("message_thread_id", thread_id.to_string());
        }
        let resp = self
            .client
            .post(self.url("sendDocument"))
            .multipart(form)
            .send()
            .context("sendDocument request failed")?;
        let parsed: ApiResponse<Message> =
            resp.json().context("sendDocument response was not valid JSON")?;
        if !parsed.ok {
            bail!("sendDocument: {}", parsed.description);
        }
        Ok(())
    }

    /// Create a forum topic under the group; returns the new thread id.
    pub fn create_forum_topic(&self, group_id: i64, name: &str) -> Result<i64> {
        let topic: TopicResult =
            self.call("createForumTopic", &json!({ "chat_id": group_id, "name": name }))?;
        Ok(topic.message_thread_id)
    }

    pub fn delete_forum_topic(&self, group_id: i64, topic_id: i64) -> Result<()> {
        let _: serde_json::Value = self.call(
            "deleteForumTopic",
            &json!({ "chat_id": group_id, "message_thread_id": topic_id }),
        )?;
        Ok(())
    }

    /// Register the slash-command menu with Telegram.
    pub fn set_bot_commands(&self) {
        let commands = json!([
            { "command": "new", "description": "Create or restart a session" },
            { "command": "continue", "description": "Restart keeping conversation history" },
            { "command": "delete", "description": "Delete this session and topic" },
            { "command": "cleanup", "description": "Delete all sessions and topics" },
            { "command": "c", "description": "Run a shell command" },
            { "command": "stats", "description": "Host statistics" },
            { "command": "version", "description": "Show bridge version" },
            { "command": "update", "description": "Update the bridge binary" },
            { "command": "restart", "description": "Restart the listener" },
            { "command": "auth", "description": "Re-authenticate Claude" },
        ]);
        let _ = self.call::<serde_json::Value>("setMyCommands", &json!({ "commands": commands }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_json() {
        let json_str = r#"{
            "message_id": 123,
            "message_thread_id": 456,
            "chat": {"id": 789, "type": "supergroup"},
            "from": {"id": 111, "username": "testuser"},
            "text": "Hello world"
        }"#;
        let msg: Message = serde_json::from_str(json_str).unwrap();
        assert_eq!(msg.message_id, 123);
        assert_eq!(msg.message_thread_id, 456);
        assert_eq!(msg.chat.id, 789);
        assert_eq!(msg.chat.chat_type, "supergroup");
        assert_eq!(msg.from.username, "testuser");
        assert_eq!(msg.text, "Hello world");
    }

    #[test]
    fn parses_reply_to_message() {
        let json_str = r#"{
            "message_id": 100,
            "text": "Reply text",
            "chat": {"id": 123, "type": "private"},
            "from": {"id": 456, "username": "user"},
            "reply_to_message": {
                "message_id": 99,
                "text": "Original text",
                "chat": {"id": 123, "type": "private"},
                "from": {"id": 456, "username": "user"}
            }
        }"#;
        let msg: Message = serde_json::from_str(json_str).unwrap();
        let reply = msg.reply_to_message.expect("reply_to_message parsed");
        assert_eq!(reply.message_id, 99);
        assert_eq!(reply.text, "Original text");
    }

    #[test]
    fn parses_topic_result() {
        let topic: TopicResult =
            serde_json::from_str(r#"{"message_thread_id": 12345, "name": "test-topic"}"#).unwrap();
        assert_eq!(topic.message_thread_id, 12345);
        assert_eq!(topic.name, "test-topic");
    }

    #[test]
    fn parses_api_response_ok_and_error() {
        let ok: ApiResponse<serde_json::Value> =
            serde_json::from_str(r#"{"ok": true, "result": {}}"#).unwrap();
        assert!(ok.ok);

        let err: ApiResponse<serde_json::Value> =
            serde_json::from_str(r#"{"ok": false, "description": "Bad Request"}"#).unwrap();
        assert!(!err.ok);
        assert_eq!(err.description, "Bad Request");
    }

    #[test]
    fn parses_update_with_callback() {
        let json_str = r#"{
            "update_id": 7,
            "callback_query": {
                "id": "cb1",
                "from": {"id": 1, "username": "u"},
                "data": "sess:0:2:1",
                "message": {"message_id": 5, "chat": {"id": 9, "type": "supergroup"}, "text": "q"}
            }
        }"#;
        let update: Update = serde_json::from_str(json_str).unwrap();
        let cb = update.callback_query.unwrap();
        assert_eq!(cb.data, "sess:0:2:1");
        assert_eq!(cb.message.unwrap().message_id, 5);
    }

    #[test]
    fn parses_media_fields() {
        let json_str = r#"{
            "message_id": 1,
            "chat": {"id": 2, "type": "supergroup"},
            "from": {"id": 3},
            "photo": [{"file_id": "small"}, {"file_id": "large"}],
            "document": {"file_id": "doc1", "file_name": "report.pdf"},
            "voice": {"file_id": "v1"}
        }"#;
        let msg: Message = serde_json::from_str(json_str).unwrap();
        assert_eq!(msg.photo.last().unwrap().file_id, "large");
        assert_eq!(msg.document.unwrap().file_name, "report.pdf");
        assert_eq!(msg.voice.unwrap().file_id, "v1");
    }
}

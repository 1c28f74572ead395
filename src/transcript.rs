//! Transcript tailer — extracts new assistant text blocks from the
//! assistant's append-only JSONL transcript.
//!
//! Reads only the last 512 KiB: transcripts grow past tens of megabytes in
//! long sessions, and everything older has been delivered long ago. Lines
//! sharing a requestId are streaming updates of the same response; only the
//! last one counts.
//!
//! This module is pure — dedup against the message log happens at the call
//! site via ids of the form `reply:{requestId}:{hash}`.

use serde::Deserialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// How far back to scan in the transcript file.
const TAIL_BYTES: u64 = 512 * 1024;

/// One extracted text block, paired with its requestId for dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantTextBlock {
    pub request_id: String,
    pub text: String,
}

#[derive(Deserialize)]
struct TranscriptLine {
    #[serde(rename = "type", default)]
    line_type: String,
    #[serde(rename = "requestId", default)]
    request_id: String,
    #[serde(rename = "isApiErrorMessage", default)]
    is_api_error_message: bool,
    #[serde(default)]
    message: TranscriptMessage,
}

#[derive(Deserialize, Default)]
struct TranscriptMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: String,
}

/// Read the last `tail_count` assistant entries from the transcript and
/// return their text blocks in order. Missing files, partial lines, and
/// malformed JSON all degrade to an empty result — never an error.
pub fn extract_recent_assistant_texts(
    transcript_path: &str,
    tail_count: usize,
) -> Vec<AssistantTextBlock> {
    if transcript_path.is_empty() {
        return vec![];
    }
    let path = Path::new(transcript_path);
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return vec![],
    };
    let size = match file.metadata() {
        Ok(m) => m.len(),
        Err(_) => return vec![],
    };

    let offset = size.saturating_sub(TAIL_BYTES);
    if offset > 0 && file.seek(SeekFrom::Start(offset)).is_err() {
        return vec![];
    }
    let mut tail = Vec::new();
    if file.read_to_end(&mut tail).is_err() {
        return vec![];
    }
    // If we seeked into the middle of a line, drop the first partial line.
    if offset > 0 {
        if let Some(idx) = tail.iter().position(|&b| b == b'\n') {
            tail.drain(..=idx);
        }
    }

    let mut entries: Vec<(String, serde_json::Value)> = Vec::new();
    for line in tail.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let parsed: TranscriptLine = match serde_json::from_slice(line) {
            Ok(l) => l,
            Err(_) => continue,
        };
        if parsed.line_type != "assistant" || parsed.message.role != "assistant" {
            continue;
        }
        if parsed.is_api_error_message || parsed.request_id.is_empty() {
            continue;
        }
        entries.push((parsed.request_id, parsed.message.content));
    }

    if entries.len() > tail_count {
        entries.drain(..entries.len() - tail_count);
    }

    // Per requestId, the latest entry's texts win; first-seen order of
    // requestIds is preserved.
    let mut order: Vec<String> = Vec::new();
    let mut texts_by_rid: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();

    for (request_id, content) in entries {
        let blocks: Vec<ContentBlock> = match serde_json::from_value(content) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let texts: Vec<String> = blocks
            .into_iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.trim().to_string())
            .filter(|t| !t.is_empty() && t != "(no content)")
            .collect();
        if texts.is_empty() {
            continue;
        }
        if !texts_by_rid.contains_key(&request_id) {
            order.push(request_id.clone());
        }
        texts_by_rid.insert(request_id, texts);
    }

    let mut result = Vec::new();
    for rid in order {
        if let Some(texts) = texts_by_rid.remove(&rid) {
            for text in texts {
                result.push(AssistantTextBlock { request_id: rid.clone(), text });
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn extract_from(content: &str, tail_count: usize) -> Vec<String> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        std::fs::write(&path, content).unwrap();
        extract_recent_assistant_texts(path.to_str().unwrap(), tail_count)
            .into_iter()
            .map(|b| b.text)
            .collect()
    }

    #[test]
    fn simple_response_with_one_text_block() {
        let content = r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"Hello! How can I help?"}]}}"#;
        assert_eq!(extract_from(content, 80), vec!["Hello! How can I help?"]);
    }

    #[test]
    fn multiple_text_blocks_in_one_entry() {
        let content = r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"First part"},{"type":"text","text":"Second part"}]}}"#;
        assert_eq!(extract_from(content, 80), vec!["First part", "Second part"]);
    }

    #[test]
    fn filters_thinking_and_tool_use_blocks() {
        let content = r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"thinking","thinking":"let me think..."},{"type":"text","text":"Here is my answer"},{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        assert_eq!(extract_from(content, 80), vec!["Here is my answer"]);
    }

    #[test]
    fn streaming_dedup_same_request_id_keeps_last() {
        let content = concat!(
            r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"partial response..."}]}}"#,
            "\n",
            r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"complete response with more detail"}]}}"#,
        );
        assert_eq!(extract_from(content, 80), vec!["complete response with more detail"]);
    }

    #[test]
    fn returns_all_turns_not_just_last() {
        let content = concat!(
            r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"first question"}]}}"#,
            "\n",
            r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"first answer"}]}}"#,
            "\n",
            r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"second question"}]}}"#,
            "\n",
            r#"{"type":"assistant","requestId":"req_4","message":{"role":"assistant","content":[{"type":"text","text":"second answer"}]}}"#,
        );
        assert_eq!(extract_from(content, 80), vec!["first answer", "second answer"]);
    }

    #[test]
    fn empty_file_returns_empty() {
        assert!(extract_from("", 80).is_empty());
    }

    #[test]
    fn no_assistant_messages_returns_empty() {
        let content = r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"hello"}]}}"#;
        assert!(extract_from(content, 80).is_empty());
    }

    #[test]
    fn filters_no_content_sentinel() {
        let content = r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"(no content)"},{"type":"text","text":"real content"}]}}"#;
        assert_eq!(extract_from(content, 80), vec!["real content"]);
    }

    #[test]
    fn skips_api_errors_and_entries_without_request_id() {
        let content = concat!(
            r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"good"}]}}"#,
            "\n",
            r#"{"type":"assistant","isApiErrorMessage":true,"message":{"role":"assistant","content":[{"type":"text","text":"No response requested."}]}}"#,
        );
        assert_eq!(extract_from(content, 80), vec!["good"]);
    }

    #[test]
    fn multiple_request_ids_all_returned() {
        let content = concat!(
            r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"running tool"}]}}"#,
            "\n",
            r#"{"type":"assistant","requestId":"req_4","message":{"role":"assistant","content":[{"type":"text","text":"tool completed"}]}}"#,
        );
        assert_eq!(extract_from(content, 80), vec!["running tool", "tool completed"]);
    }

    #[test]
    fn tail_count_limits_results() {
        let content = concat!(
            r#"{"type":"assistant","requestId":"req_1","message":{"role":"assistant","content":[{"type":"text","text":"old message"}]}}"#,
            "\n",
            r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"recent message"}]}}"#,
        );
        assert_eq!(extract_from(content, 1), vec!["recent message"]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let content = concat!(
            "not json at all\n",
            r#"{"type":"assistant","requestId":"req_2","message":{"role":"assistant","content":[{"type":"text","text":"survives"}]}}"#,
            "\n{broken",
        );
        assert_eq!(extract_from(content, 80), vec!["survives"]);
    }

    #[test]
    fn nonexistent_and_empty_path_return_empty() {
        assert!(extract_recent_assistant_texts("/nonexistent/file.jsonl", 80).is_empty());
        assert!(extract_recent_assistant_texts("", 80).is_empty());
    }

    #[test]
    fn large_file_scans_only_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        // Push an early entry beyond the 512 KiB window with padding lines.
        writeln!(
            file,
            r#"{{"type":"assistant","requestId":"req_old","message":{{"role":"assistant","content":[{{"type":"text","text":"buried"}}]}}}}"#
        )
        .unwrap();
        let filler = format!(r#"{{"type":"noise","data":"{}"}}"#, "x".repeat(1000));
        for _ in 0..600 {
            writeln!(file, "{}", filler).unwrap();
        }
        writeln!(
            file,
            r#"{{"type":"assistant","requestId":"req_new","message":{{"role":"assistant","content":[{{"type":"text","text":"visible"}}]}}}}"#
        )
        .unwrap();
        drop(file);

        let blocks = extract_recent_assistant_texts(path.to_str().unwrap(), 80);
        let texts: Vec<&str> = blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["visible"]);
    }
}

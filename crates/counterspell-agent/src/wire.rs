//! Vendor CLI wire formats. Each line of a subprocess backend's stdout is
//! one JSON envelope; unknown message types are tolerated and skipped so a
//! vendor adding event kinds never breaks the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Claude Code (`--output-format stream-json`) ──────────────────────────

/// A single NDJSON message emitted by Claude Code.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeEnvelope {
    /// First message on stream: session initialisation.
    System(ClaudeSystem),

    /// An assistant turn (text or tool calls).
    Assistant(ClaudeAssistant),

    /// A user turn (tool results injected back into the conversation).
    User(ClaudeUser),

    /// Final result message, emitted once at the very end.
    Result(ClaudeResult),

    /// Any message type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeSystem {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeAssistant {
    pub message: Option<ClaudeMessage>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeUser {
    pub message: Option<ClaudeMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ClaudeBlock>>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
}

/// A content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeBlock {
    Text {
        text: String,
    },

    Thinking {
        thinking: String,
    },

    /// A tool invocation by the agent.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Result returned by a tool (appears in the user turn).
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

/// Final result event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeResult {
    pub subtype: Option<String>,
    /// Textual output (may be empty if the last turn was a tool call).
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    pub num_turns: Option<u64>,
}

/// Render a tool_result content value (string or block array) as plain text.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
            out
        }
        other => other.to_string(),
    }
}

// ── Codex (`codex exec --json`) ──────────────────────────────────────────

/// A single JSON line emitted by `codex exec --json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum CodexEnvelope {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },

    #[serde(rename = "turn.started")]
    TurnStarted,

    #[serde(rename = "item.started")]
    ItemStarted { item: CodexItem },

    #[serde(rename = "item.updated")]
    ItemUpdated { item: CodexItem },

    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },

    #[serde(rename = "turn.completed")]
    TurnCompleted,

    #[serde(rename = "turn.failed")]
    TurnFailed { error: Option<CodexError> },

    #[serde(rename = "error")]
    StreamError { message: Option<String> },

    #[serde(other)]
    Unknown,
}

/// Thread item payload; the shape varies with `item_type`
/// (`agent_message`, `reasoning`, `command_execution`, ...).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodexItem {
    pub id: Option<String>,
    pub item_type: Option<String>,
    pub text: Option<String>,
    pub command: Option<String>,
    pub aggregated_output: Option<String>,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodexError {
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_system_line_parses() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-42","model":"x"}"#;
        let env: ClaudeEnvelope = serde_json::from_str(line).unwrap();
        match env {
            ClaudeEnvelope::System(s) => assert_eq!(s.session_id.as_deref(), Some("sess-42")),
            other => panic!("expected system, got {other:?}"),
        }
    }

    #[test]
    fn claude_assistant_tool_use_parses() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[
            {"type":"text","text":"Writing the file."},
            {"type":"tool_use","id":"tu_1","name":"Write","input":{"file_path":"CHANGELOG.md"}}
        ]}}"#;
        let env: ClaudeEnvelope = serde_json::from_str(line).unwrap();
        let ClaudeEnvelope::Assistant(a) = env else {
            panic!("expected assistant");
        };
        let blocks = a.message.unwrap().content.unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(matches!(&blocks[0], ClaudeBlock::Text { text } if text.starts_with("Writing")));
        assert!(matches!(&blocks[1], ClaudeBlock::ToolUse { name, .. } if name == "Write"));
    }

    #[test]
    fn claude_unknown_type_is_tolerated() {
        let line = r#"{"type":"rate_limit_notice","whatever":1}"#;
        let env: ClaudeEnvelope = serde_json::from_str(line).unwrap();
        assert!(matches!(env, ClaudeEnvelope::Unknown));
    }

    #[test]
    fn tool_result_text_handles_both_shapes() {
        assert_eq!(tool_result_text(&serde_json::json!("plain")), "plain");
        let blocks = serde_json::json!([{"type":"text","text":"a"},{"type":"text","text":"b"}]);
        assert_eq!(tool_result_text(&blocks), "a\nb");
    }

    #[test]
    fn codex_thread_and_item_lines_parse() {
        let started: CodexEnvelope =
            serde_json::from_str(r#"{"type":"thread.started","thread_id":"th_9"}"#).unwrap();
        assert!(matches!(started, CodexEnvelope::ThreadStarted { thread_id } if thread_id == "th_9"));

        let item: CodexEnvelope = serde_json::from_str(
            r#"{"type":"item.completed","item":{"id":"i1","item_type":"agent_message","text":"done"}}"#,
        )
        .unwrap();
        let CodexEnvelope::ItemCompleted { item } = item else {
            panic!("expected item.completed");
        };
        assert_eq!(item.item_type.as_deref(), Some("agent_message"));
        assert_eq!(item.text.as_deref(), Some("done"));
    }

    #[test]
    fn codex_unknown_type_is_tolerated() {
        let env: CodexEnvelope = serde_json::from_str(r#"{"type":"turn.diff"}"#).unwrap();
        assert!(matches!(env, CodexEnvelope::Unknown));
    }
}

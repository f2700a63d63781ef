use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ── Task lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    InProgress,
    Review,
    #[serde(rename = "review-conflict")]
    ReviewConflict,
    Done,
    Failed,
    Discarded,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::ReviewConflict => "review-conflict",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "review-conflict" => Ok(Self::ReviewConflict),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "discarded" => Ok(Self::Discarded),
            other => Err(Error::Internal(format!("unknown task status {other:?}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Discarded)
    }

    /// States in which a backend may be streaming (or is about to).
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Pending | Self::Planning | Self::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Native,
    ClaudeCode,
    Codex,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "native" => Ok(Self::Native),
            "claude-code" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            other => Err(Error::InvalidInput(format!("unknown backend kind {other:?}"))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Repository reference ─────────────────────────────────────────────────

/// `(owner, repo, base branch)` triple identifying where a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub base_branch: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            base_branch: base.into(),
        }
    }

    /// Key used for the bare-clone cache and fetch coalescing.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

// ── Task ─────────────────────────────────────────────────────────────────

/// A task row. Mutated only by the orchestrator; read by everyone else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque id, also the suffix of the worktree branch name.
    pub id: String,
    /// The user's prompt text.
    pub intent: String,
    pub repo: RepoRef,
    pub status: TaskStatus,
    /// Non-null iff the task passed provisioning.
    pub worktree_path: Option<String>,
    /// `cspell/<task_id>`.
    pub branch_name: String,
    /// Commit the worktree branched from; anchor for diffs and merges.
    pub base_commit: Option<String>,
    /// `provider/model`.
    pub model_id: String,
    pub backend_kind: BackendKind,
    /// Backend-owned continuation handle, opaque to the core.
    pub session_id: Option<String>,
    /// Serialized conversation blob owned by the backend.
    pub conversation_state: Option<String>,
    pub final_message: String,
    pub pr_url: Option<String>,
    /// `cancelled`, `process_exit`, or a short error summary.
    pub fail_reason: Option<String>,
    /// Files recorded when a merge stops on conflicts.
    pub conflict_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn branch_for(task_id: &str) -> String {
        format!("cspell/{task_id}")
    }
}

pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ── Conversation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(Error::Internal(format!("unknown role {other:?}"))),
        }
    }
}

/// One content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Thinking {
        text: String,
    },
}

impl Block {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Thinking { .. } => "thinking",
        }
    }
}

/// A conversation unit as backends see it (no persistence identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<Block>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![Block::Text { text: text.into() }],
        }
    }

    pub fn assistant(blocks: Vec<Block>) -> Self {
        Self {
            role: Role::Assistant,
            blocks,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            blocks: vec![Block::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
            }],
        }
    }

    /// Concatenated text content, ignoring tool and thinking blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let Block::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// A message as persisted: append-only child of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub task_id: String,
    /// Monotonic per task, assigned by the store inside the insert txn.
    pub seq: i64,
    pub role: Role,
    pub blocks: Vec<Block>,
    pub created_at: DateTime<Utc>,
}

// ── Todos ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    /// "pending" | "in_progress" | "completed"
    pub status: String,
    pub active_form: String,
}

// ── Events ───────────────────────────────────────────────────────────────

/// Kind-specific payload of a published event. Backends emit these; the
/// pump tags them with the task id and the bus stamps the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    MessageStart {
        message_id: String,
        role: Role,
    },
    ContentStart {
        message_id: String,
        block_type: String,
        block: Block,
    },
    ContentDelta {
        message_id: String,
        block_type: String,
        delta: String,
    },
    ContentEnd {
        message_id: String,
        block_type: String,
        block: Block,
    },
    /// Carries the finished message so the pump can persist it verbatim.
    MessageEnd {
        message_id: String,
        role: Role,
        blocks: Vec<Block>,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Todo {
        items: Vec<TodoItem>,
    },
    Session {
        session_id: String,
    },
    Status {
        status: TaskStatus,
    },
    Error {
        message: String,
    },
    Done,
    /// Synthetic marker: this subscriber missed `missed` events.
    Gap {
        missed: u64,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentStart { .. } => "content_start",
            Self::ContentDelta { .. } => "content_delta",
            Self::ContentEnd { .. } => "content_end",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Todo { .. } => "todo",
            Self::Session { .. } => "session",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Done => "done",
            Self::Gap { .. } => "gap",
        }
    }

    /// Terminators close a task's stream: exactly one per stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// A bus event: strictly increasing `id` per process, `task_id` scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub task_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

// ── Settings ─────────────────────────────────────────────────────────────

/// Per-user singleton read when constructing a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub anthropic_api_key: String,
    pub anthropic_auth_token: String,
    pub anthropic_base_url: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub default_backend: String,
    pub default_model: String,
}

impl Settings {
    pub fn backend_kind(&self) -> BackendKind {
        BackendKind::parse(&self.default_backend).unwrap_or(BackendKind::ClaudeCode)
    }
}

// ── GitHub connection ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConnection {
    pub access_token: String,
    pub login: String,
    pub connected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Planning,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::ReviewConflict,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Discarded,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(TaskStatus::parse("bogus").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Discarded.is_terminal());
        assert!(!TaskStatus::Review.is_terminal());
        assert!(!TaskStatus::ReviewConflict.is_terminal());
    }

    #[test]
    fn backend_kind_strings() {
        assert_eq!(BackendKind::parse("claude-code").unwrap(), BackendKind::ClaudeCode);
        assert_eq!(BackendKind::Codex.as_str(), "codex");
        assert!(BackendKind::parse("gemini").is_err());
    }

    #[test]
    fn event_payload_serde_tagging() {
        let p = EventPayload::ContentDelta {
            message_id: "m1".into(),
            block_type: "text".into(),
            delta: "hel".into(),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "content_delta");
        assert_eq!(v["delta"], "hel");
        let back: EventPayload = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn message_text_skips_tool_blocks() {
        let m = Message::assistant(vec![
            Block::Text { text: "a".into() },
            Block::ToolUse {
                id: "t1".into(),
                name: "read".into(),
                input: serde_json::json!({}),
            },
            Block::Text { text: "b".into() },
        ]);
        assert_eq!(m.text(), "a\nb");
    }

    #[test]
    fn task_ids_are_opaque_and_unique() {
        let a = new_task_id();
        let b = new_task_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(Task::branch_for(&a), format!("cspell/{a}"));
    }
}

//! Streaming chat-completion callers used by the native backend.
//!
//! Two wire dialects, selected by URL substring: an Anthropic-style
//! Messages API consumer and an OpenAI-style Chat Completions consumer.
//! Both normalize provider deltas to [`LlmEvent`]s on an mpsc channel fed
//! by a spawned reader over the response byte stream, so cancellation
//! (dropping the receiver) closes the HTTP stream promptly.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use counterspell_core::error::{Error, Result};
use counterspell_core::types::{Message, Settings};

use crate::tools::ToolDefinition;

pub use anthropic::AnthropicCaller;
pub use openai::OpenAiCaller;

/// Attempts to open the HTTP stream; nothing is retried mid-stream.
pub(crate) const OPEN_RETRIES: u32 = 3;

pub(crate) fn open_backoff(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis(500 * (1u64 << attempt))
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmBlockKind {
    Text,
    ToolUse { id: String, name: String },
    Thinking,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmDelta {
    Text(String),
    /// Tool-use input arrives as partial JSON; consumers buffer and parse
    /// at `ContentEnd`.
    InputJson(String),
    Thinking(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    ContentStart { index: usize, kind: LlmBlockKind },
    ContentDelta { index: usize, delta: LlmDelta },
    ContentEnd { index: usize },
    MessageEnd { stop_reason: StopReason },
}

pub struct LlmStream {
    pub events: mpsc::Receiver<LlmEvent>,
    pub done: oneshot::Receiver<Result<()>>,
}

/// One streaming turn against a chat-completion endpoint. The caller never
/// retries past stream open; retry policy above that lives with the
/// orchestrator.
#[async_trait]
pub trait LlmCaller: Send + Sync {
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmStream>;

    fn model(&self) -> &str;
}

/// Pick the caller for a `provider/model` id. Detection is URL-substring
/// based so an Anthropic-compatible proxy behind an arbitrary host still
/// routes to the right dialect.
pub fn caller_for(model_id: &str, settings: &Settings) -> Box<dyn LlmCaller> {
    let provider = model_id.split('/').next().unwrap_or("");
    let model = model_id.rsplit('/').next().unwrap_or(model_id).to_string();

    let (base_url, api_key) = if provider == "anthropic" {
        let base = if settings.anthropic_base_url.is_empty() {
            "https://api.anthropic.com".to_string()
        } else {
            settings.anthropic_base_url.clone()
        };
        (base, settings.anthropic_api_key.clone())
    } else {
        let base = if settings.openai_base_url.is_empty() {
            "https://api.openai.com".to_string()
        } else {
            settings.openai_base_url.clone()
        };
        (base, settings.openai_api_key.clone())
    };

    if base_url.contains("anthropic") {
        Box::new(AnthropicCaller::new(api_key, model, base_url))
    } else {
        Box::new(OpenAiCaller::new(api_key, model, base_url))
    }
}

/// Map a non-2xx response onto the taxonomy: 5xx and 429 are transient,
/// the rest are caller errors.
pub(crate) fn status_error(status: u16, body: &str) -> Error {
    if status >= 500 || status == 429 {
        Error::Transient(format!("llm endpoint returned {status}: {body}"))
    } else if status == 401 || status == 403 {
        Error::InvalidInput(format!("llm auth rejected ({status})"))
    } else {
        Error::BackendFailure(format!("llm endpoint returned {status}: {body}"))
    }
}

/// Splits a byte stream into lines for SSE parsing.
pub(crate) struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

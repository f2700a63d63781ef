//! Anthropic Messages API streaming consumer.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use async_trait::async_trait;

use counterspell_core::error::{Error, Result};
use counterspell_core::types::{Block, Message, Role};

use crate::tools::ToolDefinition;

use super::{
    open_backoff, status_error, LineBuffer, LlmBlockKind, LlmCaller, LlmDelta, LlmEvent,
    LlmStream, StopReason, OPEN_RETRIES,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicCaller {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicCaller {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        }
    }

    fn build_request(&self, system: &str, messages: &[Message], tools: &[ToolDefinition]) -> Value {
        let api_messages: Vec<Value> = messages.iter().map(to_api_message).collect();
        let api_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        let mut request = json!({
            "model": self.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": api_messages,
            "stream": true,
        });
        if !system.is_empty() {
            request["system"] = json!(system);
        }
        if !api_tools.is_empty() {
            request["tools"] = json!(api_tools);
        }
        request
    }
}

/// Tool results travel in user-role messages on this wire.
fn to_api_message(message: &Message) -> Value {
    let role = match message.role {
        Role::Assistant => "assistant",
        Role::User | Role::Tool => "user",
    };
    let blocks: Vec<Value> = message
        .blocks
        .iter()
        .filter_map(|block| match block {
            Block::Text { text } => Some(json!({"type": "text", "text": text})),
            Block::ToolUse { id, name, input } => {
                Some(json!({"type": "tool_use", "id": id, "name": name, "input": input}))
            }
            Block::ToolResult { tool_use_id, content } => Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            })),
            // thinking is never replayed upstream
            Block::Thinking { .. } => None,
        })
        .collect();
    json!({"role": role, "content": blocks})
}

// ── SSE payloads ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: ContentBlockInfo,
}

#[derive(Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: DeltaInfo,
}

#[derive(Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockStop {
    index: usize,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInfo,
}

#[derive(Deserialize)]
struct MessageDeltaInfo {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamErrorEvent {
    error: StreamErrorDetail,
}

#[derive(Deserialize)]
struct StreamErrorDetail {
    message: String,
}

#[async_trait]
impl LlmCaller for AnthropicCaller {
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmStream> {
        let request = self.build_request(system, messages, tools);
        let url = format!("{}/v1/messages", self.base_url);

        // retry opening the stream on transient failures; never mid-stream
        let mut attempt = 0u32;
        let response = loop {
            let result = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await;
            let outcome = match result {
                Ok(resp) if resp.status().is_success() => Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    Err(status_error(status, &body))
                }
                Err(e) => Err(Error::Transient(format!("llm stream open: {e}"))),
            };
            match outcome {
                Ok(resp) => break resp,
                Err(e) if e.is_transient() && attempt + 1 < OPEN_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "anthropic stream open failed, retrying: {e}");
                    tokio::time::sleep(open_backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        };

        debug!(model = %self.model, messages = messages.len(), "anthropic stream open");

        let (tx, rx) = mpsc::channel::<LlmEvent>(256);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut body = Box::pin(response.bytes_stream());
            let mut lines = LineBuffer::new();
            let mut event_name = String::new();
            let mut stop_reason = StopReason::EndTurn;
            let mut outcome: Result<()> = Ok(());

            'read: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        outcome = Err(Error::Transient(format!("llm stream read: {e}")));
                        break;
                    }
                };
                for line in lines.push(&chunk) {
                    if let Some(name) = line.strip_prefix("event: ") {
                        event_name = name.trim().to_string();
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let sent = match event_name.as_str() {
                        "content_block_start" => {
                            match serde_json::from_str::<ContentBlockStart>(data) {
                                Ok(start) => {
                                    let kind = match start.content_block.block_type.as_str() {
                                        "tool_use" => LlmBlockKind::ToolUse {
                                            id: start.content_block.id.unwrap_or_default(),
                                            name: start.content_block.name.unwrap_or_default(),
                                        },
                                        "thinking" => LlmBlockKind::Thinking,
                                        _ => LlmBlockKind::Text,
                                    };
                                    tx.send(LlmEvent::ContentStart {
                                        index: start.index,
                                        kind,
                                    })
                                    .await
                                }
                                Err(_) => Ok(()),
                            }
                        }
                        "content_block_delta" => {
                            match serde_json::from_str::<ContentBlockDelta>(data) {
                                Ok(delta) => {
                                    let payload = match delta.delta.delta_type.as_str() {
                                        "text_delta" => {
                                            delta.delta.text.map(LlmDelta::Text)
                                        }
                                        "input_json_delta" => {
                                            delta.delta.partial_json.map(LlmDelta::InputJson)
                                        }
                                        "thinking_delta" => {
                                            delta.delta.thinking.map(LlmDelta::Thinking)
                                        }
                                        _ => None,
                                    };
                                    match payload {
                                        Some(d) => {
                                            tx.send(LlmEvent::ContentDelta {
                                                index: delta.index,
                                                delta: d,
                                            })
                                            .await
                                        }
                                        None => Ok(()),
                                    }
                                }
                                Err(_) => Ok(()),
                            }
                        }
                        "content_block_stop" => {
                            match serde_json::from_str::<ContentBlockStop>(data) {
                                Ok(stop) => {
                                    tx.send(LlmEvent::ContentEnd { index: stop.index }).await
                                }
                                Err(_) => Ok(()),
                            }
                        }
                        "message_delta" => {
                            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                                if let Some(reason) = delta.delta.stop_reason.as_deref() {
                                    stop_reason = match reason {
                                        "tool_use" => StopReason::ToolUse,
                                        "max_tokens" => StopReason::MaxTokens,
                                        _ => StopReason::EndTurn,
                                    };
                                }
                            }
                            Ok(())
                        }
                        "message_stop" => {
                            let _ = tx.send(LlmEvent::MessageEnd { stop_reason }).await;
                            break 'read;
                        }
                        "error" => {
                            let message = serde_json::from_str::<StreamErrorEvent>(data)
                                .map(|e| e.error.message)
                                .unwrap_or_else(|_| data.to_string());
                            outcome = Err(Error::BackendFailure(format!("llm error: {message}")));
                            break 'read;
                        }
                        _ => Ok(()),
                    };
                    if sent.is_err() {
                        // consumer went away (cancellation); stop reading
                        break 'read;
                    }
                }
            }

            let _ = done_tx.send(outcome);
        });

        Ok(LlmStream {
            events: rx,
            done: done_rx,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_become_user_messages() {
        let msg = Message::tool_result("tu_1", "file written");
        let api = to_api_message(&msg);
        assert_eq!(api["role"], "user");
        assert_eq!(api["content"][0]["type"], "tool_result");
        assert_eq!(api["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn thinking_blocks_are_not_replayed() {
        let msg = Message::assistant(vec![
            Block::Thinking { text: "hmm".into() },
            Block::Text { text: "answer".into() },
        ]);
        let api = to_api_message(&msg);
        assert_eq!(api["content"].as_array().unwrap().len(), 1);
        assert_eq!(api["content"][0]["type"], "text");
    }

    #[test]
    fn request_includes_tools_and_system() {
        let caller = AnthropicCaller::new("k", "claude-sonnet-4-5", "https://api.anthropic.com");
        let tools = crate::tools::ToolSet::definitions();
        let req = caller.build_request("be terse", &[Message::user("hi")], &tools);
        assert_eq!(req["system"], "be terse");
        assert_eq!(req["stream"], true);
        assert!(req["tools"].as_array().unwrap().len() >= 8);
    }
}

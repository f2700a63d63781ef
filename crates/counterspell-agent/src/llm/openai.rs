//! OpenAI Chat Completions streaming consumer.
//!
//! Tool-call deltas arrive indexed by `tool_calls[].index`; a channel per
//! index stays open until a `finish_reason` arrives, at which point every
//! open channel is finalized in order.

use std::collections::BTreeMap;

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

pub struct OpenAiCaller {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiCaller {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        }
    }

    fn build_request(&self, system: &str, messages: &[Message], tools: &[ToolDefinition]) -> Value {
        let mut api_messages: Vec<Value> = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            api_messages.push(json!({"role": "system", "content": system}));
        }
        for message in messages {
            api_messages.extend(to_api_messages(message));
        }
        let api_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        let mut request = json!({
            "model": self.model,
            "messages": api_messages,
            "stream": true,
        });
        if !api_tools.is_empty() {
            request["tools"] = json!(api_tools);
        }
        request
    }
}

/// One conversation message can fan out into several wire messages
/// (a tool message per tool_result block).
fn to_api_messages(message: &Message) -> Vec<Value> {
    match message.role {
        Role::User => vec![json!({"role": "user", "content": message.text()})],
        Role::Assistant => {
            let mut content = String::new();
            let mut tool_calls = Vec::new();
            for block in &message.blocks {
                match block {
                    Block::Text { text } => content.push_str(text),
                    Block::ToolUse { id, name, input } => tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": input.to_string(),
                        }
                    })),
                    Block::ToolResult { .. } | Block::Thinking { .. } => {}
                }
            }
            let mut msg = json!({"role": "assistant"});
            msg["content"] = if content.is_empty() {
                Value::Null
            } else {
                json!(content)
            };
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(tool_calls);
            }
            vec![msg]
        }
        Role::Tool => message
            .blocks
            .iter()
            .filter_map(|block| match block {
                Block::ToolResult { tool_use_id, content } => Some(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                })),
                _ => None,
            })
            .collect(),
    }
}

// ── SSE payloads ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Per-stream channel bookkeeping: which output indexes are open.
struct ChannelState {
    next_index: usize,
    text: Option<usize>,
    tools: BTreeMap<u32, usize>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            next_index: 0,
            text: None,
            tools: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl LlmCaller for OpenAiCaller {
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmStream> {
        let request = self.build_request(system, messages, tools);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut attempt = 0u32;
        let response = loop {
            let result = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
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
                    warn!(attempt, "openai stream open failed, retrying: {e}");
                    tokio::time::sleep(open_backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        };

        debug!(model = %self.model, messages = messages.len(), "openai stream open");

        let (tx, rx) = mpsc::channel::<LlmEvent>(256);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut body = Box::pin(response.bytes_stream());
            let mut lines = LineBuffer::new();
            let mut channels = ChannelState::new();
            let mut finished = false;
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
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data.trim() == "[DONE]" {
                        break 'read;
                    }
                    let Ok(parsed) = serde_json::from_str::<ChatChunk>(data) else {
                        continue;
                    };
                    let Some(choice) = parsed.choices.into_iter().next() else {
                        continue;
                    };

                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            let index = match channels.text {
                                Some(i) => i,
                                None => {
                                    let i = channels.next_index;
                                    channels.next_index += 1;
                                    channels.text = Some(i);
                                    if tx
                                        .send(LlmEvent::ContentStart {
                                            index: i,
                                            kind: LlmBlockKind::Text,
                                        })
                                        .await
                                        .is_err()
                                    {
                                        break 'read;
                                    }
                                    i
                                }
                            };
                            if tx
                                .send(LlmEvent::ContentDelta {
                                    index,
                                    delta: LlmDelta::Text(content),
                                })
                                .await
                                .is_err()
                            {
                                break 'read;
                            }
                        }
                    }

                    for call in choice.delta.tool_calls.unwrap_or_default() {
                        let function = call.function.unwrap_or_default();
                        let index = match channels.tools.get(&call.index) {
                            Some(i) => *i,
                            None => {
                                let i = channels.next_index;
                                channels.next_index += 1;
                                channels.tools.insert(call.index, i);
                                if tx
                                    .send(LlmEvent::ContentStart {
                                        index: i,
                                        kind: LlmBlockKind::ToolUse {
                                            id: call.id.unwrap_or_default(),
                                            name: function.name.clone().unwrap_or_default(),
                                        },
                                    })
                                    .await
                                    .is_err()
                                {
                                    break 'read;
                                }
                                i
                            }
                        };
                        if let Some(arguments) = function.arguments {
                            if !arguments.is_empty()
                                && tx
                                    .send(LlmEvent::ContentDelta {
                                        index,
                                        delta: LlmDelta::InputJson(arguments),
                                    })
                                    .await
                                    .is_err()
                            {
                                break 'read;
                            }
                        }
                    }

                    if let Some(reason) = choice.finish_reason {
                        // finalize every open channel, text first
                        let mut open: Vec<usize> = channels.text.take().into_iter().collect();
                        open.extend(std::mem::take(&mut channels.tools).into_values());
                        open.sort_unstable();
                        for index in open {
                            if tx.send(LlmEvent::ContentEnd { index }).await.is_err() {
                                break 'read;
                            }
                        }
                        let stop_reason = match reason.as_str() {
                            "tool_calls" => StopReason::ToolUse,
                            "length" => StopReason::MaxTokens,
                            _ => StopReason::EndTurn,
                        };
                        let _ = tx.send(LlmEvent::MessageEnd { stop_reason }).await;
                        finished = true;
                    }
                }
            }

            if !finished && outcome.is_ok() {
                outcome = Err(Error::Transient("llm stream ended early".into()));
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
    fn assistant_tool_use_becomes_tool_calls() {
        let msg = Message::assistant(vec![
            Block::Text { text: "running".into() },
            Block::ToolUse {
                id: "call_1".into(),
                name: "bash".into(),
                input: json!({"command": "ls"}),
            },
        ]);
        let api = to_api_messages(&msg);
        assert_eq!(api.len(), 1);
        assert_eq!(api[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(api[0]["tool_calls"][0]["function"]["name"], "bash");
    }

    #[test]
    fn tool_message_fans_out_per_result() {
        let msg = Message {
            role: Role::Tool,
            blocks: vec![
                Block::ToolResult {
                    tool_use_id: "a".into(),
                    content: "one".into(),
                },
                Block::ToolResult {
                    tool_use_id: "b".into(),
                    content: "two".into(),
                },
            ],
        };
        let api = to_api_messages(&msg);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0]["role"], "tool");
        assert_eq!(api[1]["tool_call_id"], "b");
    }

    #[test]
    fn chunk_parsing_tolerates_partial_function_deltas() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"pa"}}]},"finish_reason":null}]}"#;
        let chunk: ChatChunk = serde_json::from_str(data).unwrap();
        let call = &chunk.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.index, 0);
        assert!(call.id.is_none());
    }
}

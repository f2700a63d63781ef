//! In-process agent backend: an LLM loop with local tool execution.
//!
//! Each turn streams from the configured chat-completion endpoint,
//! forwarding deltas as uniform events while accumulating blocks. Every
//! `tool_use` block executes against the task worktree and its result is
//! appended to the history; the loop re-calls the LLM until a turn
//! contains no tool calls.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use counterspell_core::backend::{AgentBackend, BackendInfo, EventStream};
use counterspell_core::error::{Error, Result};
use counterspell_core::types::{Block, BackendKind, EventPayload, Message, Role, TodoItem};

use crate::llm::{LlmBlockKind, LlmCaller, LlmDelta, LlmEvent};
use crate::normalize::{shared_conversation, SharedConversation};
use crate::subprocess::{restore_message_blob, state_blob};
use crate::tools::ToolSet;

const SYSTEM_PROMPT: &str = "You are a coding agent working inside a git worktree. \
Use the provided tools to read, search, and modify the repository until the task is done. \
Prefer small verifiable steps. Keep the tasklist current with the todos tool. \
When finished, summarize what changed in plain text.";

/// Caps runaway tool loops; a well-behaved turn sequence ends long before.
const MAX_TURNS: usize = 50;

pub struct NativeBackend {
    caller: Arc<dyn LlmCaller>,
    tools: Arc<ToolSet>,
    model_id: String,
    shared: SharedConversation,
    stream_token: Option<CancellationToken>,
    closed: bool,
}

impl NativeBackend {
    pub fn new(
        caller: Arc<dyn LlmCaller>,
        worktree: impl Into<PathBuf>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            caller,
            tools: Arc::new(ToolSet::new(worktree)),
            model_id: model_id.into(),
            shared: shared_conversation(),
            stream_token: None,
            closed: false,
        }
    }
}

/// Accumulates streamed content blocks for one assistant turn, preserving
/// the order blocks opened in.
struct TurnCollector {
    building: HashMap<usize, BuildingBlock>,
    order: Vec<usize>,
}

struct BuildingBlock {
    kind: LlmBlockKind,
    text: String,
    partial_json: String,
    finished: Option<Block>,
}

impl TurnCollector {
    fn new() -> Self {
        Self {
            building: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn start(&mut self, index: usize, kind: LlmBlockKind) -> Block {
        self.order.push(index);
        let initial = match &kind {
            LlmBlockKind::Text => Block::Text { text: String::new() },
            LlmBlockKind::Thinking => Block::Thinking { text: String::new() },
            LlmBlockKind::ToolUse { id, name } => Block::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: Value::Object(Default::default()),
            },
        };
        self.building.insert(
            index,
            BuildingBlock {
                kind,
                text: String::new(),
                partial_json: String::new(),
                finished: None,
            },
        );
        initial
    }

    /// Returns the delta as a plain string for the forwarded event.
    fn delta(&mut self, index: usize, delta: &LlmDelta) -> (String, &'static str) {
        let Some(building) = self.building.get_mut(&index) else {
            return (String::new(), "text");
        };
        match delta {
            LlmDelta::Text(s) => {
                building.text.push_str(s);
                (s.clone(), "text")
            }
            LlmDelta::Thinking(s) => {
                building.text.push_str(s);
                (s.clone(), "thinking")
            }
            LlmDelta::InputJson(s) => {
                building.partial_json.push_str(s);
                (s.clone(), "tool_use")
            }
        }
    }

    /// Tool input buffered as partial JSON parses at block end.
    fn end(&mut self, index: usize) -> Block {
        let Some(building) = self.building.get_mut(&index) else {
            return Block::Text { text: String::new() };
        };
        let block = match &building.kind {
            LlmBlockKind::Text => Block::Text {
                text: building.text.clone(),
            },
            LlmBlockKind::Thinking => Block::Thinking {
                text: building.text.clone(),
            },
            LlmBlockKind::ToolUse { id, name } => {
                let input = serde_json::from_str(&building.partial_json)
                    .unwrap_or(Value::Object(Default::default()));
                Block::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input,
                }
            }
        };
        building.finished = Some(block.clone());
        block
    }

    fn block_type(&self, index: usize) -> &'static str {
        match self.building.get(&index).map(|b| &b.kind) {
            Some(LlmBlockKind::ToolUse { .. }) => "tool_use",
            Some(LlmBlockKind::Thinking) => "thinking",
            _ => "text",
        }
    }

    fn into_blocks(mut self) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(self.order.len());
        for index in self.order.clone() {
            if let Some(mut building) = self.building.remove(&index) {
                let block = building.finished.take().unwrap_or_else(|| match &building.kind {
                    LlmBlockKind::Text => Block::Text {
                        text: building.text.clone(),
                    },
                    LlmBlockKind::Thinking => Block::Thinking {
                        text: building.text.clone(),
                    },
                    LlmBlockKind::ToolUse { id, name } => Block::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::from_str(&building.partial_json)
                            .unwrap_or(Value::Object(Default::default())),
                    },
                });
                blocks.push(block);
            }
        }
        blocks
    }
}

struct TurnDriver {
    caller: Arc<dyn LlmCaller>,
    tools: Arc<ToolSet>,
    shared: SharedConversation,
    tx: mpsc::Sender<EventPayload>,
    ctx: CancellationToken,
    message_counter: u64,
}

impl TurnDriver {
    async fn send(&self, payload: EventPayload) {
        let _ = self.tx.send(payload).await;
    }

    async fn run(&mut self) -> Result<()> {
        let definitions = ToolSet::definitions();
        for _turn in 0..MAX_TURNS {
            if self.ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let history = self
                .shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .messages
                .clone();
            let mut llm = self
                .caller
                .stream(SYSTEM_PROMPT, &history, &definitions)
                .await?;

            self.message_counter += 1;
            let message_id = format!("msg_{}", self.message_counter);
            self.send(EventPayload::MessageStart {
                message_id: message_id.clone(),
                role: Role::Assistant,
            })
            .await;

            let mut collector = TurnCollector::new();
            let mut saw_message_end = false;
            loop {
                tokio::select! {
                    _ = self.ctx.cancelled() => {
                        // dropping the llm stream tears the HTTP read down
                        return Err(Error::Cancelled);
                    }
                    event = llm.events.recv() => match event {
                        Some(LlmEvent::ContentStart { index, kind }) => {
                            let block = collector.start(index, kind);
                            self.send(EventPayload::ContentStart {
                                message_id: message_id.clone(),
                                block_type: block.kind().to_string(),
                                block,
                            })
                            .await;
                        }
                        Some(LlmEvent::ContentDelta { index, delta }) => {
                            let (delta_text, block_type) = collector.delta(index, &delta);
                            self.send(EventPayload::ContentDelta {
                                message_id: message_id.clone(),
                                block_type: block_type.to_string(),
                                delta: delta_text,
                            })
                            .await;
                        }
                        Some(LlmEvent::ContentEnd { index }) => {
                            let block_type = collector.block_type(index).to_string();
                            let block = collector.end(index);
                            self.send(EventPayload::ContentEnd {
                                message_id: message_id.clone(),
                                block_type,
                                block,
                            })
                            .await;
                        }
                        Some(LlmEvent::MessageEnd { stop_reason: _ }) => {
                            saw_message_end = true;
                            break;
                        }
                        None => break,
                    }
                }
            }

            if !saw_message_end {
                return match llm.done.await {
                    Ok(Err(e)) => Err(e),
                    _ => Err(Error::BackendFailure("llm stream ended mid-turn".into())),
                };
            }

            let blocks = collector.into_blocks();
            let assistant = Message::assistant(blocks.clone());
            {
                let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
                let text = assistant.text();
                if !text.is_empty() {
                    if !shared.final_message.is_empty() {
                        shared.final_message.push('\n');
                    }
                    shared.final_message.push_str(&text);
                }
                shared.messages.push(assistant);
            }
            self.send(EventPayload::MessageEnd {
                message_id,
                role: Role::Assistant,
                blocks: blocks.clone(),
            })
            .await;

            let tool_uses: Vec<(String, String, Value)> = blocks
                .into_iter()
                .filter_map(|b| match b {
                    Block::ToolUse { id, name, input } => Some((id, name, input)),
                    _ => None,
                })
                .collect();

            // a turn without tool calls ends the loop
            if tool_uses.is_empty() {
                return Ok(());
            }

            for (id, name, input) in tool_uses {
                if self.ctx.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.send(EventPayload::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                })
                .await;
                let content = match self.tools.execute(&name, &input).await {
                    Ok(outcome) => {
                        if let Some(items) = outcome.todos {
                            self.shared
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .todos = items.clone();
                            self.send(EventPayload::Todo { items }).await;
                        }
                        outcome.content
                    }
                    Err(e) => {
                        // tool failures go back to the model, not upward
                        warn!(tool = %name, "tool error: {e}");
                        format!("error: {e}")
                    }
                };
                self.shared
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .messages
                    .push(Message::tool_result(&id, &content));
                self.send(EventPayload::ToolResult {
                    tool_use_id: id,
                    content,
                })
                .await;
            }
        }
        Err(Error::BackendFailure(format!(
            "agent exceeded {MAX_TURNS} turns without finishing"
        )))
    }
}

#[async_trait]
impl AgentBackend for NativeBackend {
    async fn stream(&mut self, ctx: CancellationToken, text: &str) -> Result<EventStream> {
        if self.closed {
            return Err(Error::Conflict("backend already closed".into()));
        }
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .messages
            .push(Message::user(text));
        self.stream_token = Some(ctx.clone());

        let (tx, rx) = mpsc::channel::<EventPayload>(256);
        let (done_tx, done_rx) = oneshot::channel();

        let mut driver = TurnDriver {
            caller: Arc::clone(&self.caller),
            tools: Arc::clone(&self.tools),
            shared: Arc::clone(&self.shared),
            tx: tx.clone(),
            ctx,
            message_counter: 0,
        };
        info!(model = %self.caller.model(), "starting native agent loop");

        tokio::spawn(async move {
            let outcome = driver.run().await;
            match &outcome {
                Ok(()) => {
                    let _ = tx.send(EventPayload::Done).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(EventPayload::Error {
                            message: e.user_message(),
                        })
                        .await;
                }
            }
            drop(tx);
            let _ = done_tx.send(outcome);
        });

        Ok(EventStream {
            events: rx,
            done: done_rx,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(token) = self.stream_token.take() {
            token.cancel();
        }
        Ok(())
    }

    fn get_state(&self) -> String {
        state_blob(&self.shared)
    }

    fn restore_state(&mut self, blob: &str) -> Result<()> {
        restore_message_blob(&self.shared, blob)
    }

    fn messages(&self) -> Vec<Message> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).messages.clone()
    }

    fn final_message(&self) -> String {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).final_message.clone()
    }

    fn todos(&self) -> Vec<TodoItem> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).todos.clone()
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Native,
            version: self.model_id.clone(),
        }
    }

    fn session_id(&self) -> Option<String> {
        None
    }
}

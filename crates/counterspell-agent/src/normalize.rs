//! Normalizes vendor CLI envelopes to the uniform event stream.
//!
//! Vendor CLIs interleave fragmented text with fully-formed tool-call
//! envelopes. The normalizer maintains one "open assistant text message"
//! per stream: fragments accumulate under an implicit assistant message
//! that is closed (`content_end` + `message_end`) the moment a tool call,
//! tool result, final result, or stream end arrives. Vendor JSON shapes
//! never leak past this module.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use counterspell_core::types::{Block, EventPayload, Message, Role, TodoItem};

/// Conversation state shared between a backend handle and its stream
/// driver task.
#[derive(Debug, Default)]
pub struct Conversation {
    pub messages: Vec<Message>,
    pub final_message: String,
    pub session_id: Option<String>,
    pub todos: Vec<TodoItem>,
}

pub type SharedConversation = Arc<Mutex<Conversation>>;

pub fn shared_conversation() -> SharedConversation {
    Arc::new(Mutex::new(Conversation::default()))
}

struct OpenMessage {
    id: String,
    text: String,
}

pub struct StreamNormalizer {
    tx: mpsc::Sender<EventPayload>,
    shared: SharedConversation,
    open: Option<OpenMessage>,
    next_message: u64,
}

impl StreamNormalizer {
    pub fn new(tx: mpsc::Sender<EventPayload>, shared: SharedConversation) -> Self {
        Self {
            tx,
            shared,
            open: None,
            next_message: 0,
        }
    }

    async fn send(&self, payload: EventPayload) {
        // the receiver dropping just means nobody is listening anymore
        let _ = self.tx.send(payload).await;
    }

    fn next_message_id(&mut self) -> String {
        self.next_message += 1;
        format!("msg_{}", self.next_message)
    }

    /// Append a fragment to the open assistant message, opening one first
    /// if necessary.
    pub async fn text_fragment(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        if self.open.is_none() {
            let id = self.next_message_id();
            self.send(EventPayload::MessageStart {
                message_id: id.clone(),
                role: Role::Assistant,
            })
            .await;
            self.send(EventPayload::ContentStart {
                message_id: id.clone(),
                block_type: "text".into(),
                block: Block::Text { text: String::new() },
            })
            .await;
            self.open = Some(OpenMessage {
                id,
                text: String::new(),
            });
        }
        let id = self.open.as_ref().map(|m| m.id.clone()).unwrap_or_default();
        self.send(EventPayload::ContentDelta {
            message_id: id,
            block_type: "text".into(),
            delta: fragment.to_string(),
        })
        .await;
        if let Some(open) = self.open.as_mut() {
            open.text.push_str(fragment);
        }
    }

    /// Close the open assistant message, optionally attaching trailing
    /// blocks (a tool_use that ended the turn).
    pub async fn close_open(&mut self, trailing: Vec<Block>) {
        let Some(open) = self.open.take() else {
            if !trailing.is_empty() {
                // tool call with no preceding text still needs a bracket
                let id = self.next_message_id();
                self.send(EventPayload::MessageStart {
                    message_id: id.clone(),
                    role: Role::Assistant,
                })
                .await;
                self.finish_message(id, Vec::new(), trailing).await;
            }
            return;
        };
        let text_blocks = vec![Block::Text {
            text: open.text.clone(),
        }];
        self.send(EventPayload::ContentEnd {
            message_id: open.id.clone(),
            block_type: "text".into(),
            block: Block::Text { text: open.text },
        })
        .await;
        self.finish_message(open.id, text_blocks, trailing).await;
    }

    async fn finish_message(&mut self, id: String, mut blocks: Vec<Block>, trailing: Vec<Block>) {
        blocks.extend(trailing);
        let message = Message {
            role: Role::Assistant,
            blocks: blocks.clone(),
        };
        {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            let text = message.text();
            if !text.is_empty() {
                if !shared.final_message.is_empty() {
                    shared.final_message.push('\n');
                }
                shared.final_message.push_str(&text);
            }
            shared.messages.push(message);
        }
        self.send(EventPayload::MessageEnd {
            message_id: id,
            role: Role::Assistant,
            blocks,
        })
        .await;
    }

    /// A tool invocation closes the open text message and travels with it.
    pub async fn tool_call(&mut self, id: &str, name: &str, input: Value) {
        self.close_open(vec![Block::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
        }])
        .await;
        self.send(EventPayload::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input,
        })
        .await;
    }

    /// A tool result also forces any open text message closed.
    pub async fn tool_result(&mut self, tool_use_id: &str, content: String) {
        self.close_open(Vec::new()).await;
        {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.messages.push(Message {
                role: Role::Tool,
                blocks: vec![Block::ToolResult {
                    tool_use_id: tool_use_id.to_string(),
                    content: content.clone(),
                }],
            });
        }
        self.send(EventPayload::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content,
        })
        .await;
    }

    /// Persistable continuation handle. Re-emitted only when it changes.
    pub async fn session(&mut self, session_id: &str) {
        let changed = {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            if shared.session_id.as_deref() == Some(session_id) {
                false
            } else {
                shared.session_id = Some(session_id.to_string());
                true
            }
        };
        if changed {
            self.send(EventPayload::Session {
                session_id: session_id.to_string(),
            })
            .await;
        }
    }

    /// Stream end: close any open message; a final result that adds new
    /// text beyond what streamed becomes the authoritative final message.
    pub async fn finish(&mut self, final_result: Option<&str>) {
        self.close_open(Vec::new()).await;
        if let Some(result) = final_result {
            if !result.is_empty() {
                let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
                if shared.final_message.is_empty() {
                    shared.final_message = result.to_string();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::Receiver<EventPayload>) -> Vec<EventPayload> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn fragments_coalesce_into_one_bracketed_message() {
        let (tx, mut rx) = mpsc::channel(64);
        let shared = shared_conversation();
        let mut norm = StreamNormalizer::new(tx, Arc::clone(&shared));

        norm.text_fragment("Hello ").await;
        norm.text_fragment("world").await;
        norm.finish(None).await;

        let kinds: Vec<&str> = drain(&mut rx).await.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "message_start",
                "content_start",
                "content_delta",
                "content_delta",
                "content_end",
                "message_end"
            ]
        );
        let conv = shared.lock().unwrap();
        assert_eq!(conv.final_message, "Hello world");
        assert_eq!(conv.messages.len(), 1);
    }

    #[tokio::test]
    async fn tool_call_closes_open_text_message() {
        let (tx, mut rx) = mpsc::channel(64);
        let shared = shared_conversation();
        let mut norm = StreamNormalizer::new(tx, Arc::clone(&shared));

        norm.text_fragment("Let me write that file.").await;
        norm.tool_call("tu_1", "write", serde_json::json!({"path": "a.txt"}))
            .await;
        norm.tool_result("tu_1", "ok".into()).await;
        norm.finish(None).await;

        let events = drain(&mut rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "message_start",
                "content_start",
                "content_delta",
                "content_end",
                "message_end",
                "tool_call",
                "tool_result"
            ]
        );
        // the closing message carries the tool_use block
        let Some(EventPayload::MessageEnd { blocks, .. }) =
            events.iter().find(|e| e.kind() == "message_end")
        else {
            panic!("no message_end");
        };
        assert!(blocks.iter().any(|b| matches!(b, Block::ToolUse { id, .. } if id == "tu_1")));

        let conv = shared.lock().unwrap();
        assert_eq!(conv.messages.len(), 2); // assistant + tool result
        assert_eq!(conv.messages[1].role, Role::Tool);
    }

    #[tokio::test]
    async fn bare_tool_call_still_gets_a_bracket() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut norm = StreamNormalizer::new(tx, shared_conversation());
        norm.tool_call("tu_9", "bash", serde_json::json!({"command": "ls"}))
            .await;
        let kinds: Vec<&str> = drain(&mut rx).await.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["message_start", "message_end", "tool_call"]);
    }

    #[tokio::test]
    async fn session_is_deduplicated_but_updates_propagate() {
        let (tx, mut rx) = mpsc::channel(64);
        let shared = shared_conversation();
        let mut norm = StreamNormalizer::new(tx, Arc::clone(&shared));
        norm.session("s1").await;
        norm.session("s1").await;
        norm.session("s2").await;
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(shared.lock().unwrap().session_id.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn final_result_fills_empty_final_message_only() {
        let (tx, _rx) = mpsc::channel(64);
        let shared = shared_conversation();
        let mut norm = StreamNormalizer::new(tx, Arc::clone(&shared));
        norm.finish(Some("summary text")).await;
        assert_eq!(shared.lock().unwrap().final_message, "summary text");

        let (tx2, _rx2) = mpsc::channel(64);
        let shared2 = shared_conversation();
        let mut norm2 = StreamNormalizer::new(tx2, Arc::clone(&shared2));
        norm2.text_fragment("streamed").await;
        norm2.finish(Some("ignored")).await;
        assert_eq!(shared2.lock().unwrap().final_message, "streamed");
    }
}

//! Native backend loop tests with a scripted LLM caller: tool execution,
//! turn iteration, todo tracking, and the uniform event bracketing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use counterspell_agent::llm::{
    LlmBlockKind, LlmCaller, LlmDelta, LlmEvent, LlmStream, StopReason,
};
use counterspell_agent::tools::ToolDefinition;
use counterspell_agent::NativeBackend;
use counterspell_core::backend::AgentBackend;
use counterspell_core::error::{Error, Result};
use counterspell_core::types::{Block, EventPayload, Message, Role};

/// Replays one scripted event list per turn and records the history each
/// turn was called with.
struct ScriptedCaller {
    turns: Mutex<VecDeque<Vec<LlmEvent>>>,
    histories: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedCaller {
    fn new(turns: Vec<Vec<LlmEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            histories: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmCaller for ScriptedCaller {
    async fn stream(
        &self,
        _system: &str,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<LlmStream> {
        self.histories.lock().unwrap().push(messages.to_vec());
        let events = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::BackendFailure("no scripted turn left".into()))?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            drop(tx);
            let _ = done_tx.send(Ok(()));
        });
        Ok(LlmStream {
            events: rx,
            done: done_rx,
        })
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

fn text_turn(text: &str, stop: StopReason) -> Vec<LlmEvent> {
    vec![
        LlmEvent::ContentStart {
            index: 0,
            kind: LlmBlockKind::Text,
        },
        LlmEvent::ContentDelta {
            index: 0,
            delta: LlmDelta::Text(text.into()),
        },
        LlmEvent::ContentEnd { index: 0 },
        LlmEvent::MessageEnd { stop_reason: stop },
    ]
}

fn tool_turn(tool: &str, input: serde_json::Value) -> Vec<LlmEvent> {
    vec![
        LlmEvent::ContentStart {
            index: 0,
            kind: LlmBlockKind::ToolUse {
                id: "tu_1".into(),
                name: tool.into(),
            },
        },
        LlmEvent::ContentDelta {
            index: 0,
            delta: LlmDelta::InputJson(input.to_string()),
        },
        LlmEvent::ContentEnd { index: 0 },
        LlmEvent::MessageEnd {
            stop_reason: StopReason::ToolUse,
        },
    ]
}

async fn drain_backend(
    backend: &mut NativeBackend,
    text: &str,
) -> (Vec<EventPayload>, Result<()>) {
    let mut stream = backend
        .stream(CancellationToken::new(), text)
        .await
        .unwrap();
    let mut events = Vec::new();
    while let Some(event) = stream.events.recv().await {
        events.push(event);
    }
    let outcome = stream
        .done
        .await
        .unwrap_or_else(|_| Err(Error::BackendFailure("no outcome".into())));
    (events, outcome)
}

#[tokio::test]
async fn loop_executes_tools_until_a_turn_has_none() {
    let dir = tempfile::tempdir().unwrap();
    let caller = ScriptedCaller::new(vec![
        tool_turn(
            "write",
            serde_json::json!({"path": "CHANGELOG.md", "content": "## Changelog\n"}),
        ),
        text_turn("Created CHANGELOG.md.", StopReason::EndTurn),
    ]);
    let mut backend = NativeBackend::new(
        Arc::clone(&caller) as Arc<dyn LlmCaller>,
        dir.path(),
        "anthropic/claude-sonnet-4-5",
    );

    let (events, outcome) = drain_backend(&mut backend, "add CHANGELOG.md").await;
    outcome.unwrap();

    // the tool actually ran in the worktree
    assert_eq!(
        std::fs::read_to_string(dir.path().join("CHANGELOG.md")).unwrap(),
        "## Changelog\n"
    );

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
            "tool_result",
            "message_start",
            "content_start",
            "content_delta",
            "content_end",
            "message_end",
            "done",
        ]
    );

    // tool_use input was assembled from the partial json
    let Some(EventPayload::ToolCall { name, input, .. }) =
        events.iter().find(|e| e.kind() == "tool_call")
    else {
        panic!("no tool_call");
    };
    assert_eq!(name, "write");
    assert_eq!(input["path"], "CHANGELOG.md");

    // second LLM call saw the expanded history: user, assistant, tool
    let histories = caller.histories.lock().unwrap();
    assert_eq!(histories.len(), 2);
    assert_eq!(histories[0].len(), 1);
    let roles: Vec<Role> = histories[1].iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);

    assert_eq!(backend.final_message(), "Created CHANGELOG.md.");
    assert!(backend.session_id().is_none());
}

#[tokio::test]
async fn tool_errors_feed_back_without_failing_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.txt"), "foo bar foo").unwrap();
    let caller = ScriptedCaller::new(vec![
        tool_turn(
            "edit",
            serde_json::json!({"path": "f.txt", "old": "foo", "new": "qux"}),
        ),
        text_turn("Could not edit unambiguously.", StopReason::EndTurn),
    ]);
    let mut backend = NativeBackend::new(
        Arc::clone(&caller) as Arc<dyn LlmCaller>,
        dir.path(),
        "anthropic/claude-sonnet-4-5",
    );

    let (events, outcome) = drain_backend(&mut backend, "rename foo").await;
    outcome.unwrap();

    // the ambiguous edit failed, the file is untouched, and the error text
    // was routed back to the model
    assert_eq!(
        std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "foo bar foo"
    );
    let Some(EventPayload::ToolResult { content, .. }) =
        events.iter().find(|e| e.kind() == "tool_result")
    else {
        panic!("no tool_result");
    };
    assert!(content.starts_with("error:"));
    assert!(content.contains("2 times"));
}

#[tokio::test]
async fn todos_tool_emits_todo_events_and_updates_state() {
    let dir = tempfile::tempdir().unwrap();
    let caller = ScriptedCaller::new(vec![
        tool_turn(
            "todos",
            serde_json::json!({"items": [
                {"content": "write file", "status": "in_progress", "active_form": "writing file"},
            ]}),
        ),
        text_turn("Working through the list.", StopReason::EndTurn),
    ]);
    let mut backend = NativeBackend::new(
        Arc::clone(&caller) as Arc<dyn LlmCaller>,
        dir.path(),
        "anthropic/claude-sonnet-4-5",
    );

    let (events, outcome) = drain_backend(&mut backend, "track progress").await;
    outcome.unwrap();

    let Some(EventPayload::Todo { items }) = events.iter().find(|e| e.kind() == "todo") else {
        panic!("no todo event");
    };
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, "in_progress");

    let todos = backend.todos();
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].content, "write file");
}

#[tokio::test]
async fn restore_state_then_empty_stream_preserves_messages() {
    let dir = tempfile::tempdir().unwrap();
    let caller = ScriptedCaller::new(vec![text_turn("done", StopReason::EndTurn)]);
    let mut backend = NativeBackend::new(
        Arc::clone(&caller) as Arc<dyn LlmCaller>,
        dir.path(),
        "anthropic/claude-sonnet-4-5",
    );
    drain_backend(&mut backend, "first").await.1.unwrap();
    let blob = backend.get_state();
    let messages = backend.messages();

    let caller2 = ScriptedCaller::new(vec![]);
    let mut restored = NativeBackend::new(
        Arc::clone(&caller2) as Arc<dyn LlmCaller>,
        dir.path(),
        "anthropic/claude-sonnet-4-5",
    );
    restored.restore_state(&blob).unwrap();
    assert_eq!(restored.messages(), messages);
}

#[tokio::test]
async fn cancellation_stops_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    // a caller that never sends events and never completes
    struct HangingCaller;
    #[async_trait]
    impl LlmCaller for HangingCaller {
        async fn stream(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> Result<LlmStream> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            // keep the channel halves alive so the stream stays open
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                drop(_tx);
                let _ = done_tx.send(Ok(()));
            });
            Ok(LlmStream {
                events: rx,
                done: done_rx,
            })
        }
        fn model(&self) -> &str {
            "hanging"
        }
    }

    let mut backend = NativeBackend::new(
        Arc::new(HangingCaller) as Arc<dyn LlmCaller>,
        dir.path(),
        "anthropic/claude-sonnet-4-5",
    );
    let ctx = CancellationToken::new();
    let mut stream = backend.stream(ctx.clone(), "never finishes").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    ctx.cancel();

    let mut saw_error = false;
    while let Some(event) = stream.events.recv().await {
        if event.kind() == "error" {
            saw_error = true;
        }
    }
    assert!(saw_error);
    let outcome = stream.done.await.unwrap();
    assert!(matches!(outcome.unwrap_err(), Error::Cancelled));

    // the assistant message that never completed was not recorded
    assert_eq!(backend.messages().len(), 1);
    assert_eq!(backend.messages()[0].role, Role::User);
}

#[tokio::test]
async fn multi_block_turn_preserves_block_order() {
    let dir = tempfile::tempdir().unwrap();
    let caller = ScriptedCaller::new(vec![vec![
        LlmEvent::ContentStart {
            index: 0,
            kind: LlmBlockKind::Thinking,
        },
        LlmEvent::ContentDelta {
            index: 0,
            delta: LlmDelta::Thinking("planning".into()),
        },
        LlmEvent::ContentEnd { index: 0 },
        LlmEvent::ContentStart {
            index: 1,
            kind: LlmBlockKind::Text,
        },
        LlmEvent::ContentDelta {
            index: 1,
            delta: LlmDelta::Text("the answer".into()),
        },
        LlmEvent::ContentEnd { index: 1 },
        LlmEvent::MessageEnd {
            stop_reason: StopReason::EndTurn,
        },
    ]]);
    let mut backend = NativeBackend::new(
        Arc::clone(&caller) as Arc<dyn LlmCaller>,
        dir.path(),
        "anthropic/claude-sonnet-4-5",
    );
    let (events, outcome) = drain_backend(&mut backend, "think first").await;
    outcome.unwrap();

    let Some(EventPayload::MessageEnd { blocks, .. }) =
        events.iter().find(|e| e.kind() == "message_end")
    else {
        panic!("no message_end");
    };
    assert_eq!(
        blocks,
        &vec![
            Block::Thinking {
                text: "planning".into()
            },
            Block::Text {
                text: "the answer".into()
            },
        ]
    );
    // thinking does not leak into the final message
    assert_eq!(backend.final_message(), "the answer");
}

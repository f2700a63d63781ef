use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{BackendKind, EventPayload, Message, Settings, Task, TodoItem};

/// Events channel + completion signal for one task turn.
///
/// The events channel carries the uniform kinds in message-bracketed order
/// and closes after exactly one `done` or `error`; the same outcome is
/// mirrored on `done`.
#[derive(Debug)]
pub struct EventStream {
    pub events: mpsc::Receiver<EventPayload>,
    pub done: oneshot::Receiver<Result<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub kind: BackendKind,
    pub version: String,
}

/// One agent backend instance, bound to a single task's worktree.
///
/// Callers never invoke `stream`/`run` concurrently on the same instance;
/// the orchestrator owns each instance exclusively inside its pump.
#[async_trait]
pub trait AgentBackend: Send {
    /// Execute one turn, producing the uniform event stream. Cancelling
    /// `ctx` must close the stream promptly and terminate any child
    /// process.
    async fn stream(&mut self, ctx: CancellationToken, text: &str) -> Result<EventStream>;

    /// Execute one turn, draining the stream internally.
    async fn run(&mut self, ctx: CancellationToken, text: &str) -> Result<()> {
        let mut stream = self.stream(ctx, text).await?;
        while stream.events.recv().await.is_some() {}
        match stream.done.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::BackendFailure("stream closed without outcome".into())),
        }
    }

    /// Idempotent teardown.
    async fn close(&mut self) -> Result<()>;

    /// Serialized conversation blob, opaque to everything but this backend
    /// kind.
    fn get_state(&self) -> String;

    /// Replace the in-memory conversation. Must be called before the first
    /// `stream`.
    fn restore_state(&mut self, blob: &str) -> Result<()>;

    /// Current conversation view.
    fn messages(&self) -> Vec<Message>;

    /// Accumulated assistant text.
    fn final_message(&self) -> String;

    /// Backend-tracked tasklist; empty for backends that keep none.
    fn todos(&self) -> Vec<TodoItem> {
        Vec::new()
    }

    fn info(&self) -> BackendInfo;

    /// Continuation handle, empty until the backend emits one.
    fn session_id(&self) -> Option<String>;
}

/// Constructs backend instances for the orchestrator. The concrete factory
/// lives with the backend implementations; the core only sees this seam.
pub trait BackendFactory: Send + Sync {
    fn create(&self, task: &Task, settings: &Settings) -> Result<Box<dyn AgentBackend>>;
}

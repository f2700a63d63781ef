use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use counterspell_core::backend::{AgentBackend, BackendInfo, EventStream};
use counterspell_core::error::{Error, Result};
use counterspell_core::types::{BackendKind, EventPayload, Message, Settings, TodoItem};

use crate::normalize::{shared_conversation, SharedConversation, StreamNormalizer};
use crate::subprocess::{kill_with_grace, restore_message_blob, state_blob, stderr_tail_message};
use crate::wire::{tool_result_text, ClaudeBlock, ClaudeEnvelope};

/// Lines of stderr retained for the failure message.
const STDERR_TAIL: usize = 20;

/// Runs Claude Code as a subprocess, normalizing its
/// `--output-format stream-json` NDJSON to the uniform event stream.
pub struct ClaudeCodeBackend {
    bin: String,
    model_id: String,
    worktree: PathBuf,
    env: Vec<(String, String)>,
    shared: SharedConversation,
    stream_token: Option<CancellationToken>,
    closed: bool,
}

impl ClaudeCodeBackend {
    pub fn new(
        bin: impl Into<String>,
        model_id: impl Into<String>,
        worktree: impl Into<PathBuf>,
        settings: &Settings,
    ) -> Self {
        let mut env = Vec::new();
        if !settings.anthropic_base_url.is_empty() {
            env.push(("ANTHROPIC_BASE_URL".to_string(), settings.anthropic_base_url.clone()));
        }
        if !settings.anthropic_auth_token.is_empty() {
            env.push(("ANTHROPIC_AUTH_TOKEN".to_string(), settings.anthropic_auth_token.clone()));
        } else if !settings.anthropic_api_key.is_empty() {
            env.push(("ANTHROPIC_API_KEY".to_string(), settings.anthropic_api_key.clone()));
        }
        Self {
            bin: bin.into(),
            model_id: model_id.into(),
            worktree: worktree.into(),
            env,
            shared: shared_conversation(),
            stream_token: None,
            closed: false,
        }
    }

    /// Seed the continuation handle before the first stream.
    pub fn with_session(self, session_id: Option<String>) -> Self {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).session_id = session_id;
        self
    }

    /// `provider/model` → bare model id for the CLI flag.
    fn cli_model(&self) -> &str {
        self.model_id.rsplit('/').next().unwrap_or(&self.model_id)
    }

    fn build_args(&self, session_id: Option<&str>, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--model".to_string(),
            self.cli_model().to_string(),
        ];
        if let Some(sid) = session_id {
            args.push("-r".to_string());
            args.push(sid.to_string());
        }
        args.push("--".to_string());
        args.push(prompt.to_string());
        args
    }
}

#[async_trait]
impl AgentBackend for ClaudeCodeBackend {
    async fn stream(&mut self, ctx: CancellationToken, text: &str) -> Result<EventStream> {
        if self.closed {
            return Err(Error::Conflict("backend already closed".into()));
        }
        let session_id = {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.messages.push(Message::user(text));
            shared.session_id.clone()
        };

        let args = self.build_args(session_id.as_deref(), text);
        info!(
            model = self.cli_model(),
            session = session_id.as_deref().unwrap_or(""),
            worktree = %self.worktree.display(),
            "spawning claude subprocess"
        );

        let mut cmd = Command::new(&self.bin);
        cmd.args(&args)
            .current_dir(&self.worktree)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::BackendFailure(format!("spawn {}: {e}", self.bin)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("claude stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("claude stderr not piped".into()))?;

        self.stream_token = Some(ctx.clone());
        let (tx, rx) = mpsc::channel::<EventPayload>(256);
        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let mut norm = StreamNormalizer::new(tx.clone(), shared);
            let mut stdout_lines = BufReader::new(stdout).lines();
            let mut stderr_lines = BufReader::new(stderr).lines();
            let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
            let mut stderr_open = true;
            let mut result_error: Option<String> = None;
            let mut finished = false;

            let outcome: Result<()> = loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        kill_with_grace(&mut child).await;
                        break Err(Error::Cancelled);
                    }
                    line = stdout_lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.is_empty() {
                                continue;
                            }
                            let envelope: ClaudeEnvelope = match serde_json::from_str(&line) {
                                Ok(e) => e,
                                Err(_) => continue,
                            };
                            match envelope {
                                ClaudeEnvelope::System(sys) => {
                                    if let Some(sid) = sys.session_id.as_deref() {
                                        norm.session(sid).await;
                                    }
                                }
                                ClaudeEnvelope::Assistant(a) => {
                                    if let Some(sid) = a.session_id.as_deref() {
                                        norm.session(sid).await;
                                    }
                                    let blocks = a.message.and_then(|m| m.content).unwrap_or_default();
                                    for block in blocks {
                                        match block {
                                            ClaudeBlock::Text { text } => {
                                                norm.text_fragment(&text).await;
                                            }
                                            ClaudeBlock::ToolUse { id, name, input } => {
                                                norm.tool_call(&id, &name, input).await;
                                            }
                                            ClaudeBlock::Thinking { .. }
                                            | ClaudeBlock::ToolResult { .. }
                                            | ClaudeBlock::Unknown => {}
                                        }
                                    }
                                }
                                ClaudeEnvelope::User(u) => {
                                    let blocks = u.message.and_then(|m| m.content).unwrap_or_default();
                                    for block in blocks {
                                        if let ClaudeBlock::ToolResult { tool_use_id, content, .. } = block {
                                            let text = content
                                                .as_ref()
                                                .map(tool_result_text)
                                                .unwrap_or_default();
                                            norm.tool_result(&tool_use_id, text).await;
                                        }
                                    }
                                }
                                ClaudeEnvelope::Result(res) => {
                                    if let Some(sid) = res.session_id.as_deref() {
                                        norm.session(sid).await;
                                    }
                                    if res.is_error == Some(true) {
                                        result_error = Some(
                                            res.result.clone().unwrap_or_else(|| "agent reported an error".into()),
                                        );
                                    }
                                    norm.finish(res.result.as_deref()).await;
                                    finished = true;
                                }
                                ClaudeEnvelope::Unknown => {}
                            }
                        }
                        Ok(None) => {
                            while let Ok(Some(l)) = stderr_lines.next_line().await {
                                if stderr_tail.len() >= STDERR_TAIL {
                                    stderr_tail.pop_front();
                                }
                                stderr_tail.push_back(l);
                            }
                            let status = match child.wait().await {
                                Ok(s) => s,
                                Err(e) => break Err(Error::BackendFailure(format!("wait: {e}"))),
                            };
                            if !finished {
                                norm.finish(None).await;
                            }
                            if let Some(msg) = result_error.take() {
                                break Err(Error::BackendFailure(msg));
                            }
                            if status.success() {
                                break Ok(());
                            }
                            break Err(Error::BackendFailure(stderr_tail_message(
                                "claude", status.code(), &stderr_tail,
                            )));
                        }
                        Err(e) => {
                            kill_with_grace(&mut child).await;
                            break Err(Error::BackendFailure(format!("read stdout: {e}")));
                        }
                    },
                    line = stderr_lines.next_line(), if stderr_open => match line {
                        Ok(Some(l)) => {
                            if !l.is_empty() {
                                warn!("claude stderr: {l}");
                                if stderr_tail.len() >= STDERR_TAIL {
                                    stderr_tail.pop_front();
                                }
                                stderr_tail.push_back(l);
                            }
                        }
                        _ => stderr_open = false,
                    }
                }
            };

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
        Vec::new()
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::ClaudeCode,
            version: "stream-json".into(),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).session_id.clone()
    }
}

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
use counterspell_core::types::{BackendKind, EventPayload, Message, Settings};

use crate::normalize::{shared_conversation, SharedConversation, StreamNormalizer};
use crate::subprocess::{kill_with_grace, restore_message_blob, state_blob, stderr_tail_message};
use crate::wire::{CodexEnvelope, CodexItem};

const STDERR_TAIL: usize = 20;

/// Runs Codex as a subprocess via `codex exec --json --full-auto`,
/// normalizing its thread/turn/item envelopes to the uniform stream.
pub struct CodexBackend {
    bin: String,
    model_id: String,
    worktree: PathBuf,
    env: Vec<(String, String)>,
    shared: SharedConversation,
    stream_token: Option<CancellationToken>,
    closed: bool,
}

impl CodexBackend {
    pub fn new(
        bin: impl Into<String>,
        model_id: impl Into<String>,
        worktree: impl Into<PathBuf>,
        settings: &Settings,
    ) -> Self {
        let mut env = Vec::new();
        if !settings.openai_api_key.is_empty() {
            env.push(("OPENAI_API_KEY".to_string(), settings.openai_api_key.clone()));
        }
        if !settings.openai_base_url.is_empty() {
            env.push(("OPENAI_BASE_URL".to_string(), settings.openai_base_url.clone()));
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

    pub fn with_session(self, session_id: Option<String>) -> Self {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).session_id = session_id;
        self
    }

    fn cli_model(&self) -> &str {
        self.model_id.rsplit('/').next().unwrap_or(&self.model_id)
    }

    /// Continuation replays the captured session id through `exec resume`.
    fn build_args(&self, session_id: Option<&str>, prompt: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if session_id.is_some() {
            args.push("resume".to_string());
        }
        args.push("--json".to_string());
        args.push("--full-auto".to_string());
        args.push("--cd".to_string());
        args.push(self.worktree.to_string_lossy().into_owned());
        args.push("--model".to_string());
        args.push(self.cli_model().to_string());
        if let Some(sid) = session_id {
            args.push(sid.to_string());
        }
        args.push(prompt.to_string());
        args
    }

    async fn handle_item(norm: &mut StreamNormalizer, item: &CodexItem) {
        let item_type = item.item_type.as_deref().unwrap_or("");
        match item_type {
            "agent_message" => {
                if let Some(text) = item.text.as_deref() {
                    norm.text_fragment(text).await;
                }
            }
            "command_execution" => {
                let id = item.id.clone().unwrap_or_else(|| "cmd".to_string());
                let command = item.command.clone().unwrap_or_default();
                norm.tool_call(&id, "bash", serde_json::json!({ "command": command }))
                    .await;
                let mut output = item.aggregated_output.clone().unwrap_or_default();
                if let Some(code) = item.exit_code {
                    if code != 0 {
                        output.push_str(&format!("\n(exit code {code})"));
                    }
                }
                norm.tool_result(&id, output).await;
            }
            // reasoning, file_change, todo_list etc. carry no uniform
            // counterpart worth surfacing beyond their side effects
            _ => {}
        }
    }
}

#[async_trait]
impl AgentBackend for CodexBackend {
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
            "spawning codex subprocess"
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
            .ok_or_else(|| Error::Internal("codex stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("codex stderr not piped".into()))?;

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
            let mut turn_error: Option<String> = None;

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
                            let envelope: CodexEnvelope = match serde_json::from_str(&line) {
                                Ok(e) => e,
                                Err(_) => continue,
                            };
                            match envelope {
                                CodexEnvelope::ThreadStarted { thread_id } => {
                                    norm.session(&thread_id).await;
                                }
                                CodexEnvelope::ItemCompleted { item } => {
                                    Self::handle_item(&mut norm, &item).await;
                                }
                                CodexEnvelope::TurnFailed { error } => {
                                    turn_error = Some(
                                        error
                                            .and_then(|e| e.message)
                                            .unwrap_or_else(|| "turn failed".into()),
                                    );
                                }
                                CodexEnvelope::StreamError { message } => {
                                    turn_error =
                                        Some(message.unwrap_or_else(|| "stream error".into()));
                                }
                                CodexEnvelope::TurnStarted
                                | CodexEnvelope::TurnCompleted
                                | CodexEnvelope::ItemStarted { .. }
                                | CodexEnvelope::ItemUpdated { .. }
                                | CodexEnvelope::Unknown => {}
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
                            norm.finish(None).await;
                            if let Some(msg) = turn_error.take() {
                                break Err(Error::BackendFailure(msg));
                            }
                            if status.success() {
                                break Ok(());
                            }
                            break Err(Error::BackendFailure(stderr_tail_message(
                                "codex", status.code(), &stderr_tail,
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
                                warn!("codex stderr: {l}");
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

    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Codex,
            version: "exec-json".into(),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).session_id.clone()
    }
}

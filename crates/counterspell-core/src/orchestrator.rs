use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{AgentBackend, BackendFactory};
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::github::GitHubClient;
use crate::store::Store;
use crate::types::{
    new_task_id, BackendKind, EventPayload, RepoRef, Role, Task, TaskStatus,
};
use crate::worktree::{ConflictFile, WorktreeManager};

/// Grace given to a stream to close after cancellation before the pump
/// stops waiting for it.
const CANCEL_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StartTaskRequest {
    pub repo: RepoRef,
    pub intent: String,
    pub model_id: Option<String>,
    pub backend_kind: Option<BackendKind>,
}

struct ActiveTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The control plane: owns the task state machine, spawns backends,
/// bridges backend events to persistence and the event bus, and handles
/// cancellation, shutdown, retries, and continuations.
pub struct Orchestrator {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub worktrees: Arc<WorktreeManager>,
    factory: Arc<dyn BackendFactory>,
    github: GitHubClient,
    config: Arc<Config>,
    active: Mutex<HashMap<String, ActiveTask>>,
    /// Fair semaphore: excess starts queue FIFO until a slot frees.
    slots: Arc<Semaphore>,
    shutdown_token: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        worktrees: Arc<WorktreeManager>,
        factory: Arc<dyn BackendFactory>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Arc::new(Self {
            store,
            bus,
            worktrees,
            factory,
            github: GitHubClient::new(),
            config,
            active: Mutex::new(HashMap::new()),
            slots,
            shutdown_token: CancellationToken::new(),
        })
    }

    pub async fn active_task_count(&self) -> usize {
        self.active.lock().await.len()
    }

    // ── Event plumbing ────────────────────────────────────────────────────

    /// Publish on the bus and persist to the replay log.
    fn emit(&self, task_id: &str, payload: EventPayload) {
        let event = self.bus.publish(task_id, payload);
        if let Err(e) = self.store.insert_event(&event) {
            warn!(task_id, "persist event: {e}");
        }
    }

    fn set_status(&self, task_id: &str, status: TaskStatus, fail_reason: Option<&str>) -> Result<()> {
        self.store.update_task_status(task_id, status, fail_reason)?;
        self.emit(task_id, EventPayload::Status { status });
        Ok(())
    }

    // ── StartTask ─────────────────────────────────────────────────────────

    /// Create a task and kick off provisioning + the first turn. Returns
    /// the task id immediately; progress is observed via the event bus.
    pub async fn start_task(self: &Arc<Self>, req: StartTaskRequest) -> Result<String> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::Conflict("orchestrator is shutting down".into()));
        }
        if req.intent.trim().is_empty() {
            return Err(Error::InvalidInput("intent must not be empty".into()));
        }
        if req.repo.owner.is_empty() || req.repo.repo.is_empty() || req.repo.base_branch.is_empty() {
            return Err(Error::InvalidInput("repository reference is incomplete".into()));
        }

        let settings = self.store.get_settings()?;
        let backend_kind = req.backend_kind.unwrap_or_else(|| {
            BackendKind::parse(&settings.default_backend)
                .or_else(|_| BackendKind::parse(&self.config.backend))
                .unwrap_or(BackendKind::ClaudeCode)
        });
        let model_id = req
            .model_id
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                if settings.default_model.is_empty() {
                    self.config.model.clone()
                } else {
                    settings.default_model.clone()
                }
            });

        let id = new_task_id();
        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            intent: req.intent.clone(),
            repo: req.repo,
            status: TaskStatus::Pending,
            worktree_path: None,
            branch_name: Task::branch_for(&id),
            base_commit: None,
            model_id,
            backend_kind,
            session_id: None,
            conversation_state: None,
            final_message: String::new(),
            pr_url: None,
            fail_reason: None,
            conflict_files: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_task(&task)?;
        self.store
            .append_message(&id, Role::User, &crate::types::Message::user(&req.intent).blocks)?;
        self.emit(&id, EventPayload::Status { status: TaskStatus::Pending });

        info!(task_id = %id, backend = %task.backend_kind, "task created");
        self.spawn_execution(id.clone(), req.intent, true).await;
        Ok(id)
    }

    /// Continue a non-terminal task with a follow-up turn, restoring the
    /// backend of the same kind from persisted state.
    pub async fn continue_task(self: &Arc<Self>, task_id: &str, follow_up: &str) -> Result<()> {
        if follow_up.trim().is_empty() {
            return Err(Error::InvalidInput("follow-up must not be empty".into()));
        }
        let task = self.store.get_task(task_id)?;
        if task.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "task {task_id} is {} and cannot continue",
                task.status
            )));
        }
        if self.active.lock().await.contains_key(task_id) {
            return Err(Error::Conflict(format!("task {task_id} is already running")));
        }
        if task.worktree_path.is_none() {
            return Err(Error::Conflict(format!("task {task_id} was never provisioned")));
        }

        self.store.append_message(
            task_id,
            Role::User,
            &crate::types::Message::user(follow_up).blocks,
        )?;
        self.set_status(task_id, TaskStatus::InProgress, None)?;
        self.spawn_execution(task_id.to_string(), follow_up.to_string(), false)
            .await;
        Ok(())
    }

    async fn spawn_execution(self: &Arc<Self>, task_id: String, text: String, provision: bool) {
        let cancel = self.shutdown_token.child_token();
        let this = Arc::clone(self);
        let id_for_map = task_id.clone();
        let token_for_map = cancel.clone();
        // the pump must not start (and thus must not deregister) before the
        // active-map entry exists
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            this.execute(&task_id, &text, provision, cancel.clone()).await;
            this.active.lock().await.remove(&task_id);
        });
        self.active.lock().await.insert(
            id_for_map,
            ActiveTask {
                cancel: token_for_map,
                handle,
            },
        );
        let _ = registered_tx.send(());
    }

    // ── Execution ─────────────────────────────────────────────────────────

    async fn execute(self: &Arc<Self>, task_id: &str, text: &str, provision: bool, cancel: CancellationToken) {
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    self.finish_failed(task_id, "cancelled", "orchestrator shut down");
                    return;
                }
            },
            _ = cancel.cancelled() => {
                self.emit(task_id, EventPayload::Error { message: "cancelled".into() });
                self.emit(task_id, EventPayload::Done);
                self.finish_failed(task_id, "cancelled", "cancelled while queued");
                return;
            }
        };
        let _permit = permit;

        if provision {
            if let Err(e) = self.provision(task_id, &cancel).await {
                let reason = if cancel.is_cancelled() || e.is_cancelled() {
                    "cancelled"
                } else {
                    "provision"
                };
                self.emit(task_id, EventPayload::Error { message: e.user_message() });
                self.emit(task_id, EventPayload::Done);
                self.finish_failed(task_id, reason, &e.to_string());
                return;
            }
        }

        let task = match self.store.get_task(task_id) {
            Ok(t) => t,
            Err(e) => {
                error!(task_id, "load task for execution: {e}");
                return;
            }
        };
        let settings = match self.store.get_settings() {
            Ok(s) => s,
            Err(e) => {
                self.finish_failed(task_id, "settings", &e.to_string());
                return;
            }
        };

        let mut backend = match self.factory.create(&task, &settings) {
            Ok(b) => b,
            Err(e) => {
                self.emit(task_id, EventPayload::Error { message: e.user_message() });
                self.emit(task_id, EventPayload::Done);
                self.finish_failed(task_id, "backend", &e.to_string());
                return;
            }
        };
        if let Some(blob) = task.conversation_state.as_deref() {
            if let Err(e) = backend.restore_state(blob) {
                warn!(task_id, "restore conversation state: {e}");
            }
        }

        let outcome = self.pump_turn(task_id, backend.as_mut(), text, &cancel).await;

        // Persist whatever the backend accumulated, regardless of outcome.
        let state = backend.get_state();
        let session = backend.session_id();
        if let Err(e) = self
            .store
            .update_task_conversation(task_id, &state, session.as_deref())
        {
            warn!(task_id, "persist conversation state: {e}");
        }
        let final_message = backend.final_message();
        if !final_message.is_empty() {
            if let Err(e) = self.store.update_task_final_message(task_id, &final_message) {
                warn!(task_id, "persist final message: {e}");
            }
        }
        if let Err(e) = backend.close().await {
            warn!(task_id, "backend close: {e}");
        }

        // A discard may have won the race while we were draining.
        let current = self.store.get_task(task_id).map(|t| t.status).ok();
        if matches!(current, Some(s) if s.is_terminal()) {
            return;
        }

        match outcome {
            TurnOutcome::Completed => {
                info!(task_id, "turn complete, task in review");
                let _ = self.set_status(task_id, TaskStatus::Review, None);
            }
            TurnOutcome::Cancelled => {
                self.finish_failed(task_id, "cancelled", "cancelled");
            }
            TurnOutcome::TimedOut => {
                self.finish_failed(task_id, "cancelled", "turn timeout exceeded");
            }
            TurnOutcome::Failed(msg) => {
                self.finish_failed(task_id, "backend", &msg);
            }
        }
    }

    async fn provision(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        let token = self.github_token();

        // Fetch transients are retried with bounded backoff; the coalescer
        // inside ensure_clone keeps concurrent calls to one fetch.
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.worktrees.ensure_clone(&task.repo, token.as_deref()).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt + 1 < self.config.fetch_retries => {
                    attempt += 1;
                    warn!(task_id, attempt, "ensure_clone transient, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(500 * (1 << attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }

        self.set_status(task_id, TaskStatus::Planning, None)?;

        let info = self.worktrees.create_worktree(&task.repo, task_id).await?;
        self.store.update_task_worktree(
            task_id,
            &info.path.to_string_lossy(),
            &info.base_commit,
        )?;
        self.set_status(task_id, TaskStatus::InProgress, None)?;
        Ok(())
    }

    /// Bridge one backend stream to persistence and the event bus.
    async fn pump_turn(
        &self,
        task_id: &str,
        backend: &mut dyn AgentBackend,
        text: &str,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let turn_token = cancel.child_token();
        let mut stream = match backend.stream(turn_token.clone(), text).await {
            Ok(s) => s,
            Err(e) => {
                self.emit(task_id, EventPayload::Error { message: e.user_message() });
                self.emit(task_id, EventPayload::Done);
                return TurnOutcome::Failed(e.to_string());
            }
        };

        let turn_timeout = tokio::time::sleep(Duration::from_secs(self.config.turn_timeout_s));
        tokio::pin!(turn_timeout);
        let drain_deadline = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(drain_deadline);
        let mut draining = false;
        let mut timed_out = false;
        let mut emitted_error = false;
        let mut emitted_done = false;

        loop {
            tokio::select! {
                () = &mut turn_timeout, if !timed_out && !draining => {
                    warn!(task_id, "turn timeout, cancelling stream");
                    timed_out = true;
                    turn_token.cancel();
                    draining = true;
                    drain_deadline.as_mut().reset(tokio::time::Instant::now() + CANCEL_DRAIN_GRACE);
                }
                _ = cancel.cancelled(), if !draining => {
                    draining = true;
                    drain_deadline.as_mut().reset(tokio::time::Instant::now() + CANCEL_DRAIN_GRACE);
                }
                () = &mut drain_deadline, if draining => {
                    warn!(task_id, "stream did not close within cancel grace");
                    break;
                }
                event = stream.events.recv() => match event {
                    Some(payload) => {
                        match &payload {
                            EventPayload::Error { .. } => emitted_error = true,
                            EventPayload::Done => emitted_done = true,
                            _ => {}
                        }
                        self.apply_event(task_id, &payload);
                        self.emit(task_id, payload);
                    }
                    None => break,
                }
            }
        }

        let done_result = match tokio::time::timeout(CANCEL_DRAIN_GRACE, stream.done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(Error::BackendFailure(
                "stream closed without an outcome".into(),
            )),
        };

        let outcome = if cancel.is_cancelled() {
            TurnOutcome::Cancelled
        } else if timed_out {
            TurnOutcome::TimedOut
        } else {
            match done_result {
                Ok(()) => TurnOutcome::Completed,
                Err(Error::Cancelled) => TurnOutcome::Cancelled,
                Err(e) => TurnOutcome::Failed(e.to_string()),
            }
        };

        // Exactly one error+done pair per failed stream, even when the
        // backend died without emitting its terminator.
        if !matches!(outcome, TurnOutcome::Completed) && !emitted_error {
            let message = match &outcome {
                TurnOutcome::Cancelled => "cancelled".to_string(),
                TurnOutcome::TimedOut => "turn timeout exceeded".to_string(),
                TurnOutcome::Failed(msg) => msg.clone(),
                TurnOutcome::Completed => unreachable!(),
            };
            self.emit(task_id, EventPayload::Error { message });
        }
        if !emitted_done {
            self.emit(task_id, EventPayload::Done);
        }
        outcome
    }

    /// Persistence side effects of a single stream event.
    fn apply_event(&self, task_id: &str, payload: &EventPayload) {
        match payload {
            EventPayload::MessageEnd { role, blocks, .. } => {
                if let Err(e) = self.store.append_message(task_id, *role, blocks) {
                    warn!(task_id, "append message: {e}");
                }
            }
            EventPayload::ToolResult { tool_use_id, content } => {
                let blocks = vec![crate::types::Block::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                }];
                if let Err(e) = self.store.append_message(task_id, Role::Tool, &blocks) {
                    warn!(task_id, "append tool result: {e}");
                }
            }
            EventPayload::Session { session_id } => {
                if let Err(e) = self.store.update_task_session(task_id, session_id) {
                    warn!(task_id, "persist session id: {e}");
                }
            }
            _ => {}
        }
    }

    fn finish_failed(&self, task_id: &str, reason: &str, detail: &str) {
        // a discard that already settled the task wins
        if let Ok(task) = self.store.get_task(task_id) {
            if task.status.is_terminal() {
                return;
            }
        }
        info!(task_id, reason, "task failed: {detail}");
        if let Err(e) = self.store.update_task_status(task_id, TaskStatus::Failed, Some(reason)) {
            warn!(task_id, "mark failed: {e}");
            return;
        }
        self.emit(task_id, EventPayload::Status { status: TaskStatus::Failed });
    }

    fn github_token(&self) -> Option<String> {
        if let Ok(Some(conn)) = self.store.get_github_connection() {
            return Some(conn.access_token);
        }
        if self.config.github_token.is_empty() {
            None
        } else {
            Some(self.config.github_token.clone())
        }
    }

    // ── Task actions ──────────────────────────────────────────────────────

    /// Cancel a running task's ctx; its pump records the failure.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let active = self.active.lock().await;
        match active.get(task_id) {
            Some(entry) => {
                entry.cancel.cancel();
                Ok(())
            }
            None => {
                // distinguish unknown tasks from merely-idle ones
                let task = self.store.get_task(task_id)?;
                Err(Error::Conflict(format!(
                    "task {task_id} is not running (status {})",
                    task.status
                )))
            }
        }
    }

    /// Start a fresh task with the same intent and repo; the original row
    /// is preserved.
    pub async fn retry_task(self: &Arc<Self>, task_id: &str) -> Result<String> {
        let original = self.store.get_task(task_id)?;
        self.start_task(StartTaskRequest {
            repo: original.repo,
            intent: original.intent,
            model_id: Some(original.model_id),
            backend_kind: Some(original.backend_kind),
        })
        .await
    }

    /// Merge the task branch into its base branch. Review-only.
    pub async fn merge_task(&self, task_id: &str) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(Error::Conflict(format!(
                "task {task_id} is {}, merge requires review",
                task.status
            )));
        }
        match self.worktrees.merge_task(&task).await {
            Ok(()) => {
                self.set_status(task_id, TaskStatus::Done, None)?;
                self.worktrees.cleanup_worktree(&task.repo, task_id).await;
                Ok(())
            }
            Err(Error::MergeConflict { files }) => {
                self.store.update_task_conflicts(task_id, &files)?;
                self.set_status(task_id, TaskStatus::ReviewConflict, None)?;
                Err(Error::MergeConflict { files })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn conflict_details(&self, task_id: &str) -> Result<Vec<ConflictFile>> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::ReviewConflict {
            return Err(Error::Conflict(format!(
                "task {task_id} has no merge in progress"
            )));
        }
        self.worktrees.conflict_details(&task, &task.conflict_files).await
    }

    pub async fn resolve_conflict(&self, task_id: &str, path: &str, content: &str) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::ReviewConflict {
            return Err(Error::Conflict(format!(
                "task {task_id} has no merge in progress"
            )));
        }
        self.worktrees.resolve_conflict(&task, path, content).await
    }

    pub async fn complete_merge(&self, task_id: &str) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::ReviewConflict {
            return Err(Error::Conflict(format!(
                "task {task_id} has no merge in progress"
            )));
        }
        self.worktrees.complete_merge(&task).await?;
        self.store.update_task_conflicts(task_id, &[])?;
        self.set_status(task_id, TaskStatus::Done, None)?;
        self.worktrees.cleanup_worktree(&task.repo, task_id).await;
        Ok(())
    }

    pub async fn abort_merge(&self, task_id: &str) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::ReviewConflict {
            return Err(Error::Conflict(format!(
                "task {task_id} has no merge in progress"
            )));
        }
        self.worktrees.abort_merge(&task).await?;
        self.store.update_task_conflicts(task_id, &[])?;
        self.set_status(task_id, TaskStatus::Review, None)?;
        Ok(())
    }

    /// Push the task branch and open a PR against the base branch.
    pub async fn create_pr(&self, task_id: &str) -> Result<String> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(Error::Conflict(format!(
                "task {task_id} is {}, PR requires review",
                task.status
            )));
        }
        let token = self
            .github_token()
            .ok_or_else(|| Error::InvalidInput("no GitHub token configured".into()))?;

        self.worktrees.push_task_branch(&task).await?;

        let title: String = task.intent.lines().next().unwrap_or("").chars().take(100).collect();
        let body = if task.final_message.is_empty() {
            "Automated implementation.".to_string()
        } else {
            task.final_message.clone()
        };
        let url = self
            .github
            .create_pull_request(
                &token,
                &task.repo.owner,
                &task.repo.repo,
                &task.branch_name,
                &task.repo.base_branch,
                &title,
                &body,
            )
            .await?;

        self.store.update_task_pr_url(task_id, &url)?;
        self.set_status(task_id, TaskStatus::Done, None)?;
        self.worktrees.cleanup_worktree(&task.repo, task_id).await;
        info!(task_id, url = %url, "opened pull request");
        Ok(url)
    }

    /// Abandon a task from any non-terminal state.
    pub async fn discard_task(&self, task_id: &str) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        if task.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }
        if let Some(entry) = self.active.lock().await.get(task_id) {
            entry.cancel.cancel();
        }
        // Mark first so a racing pump sees a terminal state and stands down.
        self.set_status(task_id, TaskStatus::Discarded, None)?;
        if task.worktree_path.is_some() {
            self.worktrees.cleanup_worktree(&task.repo, task_id).await;
        }
        Ok(())
    }

    pub async fn task_diff(&self, task_id: &str) -> Result<String> {
        let task = self.store.get_task(task_id)?;
        if task.worktree_path.is_none() {
            return Ok(String::new());
        }
        self.worktrees.get_diff(&task).await
    }

    // ── Shutdown ──────────────────────────────────────────────────────────

    /// Signal every active task, wait up to the grace period for pumps to
    /// drain and backends to close, then shut the bus down last.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.shutdown_token.cancel();

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut active = self.active.lock().await;
            active
                .drain()
                .map(|(id, entry)| {
                    entry.cancel.cancel();
                    (id, entry.handle)
                })
                .collect()
        };

        let grace = Duration::from_secs(self.config.shutdown_grace_s);
        for (task_id, handle) in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(task_id = %task_id, "pump did not drain within shutdown grace");
            }
        }
        self.bus.shutdown();
    }
}

enum TurnOutcome {
    Completed,
    Cancelled,
    TimedOut,
    Failed(String),
}

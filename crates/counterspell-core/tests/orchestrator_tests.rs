//! Orchestrator tests driven by a scripted backend, so lifecycle,
//! pumping, cancellation, and shutdown are exercised without any LLM or
//! vendor CLI. The happy-path test provisions against a real local git
//! "origin" exactly like the worktree tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use counterspell_core::backend::{AgentBackend, BackendFactory, BackendInfo, EventStream};
use counterspell_core::bus::EventBus;
use counterspell_core::config::Config;
use counterspell_core::error::{Error, Result};
use counterspell_core::orchestrator::{Orchestrator, StartTaskRequest};
use counterspell_core::store::Store;
use counterspell_core::types::{
    new_task_id, BackendKind, Block, EventPayload, Message, RepoRef, Role, Settings, Task,
    TaskStatus,
};
use counterspell_core::worktree::WorktreeManager;

// ── Scripted backend ──────────────────────────────────────────────────────

#[derive(Clone)]
enum Step {
    Emit(EventPayload),
    WriteFile { name: String, content: String },
    /// Block until the ctx cancels, then report a cancelled stream.
    WaitCancel,
}

#[derive(Clone)]
struct Script {
    steps: Vec<Step>,
    state: String,
}

impl Script {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            state: r#"{"messages":["scripted"]}"#.to_string(),
        }
    }

    fn simple_reply(text: &str) -> Self {
        Self::new(vec![
            Step::Emit(EventPayload::MessageStart {
                message_id: "m1".into(),
                role: Role::Assistant,
            }),
            Step::Emit(EventPayload::ContentStart {
                message_id: "m1".into(),
                block_type: "text".into(),
                block: Block::Text { text: String::new() },
            }),
            Step::Emit(EventPayload::ContentDelta {
                message_id: "m1".into(),
                block_type: "text".into(),
                delta: text.into(),
            }),
            Step::Emit(EventPayload::ContentEnd {
                message_id: "m1".into(),
                block_type: "text".into(),
                block: Block::Text { text: text.into() },
            }),
            Step::Emit(EventPayload::MessageEnd {
                message_id: "m1".into(),
                role: Role::Assistant,
                blocks: vec![Block::Text { text: text.into() }],
            }),
        ])
    }
}

struct ScriptedBackend {
    script: Script,
    worktree: Option<PathBuf>,
    restored: Arc<StdMutex<Vec<String>>>,
    session: Arc<StdMutex<Option<String>>>,
    final_message: String,
    messages: Vec<Message>,
    closed: Arc<StdMutex<bool>>,
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn stream(&mut self, ctx: CancellationToken, text: &str) -> Result<EventStream> {
        self.messages.push(Message::user(text));
        for step in &self.script.steps {
            if let Step::Emit(EventPayload::MessageEnd { blocks, role, .. }) = step {
                self.messages.push(Message {
                    role: *role,
                    blocks: blocks.clone(),
                });
                for block in blocks {
                    if let Block::Text { text } = block {
                        if !self.final_message.is_empty() {
                            self.final_message.push('\n');
                        }
                        self.final_message.push_str(text);
                    }
                }
            }
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let steps = self.script.steps.clone();
        let worktree = self.worktree.clone();
        let session = Arc::clone(&self.session);

        tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Emit(payload) => {
                        if let EventPayload::Session { session_id } = &payload {
                            *session.lock().unwrap() = Some(session_id.clone());
                        }
                        if tx.send(payload).await.is_err() {
                            return;
                        }
                    }
                    Step::WriteFile { name, content } => {
                        if let Some(dir) = &worktree {
                            let _ = std::fs::write(dir.join(name), content);
                        }
                    }
                    Step::WaitCancel => {
                        ctx.cancelled().await;
                        let _ = tx
                            .send(EventPayload::Error {
                                message: "cancelled".into(),
                            })
                            .await;
                        drop(tx);
                        let _ = done_tx.send(Err(Error::Cancelled));
                        return;
                    }
                }
            }
            let _ = tx.send(EventPayload::Done).await;
            drop(tx);
            let _ = done_tx.send(Ok(()));
        });

        Ok(EventStream {
            events: rx,
            done: done_rx,
        })
    }

    async fn close(&mut self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }

    fn get_state(&self) -> String {
        self.script.state.clone()
    }

    fn restore_state(&mut self, blob: &str) -> Result<()> {
        self.restored.lock().unwrap().push(blob.to_string());
        Ok(())
    }

    fn messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    fn final_message(&self) -> String {
        self.final_message.clone()
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Native,
            version: "scripted".into(),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session.lock().unwrap().clone()
    }
}

struct ScriptedFactory {
    scripts: StdMutex<VecDeque<Script>>,
    restored: Arc<StdMutex<Vec<String>>>,
    closed: Arc<StdMutex<bool>>,
}

impl ScriptedFactory {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(scripts.into()),
            restored: Arc::new(StdMutex::new(Vec::new())),
            closed: Arc::new(StdMutex::new(false)),
        })
    }
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, task: &Task, _settings: &Settings) -> Result<Box<dyn AgentBackend>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Internal("no script queued".into()))?;
        Ok(Box::new(ScriptedBackend {
            script,
            worktree: task.worktree_path.as_ref().map(PathBuf::from),
            restored: Arc::clone(&self.restored),
            session: Arc::new(StdMutex::new(task.session_id.clone())),
            final_message: String::new(),
            messages: Vec::new(),
            closed: Arc::clone(&self.closed),
        }))
    }
}

// ── Harness ───────────────────────────────────────────────────────────────

fn test_config(data_dir: &Path) -> Config {
    Config {
        data_dir: data_dir.to_string_lossy().into_owned(),
        web_bind: "127.0.0.1".into(),
        web_port: 0,
        model: "anthropic/claude-sonnet-4-5".into(),
        backend: "native".into(),
        anthropic_api_key: String::new(),
        anthropic_auth_token: String::new(),
        anthropic_base_url: String::new(),
        openai_api_key: String::new(),
        openai_base_url: String::new(),
        github_token: String::new(),
        claude_bin: "claude".into(),
        codex_bin: "codex".into(),
        max_concurrent_tasks: 4,
        turn_timeout_s: 30,
        shutdown_grace_s: 5,
        subscriber_stall_s: 30,
        fetch_retries: 2,
    }
}

struct Harness {
    _root: tempfile::TempDir,
    orchestrator: Arc<Orchestrator>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    factory: Arc<ScriptedFactory>,
}

fn harness(scripts: Vec<Script>, tweak: impl FnOnce(&mut Config)) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let store = Store::open_in_memory().unwrap();
    store.migrate().unwrap();
    let store = Arc::new(store);
    let bus = EventBus::new(Duration::from_secs(30));
    let worktrees = WorktreeManager::new(root.path().join("data"));
    let factory = ScriptedFactory::new(scripts);
    let mut config = test_config(root.path());
    tweak(&mut config);
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        worktrees,
        Arc::clone(&factory) as Arc<dyn BackendFactory>,
        Arc::new(config),
    );
    Harness {
        _root: root,
        orchestrator,
        store,
        bus,
        factory,
    }
}

/// Insert a task row that already went through provisioning.
fn provisioned_task(store: &Store, status: TaskStatus, worktree: &Path) -> Task {
    let id = new_task_id();
    let now = Utc::now();
    let task = Task {
        id: id.clone(),
        intent: "add CHANGELOG.md".into(),
        repo: RepoRef::new("acme", "widgets", "main"),
        status,
        worktree_path: Some(worktree.to_string_lossy().into_owned()),
        branch_name: Task::branch_for(&id),
        base_commit: Some("deadbeef".into()),
        model_id: "anthropic/claude-sonnet-4-5".into(),
        backend_kind: BackendKind::Native,
        session_id: None,
        conversation_state: Some(r#"{"messages":[]}"#.into()),
        final_message: String::new(),
        pr_url: None,
        fail_reason: None,
        conflict_files: Vec::new(),
        created_at: now,
        updated_at: now,
    };
    store.create_task(&task).unwrap();
    task
}

async fn wait_for_status(store: &Store, id: &str, status: TaskStatus) {
    for _ in 0..200 {
        if store.get_task(id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "task {id} never reached {status}, currently {}",
        store.get_task(id).unwrap().status
    );
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn continue_pumps_events_and_lands_in_review() {
    let script = Script::new({
        let mut steps = Script::simple_reply("Added the header.").steps;
        steps.push(Step::Emit(EventPayload::Session {
            session_id: "sess-9".into(),
        }));
        steps
    });
    let h = harness(vec![script], |_| {});
    let dir = tempfile::tempdir().unwrap();
    let task = provisioned_task(&h.store, TaskStatus::Review, dir.path());

    let (_sub, mut rx) = h.bus.subscribe();
    h.orchestrator
        .continue_task(&task.id, "also add a header")
        .await
        .unwrap();

    // first the status flip, then the bracketed message, then done
    let mut kinds = Vec::new();
    while let Some(event) = rx.recv().await {
        kinds.push(event.kind());
        if event.kind() == "done" {
            break;
        }
    }
    assert_eq!(
        kinds,
        vec![
            "status",
            "message_start",
            "content_start",
            "content_delta",
            "content_end",
            "message_end",
            "session",
            "done",
        ]
    );

    wait_for_status(&h.store, &task.id, TaskStatus::Review).await;
    let loaded = h.store.get_task(&task.id).unwrap();
    assert_eq!(loaded.session_id.as_deref(), Some("sess-9"));
    assert_eq!(loaded.final_message, "Added the header.");
    assert_eq!(
        loaded.conversation_state.as_deref(),
        Some(r#"{"messages":["scripted"]}"#)
    );

    // persisted state was handed to restore before streaming
    assert_eq!(
        h.factory.restored.lock().unwrap().as_slice(),
        &[r#"{"messages":[]}"#.to_string()]
    );
    assert!(*h.factory.closed.lock().unwrap());

    // messages: follow-up user turn + scripted assistant turn
    let messages = h.store.list_messages(&task.id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    let seqs: Vec<i64> = messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2]);

    // events were persisted for replay, in id order
    let events = h.store.list_events_since(0, Some(&task.id), 100).unwrap();
    assert!(events.len() >= kinds.len());
    let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
}

#[tokio::test]
async fn cancel_mid_stream_fails_with_single_error_done_pair() {
    let script = Script::new(vec![
        Step::Emit(EventPayload::MessageStart {
            message_id: "m1".into(),
            role: Role::Assistant,
        }),
        Step::Emit(EventPayload::ContentStart {
            message_id: "m1".into(),
            block_type: "text".into(),
            block: Block::Text { text: String::new() },
        }),
        Step::Emit(EventPayload::ContentDelta {
            message_id: "m1".into(),
            block_type: "text".into(),
            delta: "thinking about".into(),
        }),
        Step::WaitCancel,
    ]);
    let h = harness(vec![script], |_| {});
    let dir = tempfile::tempdir().unwrap();
    let task = provisioned_task(&h.store, TaskStatus::Review, dir.path());

    let (_sub, mut rx) = h.bus.subscribe();
    h.orchestrator.continue_task(&task.id, "go").await.unwrap();

    // wait until the stream is visibly mid-delta
    loop {
        let event = rx.recv().await.unwrap();
        if event.kind() == "content_delta" {
            break;
        }
    }
    h.orchestrator.cancel_task(&task.id).await.unwrap();
    wait_for_status(&h.store, &task.id, TaskStatus::Failed).await;

    let loaded = h.store.get_task(&task.id).unwrap();
    assert_eq!(loaded.fail_reason.as_deref(), Some("cancelled"));

    // drain everything that will ever arrive
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut errors = 0;
    let mut dones = 0;
    while let Some(event) = rx.try_recv() {
        match event.kind() {
            "error" => errors += 1,
            "done" => dones += 1,
            _ => {}
        }
    }
    assert_eq!(errors, 1);
    assert_eq!(dones, 1);
}

#[tokio::test]
async fn continue_is_rejected_on_terminal_and_empty_input() {
    let h = harness(vec![], |_| {});
    let dir = tempfile::tempdir().unwrap();
    let done_task = provisioned_task(&h.store, TaskStatus::Done, dir.path());

    let err = h
        .orchestrator
        .continue_task(&done_task.id, "more")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let review_task = provisioned_task(&h.store, TaskStatus::Review, dir.path());
    let err = h
        .orchestrator
        .continue_task(&review_task.id, "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = h.orchestrator.cancel_task(&review_task.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let err = h.orchestrator.merge_task(&done_task.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn turn_timeout_is_treated_as_cancellation() {
    let script = Script::new(vec![Step::WaitCancel]);
    let h = harness(vec![script], |c| c.turn_timeout_s = 1);
    let dir = tempfile::tempdir().unwrap();
    let task = provisioned_task(&h.store, TaskStatus::Review, dir.path());

    h.orchestrator.continue_task(&task.id, "go").await.unwrap();
    wait_for_status(&h.store, &task.id, TaskStatus::Failed).await;
    assert_eq!(
        h.store.get_task(&task.id).unwrap().fail_reason.as_deref(),
        Some("cancelled")
    );
}

#[tokio::test]
async fn shutdown_drains_active_pumps_and_closes_the_bus() {
    let script = Script::new(vec![Step::WaitCancel]);
    let h = harness(vec![script], |_| {});
    let dir = tempfile::tempdir().unwrap();
    let task = provisioned_task(&h.store, TaskStatus::Review, dir.path());

    h.orchestrator.continue_task(&task.id, "go").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.orchestrator.active_task_count().await, 1);

    h.orchestrator.shutdown().await;
    assert_eq!(h.orchestrator.active_task_count().await, 0);
    assert_eq!(h.store.get_task(&task.id).unwrap().status, TaskStatus::Failed);

    // bus shut down last: subscribers see end-of-stream
    let (_sub, mut rx) = h.bus.subscribe();
    assert!(rx.recv().await.is_none());

    // and new work is refused
    let err = h
        .orchestrator
        .start_task(StartTaskRequest {
            repo: RepoRef::new("acme", "widgets", "main"),
            intent: "x".into(),
            model_id: None,
            backend_kind: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn discard_cancels_and_wins_over_pump() {
    let script = Script::new(vec![Step::WaitCancel]);
    let h = harness(vec![script], |_| {});
    let dir = tempfile::tempdir().unwrap();
    let task = provisioned_task(&h.store, TaskStatus::Review, dir.path());

    h.orchestrator.continue_task(&task.id, "go").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.orchestrator.discard_task(&task.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        h.store.get_task(&task.id).unwrap().status,
        TaskStatus::Discarded
    );
}

#[tokio::test]
async fn start_task_validates_input() {
    let h = harness(vec![], |_| {});
    let err = h
        .orchestrator
        .start_task(StartTaskRequest {
            repo: RepoRef::new("acme", "widgets", "main"),
            intent: "   ".into(),
            model_id: None,
            backend_kind: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = h
        .orchestrator
        .start_task(StartTaskRequest {
            repo: RepoRef::new("", "widgets", "main"),
            intent: "do things".into(),
            model_id: None,
            backend_kind: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

// ── End-to-end happy path against a local git origin ─────────────────────

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[tokio::test]
async fn start_task_provisions_streams_and_reaches_review() {
    let root = tempfile::tempdir().unwrap();
    // local "origin"
    let remotes = root.path().join("remotes");
    let bare = remotes.join("acme").join("widgets.git");
    std::fs::create_dir_all(&bare).unwrap();
    git(&bare, &["init", "--bare", "--initial-branch=main", "."]);
    let seed = root.path().join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    git(&seed, &["init", "--initial-branch=main", "."]);
    std::fs::write(seed.join("README.md"), "# widgets\n").unwrap();
    git(&seed, &["add", "-A"]);
    git(&seed, &["commit", "-m", "initial"]);
    git(&seed, &["remote", "add", "origin", bare.to_str().unwrap()]);
    git(&seed, &["push", "origin", "main"]);

    let script = Script::new({
        let mut steps = vec![Step::WriteFile {
            name: "CHANGELOG.md".into(),
            content: "## Changelog\n".into(),
        }];
        steps.extend(Script::simple_reply("Created CHANGELOG.md.").steps);
        steps
    });

    let store = Store::open_in_memory().unwrap();
    store.migrate().unwrap();
    let store = Arc::new(store);
    let bus = EventBus::new(Duration::from_secs(30));
    let worktrees = WorktreeManager::with_remote_base(
        root.path().join("data"),
        remotes.to_string_lossy().into_owned(),
    );
    let factory = ScriptedFactory::new(vec![script]);
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        worktrees,
        Arc::clone(&factory) as Arc<dyn BackendFactory>,
        Arc::new(test_config(root.path())),
    );

    let (_sub, mut rx) = bus.subscribe();
    let id = orchestrator
        .start_task(StartTaskRequest {
            repo: RepoRef::new("acme", "widgets", "main"),
            intent: "add CHANGELOG.md".into(),
            model_id: None,
            backend_kind: Some(BackendKind::Native),
        })
        .await
        .unwrap();

    wait_for_status(&store, &id, TaskStatus::Review).await;

    // lifecycle statuses arrived in order on the bus
    let mut statuses = Vec::new();
    while let Some(event) = rx.try_recv() {
        if let EventPayload::Status { status } = event.payload {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Pending,
            TaskStatus::Planning,
            TaskStatus::InProgress,
            TaskStatus::Review
        ]
    );

    let task = store.get_task(&id).unwrap();
    assert!(task.worktree_path.is_some());
    assert!(task.base_commit.is_some());
    assert_eq!(task.final_message, "Created CHANGELOG.md.");

    // the scripted "agent" wrote a file; the diff must show it
    let diff = orchestrator.task_diff(&id).await.unwrap();
    assert!(diff.contains("CHANGELOG.md"));
    assert!(diff.contains("+## Changelog"));

    // merge completes the lifecycle
    git(
        &PathBuf::from(task.worktree_path.as_deref().unwrap()),
        &["add", "-A"],
    );
    git(
        &PathBuf::from(task.worktree_path.as_deref().unwrap()),
        &["commit", "-m", "changelog"],
    );
    orchestrator.merge_task(&id).await.unwrap();
    assert_eq!(store.get_task(&id).unwrap().status, TaskStatus::Done);
    let merged = git(&bare, &["show", "main:CHANGELOG.md"]);
    assert!(merged.contains("## Changelog"));
}

#[tokio::test]
async fn concurrency_cap_queues_excess_tasks_fifo() {
    let root = tempfile::tempdir().unwrap();
    let remotes = root.path().join("remotes");
    let bare = remotes.join("acme").join("widgets.git");
    std::fs::create_dir_all(&bare).unwrap();
    git(&bare, &["init", "--bare", "--initial-branch=main", "."]);
    let seed = root.path().join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    git(&seed, &["init", "--initial-branch=main", "."]);
    std::fs::write(seed.join("README.md"), "# widgets\n").unwrap();
    git(&seed, &["add", "-A"]);
    git(&seed, &["commit", "-m", "initial"]);
    git(&seed, &["remote", "add", "origin", bare.to_str().unwrap()]);
    git(&seed, &["push", "origin", "main"]);

    let store = Store::open_in_memory().unwrap();
    store.migrate().unwrap();
    let store = Arc::new(store);
    let bus = EventBus::new(Duration::from_secs(30));
    let worktrees = WorktreeManager::with_remote_base(
        root.path().join("data"),
        remotes.to_string_lossy().into_owned(),
    );
    let factory = ScriptedFactory::new(vec![
        Script::new(vec![Step::WaitCancel]),
        Script::new(Script::simple_reply("second done").steps),
    ]);
    let mut config = test_config(root.path());
    config.max_concurrent_tasks = 1;
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        worktrees,
        Arc::clone(&factory) as Arc<dyn BackendFactory>,
        Arc::new(config),
    );

    let request = |intent: &str| StartTaskRequest {
        repo: RepoRef::new("acme", "widgets", "main"),
        intent: intent.into(),
        model_id: None,
        backend_kind: Some(BackendKind::Native),
    };
    let first = orchestrator.start_task(request("first")).await.unwrap();
    wait_for_status(&store, &first, TaskStatus::InProgress).await;

    let second = orchestrator.start_task(request("second")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    // the slot is held: the second task has not begun provisioning
    assert_eq!(store.get_task(&second).unwrap().status, TaskStatus::Pending);

    orchestrator.cancel_task(&first).await.unwrap();
    wait_for_status(&store, &first, TaskStatus::Failed).await;
    wait_for_status(&store, &second, TaskStatus::Review).await;
}

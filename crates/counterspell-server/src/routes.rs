use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Json,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use counterspell_core::error::Error;
use counterspell_core::orchestrator::StartTaskRequest;
use counterspell_core::types::{BackendKind, EventPayload, RepoRef};

use crate::AppState;

// ── Error mapping ─────────────────────────────────────────────────────────

pub(crate) type ApiError = (StatusCode, Json<Value>);
pub(crate) type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn to_api_error(e: Error) -> ApiError {
    let status = match &e {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) | Error::MergeConflict { .. } => StatusCode::CONFLICT,
        Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Cancelled => StatusCode::CONFLICT,
        Error::BackendFailure(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {e}");
    }
    let mut body = json!({ "error": e.user_message() });
    if let Error::MergeConflict { files } = &e {
        body["conflict_files"] = json!(files);
    }
    (status, Json(body))
}

fn api<T>(result: counterspell_core::Result<T>) -> ApiResult<T> {
    result.map_err(to_api_error)
}

// ── Request bodies ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct CreateTaskBody {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub base_branch: String,
    pub intent: String,
    pub model_id: Option<String>,
    pub backend_kind: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Deserialize)]
pub(crate) struct ContinueBody {
    pub message: String,
}

#[derive(Deserialize)]
pub(crate) struct ResolveConflictBody {
    pub path: String,
    pub content: String,
}

#[derive(Deserialize)]
pub(crate) struct TasksQuery {
    pub owner: Option<String>,
    pub repo: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct EventsQuery {
    /// Replay starting point, overriding the Last-Event-ID header.
    pub after: Option<u64>,
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "active_tasks": state.orchestrator.active_task_count().await,
    }))
}

// ── Tasks ─────────────────────────────────────────────────────────────────

pub(crate) async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let backend_kind = match body.backend_kind.as_deref() {
        Some(s) => Some(api(BackendKind::parse(s))?),
        None => None,
    };
    let id = api(state
        .orchestrator
        .start_task(StartTaskRequest {
            repo: RepoRef::new(body.owner, body.repo, body.base_branch),
            intent: body.intent,
            model_id: body.model_id,
            backend_kind,
        })
        .await)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub(crate) async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TasksQuery>,
) -> ApiResult<Json<Value>> {
    let repo = match (q.owner, q.repo) {
        (Some(owner), Some(repo)) => Some(RepoRef::new(owner, repo, String::new())),
        _ => None,
    };
    let tasks = api(state.orchestrator.store.list_tasks(repo.as_ref()))?;
    Ok(Json(json!(tasks)))
}

pub(crate) async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let task = api(state.orchestrator.store.get_task(&id))?;
    Ok(Json(json!(task)))
}

pub(crate) async fn get_task_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    api(state.orchestrator.store.get_task(&id))?;
    let messages = api(state.orchestrator.store.list_messages(&id))?;
    Ok(Json(json!(messages)))
}

pub(crate) async fn get_task_diff(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let diff = api(state.orchestrator.task_diff(&id).await)?;
    Ok(Json(json!({ "diff": diff })))
}

pub(crate) async fn continue_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ContinueBody>,
) -> ApiResult<StatusCode> {
    api(state.orchestrator.continue_task(&id, &body.message).await)?;
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    api(state.orchestrator.cancel_task(&id).await)?;
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let new_id = api(state.orchestrator.retry_task(&id).await)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": new_id }))))
}

pub(crate) async fn merge_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    api(state.orchestrator.merge_task(&id).await)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn get_conflicts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let details = api(state.orchestrator.conflict_details(&id).await)?;
    Ok(Json(json!(details)))
}

pub(crate) async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveConflictBody>,
) -> ApiResult<StatusCode> {
    api(state
        .orchestrator
        .resolve_conflict(&id, &body.path, &body.content)
        .await)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn complete_merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    api(state.orchestrator.complete_merge(&id).await)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn abort_merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    api(state.orchestrator.abort_merge(&id).await)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn create_pr(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let url = api(state.orchestrator.create_pr(&id).await)?;
    Ok(Json(json!({ "pr_url": url })))
}

pub(crate) async fn discard_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    api(state.orchestrator.discard_task(&id).await)?;
    Ok(StatusCode::OK)
}

// ── Settings ──────────────────────────────────────────────────────────────

const SETTINGS_KEYS: &[&str] = &[
    "anthropic_api_key",
    "anthropic_auth_token",
    "anthropic_base_url",
    "openai_api_key",
    "openai_base_url",
    "default_backend",
    "default_model",
];

pub(crate) async fn get_settings(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let settings = api(state.orchestrator.store.get_settings())?;
    // keys are returned, secrets are masked
    Ok(Json(json!({
        "anthropic_api_key": mask(&settings.anthropic_api_key),
        "anthropic_auth_token": mask(&settings.anthropic_auth_token),
        "anthropic_base_url": settings.anthropic_base_url,
        "openai_api_key": mask(&settings.openai_api_key),
        "openai_base_url": settings.openai_base_url,
        "default_backend": settings.default_backend,
        "default_model": settings.default_model,
    })))
}

/// Last four characters only; counting chars rather than bytes keeps
/// non-ASCII secrets from splitting a UTF-8 boundary.
fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let count = secret.chars().count();
    let tail: String = secret.chars().skip(count.saturating_sub(4)).collect();
    format!("...{tail}")
}


pub(crate) async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> ApiResult<StatusCode> {
    let Some(map) = body.as_object() else {
        return Err(to_api_error(Error::InvalidInput("expected an object".into())));
    };
    for (key, value) in map {
        if !SETTINGS_KEYS.contains(&key.as_str()) {
            return Err(to_api_error(Error::InvalidInput(format!(
                "unknown setting {key:?}"
            ))));
        }
        let Some(value) = value.as_str() else {
            return Err(to_api_error(Error::InvalidInput(format!(
                "setting {key:?} must be a string"
            ))));
        };
        api(state.orchestrator.store.set_setting(key, value))?;
    }
    Ok(StatusCode::OK)
}

// ── SSE ───────────────────────────────────────────────────────────────────

fn parse_last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Subscribe to the bus, optionally replaying the persisted event log
/// from the client's last seen id before attaching live. Frames carry the
/// bus id so reconnects resume exactly.
fn event_stream(
    state: Arc<AppState>,
    task_filter: Option<String>,
    last_id: Option<u64>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    // subscribe before snapshotting the log so no event falls between
    let (sub_id, mut live_rx) = state.orchestrator.bus.subscribe();
    let replay = match last_id {
        Some(id) => state
            .orchestrator
            .store
            .list_events_since(id, task_filter.as_deref(), 10_000)
            .unwrap_or_default(),
        None => Vec::new(),
    };

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut last_sent = last_id.unwrap_or(0);
        for event in replay {
            last_sent = event.id;
            if tx.send(event).is_err() {
                state.orchestrator.bus.unsubscribe(sub_id);
                return;
            }
        }
        while let Some(event) = live_rx.recv().await {
            let is_gap = matches!(event.payload, EventPayload::Gap { .. });
            if let Some(filter) = &task_filter {
                if !is_gap && event.task_id != *filter {
                    continue;
                }
            }
            // skip live events already covered by the replay
            if !is_gap && event.id <= last_sent {
                continue;
            }
            last_sent = event.id.max(last_sent);
            if tx.send(event).is_err() {
                state.orchestrator.bus.unsubscribe(sub_id);
                return;
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event.payload).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, std::convert::Infallible>(
            SseEvent::default()
                .id(event.id.to_string())
                .event(event.kind())
                .data(data),
        )
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(10))
            .text("keepalive"),
    )
}

pub(crate) async fn sse_task_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<EventsQuery>,
    headers: HeaderMap,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let last_id = q.after.or_else(|| parse_last_event_id(&headers));
    event_stream(state, Some(id), last_id)
}

pub(crate) async fn sse_all_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventsQuery>,
    headers: HeaderMap,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let last_id = q.after.or_else(|| parse_last_event_id(&headers));
    event_stream(state, None, last_id)
}

/// Replays the log feed's ring, then streams live log lines.
pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // subscribe before snapshotting history to avoid a race
    let live_rx = state.logs.subscribe();
    let history = state.logs.history();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(SseEvent::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(10))
            .text("keepalive"),
    )
}

mod logging;
mod routes;

use std::{sync::Arc, time::Duration};

use axum::{
    routing::{get, post, put},
    Router,
};
use counterspell_agent::DefaultBackendFactory;
use counterspell_core::{
    bus::EventBus,
    config::Config,
    orchestrator::Orchestrator,
    store::Store,
    worktree::WorktreeManager,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use logging::LogFeed;

const LOG_HISTORY_LINES: usize = 500;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub logs: Arc<LogFeed>,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let logs = LogFeed::new(LOG_HISTORY_LINES);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "counterspell_server=info,counterspell_core=info,counterspell_agent=info,tower_http=warn"
            .into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::FeedLayer {
            feed: Arc::clone(&logs),
        })
        .init();

    let config = Arc::new(Config::from_env()?);

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/counterspell.db", config.data_dir);
    let store = Store::open(&db_path)?;
    store.migrate()?;

    // Seed settings from env on first run; DB values win afterwards.
    config.seed_settings(&store)?;

    // Tasks left mid-execution by a previous process are not auto-resumed.
    let orphaned = store.fail_running_tasks("process_exit")?;
    if orphaned > 0 {
        info!("startup reconciliation: marked {orphaned} orphaned tasks failed");
    }

    let store = Arc::new(store);
    let bus = EventBus::new(Duration::from_secs(config.subscriber_stall_s));
    // ids continue past the persisted log so SSE replay stays coherent
    bus.resume_from(store.max_event_id()?);
    let _reaper = bus.spawn_reaper(Duration::from_secs(5));
    let worktrees = WorktreeManager::new(&config.data_dir);
    let factory = DefaultBackendFactory::new(&config.claude_bin, &config.codex_bin);

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        worktrees,
        factory,
        Arc::clone(&config),
    );

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
        logs,
    });

    let app = Router::new()
        // Health
        .route("/api/health", get(routes::health))
        // Tasks
        .route("/api/tasks", get(routes::list_tasks).post(routes::create_task))
        .route("/api/tasks/:id", get(routes::get_task))
        .route("/api/tasks/:id/messages", get(routes::get_task_messages))
        .route("/api/tasks/:id/diff", get(routes::get_task_diff))
        .route("/api/tasks/:id/continue", post(routes::continue_task))
        .route("/api/tasks/:id/cancel", post(routes::cancel_task))
        .route("/api/tasks/:id/retry", post(routes::retry_task))
        .route("/api/tasks/:id/merge", post(routes::merge_task))
        .route("/api/tasks/:id/conflicts", get(routes::get_conflicts))
        .route("/api/tasks/:id/conflicts/resolve", post(routes::resolve_conflict))
        .route("/api/tasks/:id/merge/complete", post(routes::complete_merge))
        .route("/api/tasks/:id/merge/abort", post(routes::abort_merge))
        .route("/api/tasks/:id/pr", post(routes::create_pr))
        .route("/api/tasks/:id/discard", post(routes::discard_task))
        // SSE
        .route("/api/tasks/:id/events", get(routes::sse_task_events))
        .route("/api/events", get(routes::sse_all_events))
        .route("/api/logs", get(routes::sse_logs))
        // Settings
        .route("/api/settings", get(routes::get_settings))
        .route("/api/settings", put(routes::put_settings))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Graceful shutdown: drain pumps and subprocesses, bus last.
    let shutdown_orchestrator = Arc::clone(&orchestrator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_orchestrator.shutdown().await;
        })
        .await?;

    Ok(())
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};

/// Backing store for the `/api/logs` SSE endpoint: a bounded ring of
/// recent lines for replay plus a broadcast channel for the live tail.
pub struct LogFeed {
    tx: broadcast::Sender<String>,
    ring: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogFeed {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            tx,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn history(&self) -> Vec<String> {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn record(&self, line: String) {
        let _ = self.tx.send(line.clone());
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(line);
    }
}

/// One feed entry. `task_id` is present whenever the originating call
/// site carried one as a structured field, which lets clients filter the
/// firehose per task without parsing message text.
#[derive(Serialize)]
struct LogLine<'a> {
    ts_ms: u128,
    level: &'a str,
    subsystem: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    message: String,
}

/// Maps a tracing target onto the subsystem that owns it, following the
/// module layout of this workspace.
fn subsystem(target: &str) -> &'static str {
    let module = target.split("::").nth(1).unwrap_or(target);
    match module {
        "orchestrator" | "bus" => "orchestrator",
        "worktree" | "git" | "github" => "git",
        "store" => "store",
        "claude" | "codex" | "native" | "subprocess" | "normalize" => "backend",
        "llm" => "llm",
        _ => "server",
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    task_id: Option<String>,
}

impl FieldCollector {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = value,
            "task_id" => self.task_id = Some(value),
            _ => {}
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // Debug-formatted strings come quoted; the feed wants them bare.
        let rendered = format!("{value:?}");
        self.set(field.name(), rendered.trim_matches('"').to_string());
    }
}

/// tracing layer mirroring events into a [`LogFeed`].
pub struct FeedLayer {
    pub feed: Arc<LogFeed>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for FeedLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let metadata = event.metadata();
        if *metadata.level() == tracing::Level::TRACE {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let level = metadata.level().as_str().to_ascii_lowercase();
        let line = LogLine {
            ts_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
            level: &level,
            subsystem: subsystem(metadata.target()),
            task_id: fields.task_id,
            message: fields.message,
        };
        if let Ok(json) = serde_json::to_string(&line) {
            self.feed.record(json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_follows_module_layout() {
        assert_eq!(subsystem("counterspell_core::orchestrator"), "orchestrator");
        assert_eq!(subsystem("counterspell_core::worktree"), "git");
        assert_eq!(subsystem("counterspell_agent::claude"), "backend");
        assert_eq!(subsystem("counterspell_agent::llm::anthropic"), "llm");
        assert_eq!(subsystem("counterspell_server"), "server");
        assert_eq!(subsystem("tower_http::trace"), "server");
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let feed = LogFeed::new(3);
        for n in 0..5 {
            feed.record(format!("line {n}"));
        }
        let history = feed.history();
        assert_eq!(history, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn subscribers_see_lines_recorded_after_subscribing() {
        let feed = LogFeed::new(8);
        let mut rx = feed.subscribe();
        feed.record("hello".to_string());
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }
}

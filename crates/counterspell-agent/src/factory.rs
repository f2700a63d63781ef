use std::sync::Arc;

use counterspell_core::backend::{AgentBackend, BackendFactory};
use counterspell_core::error::{Error, Result};
use counterspell_core::types::{BackendKind, Settings, Task};

use crate::claude::ClaudeCodeBackend;
use crate::codex::CodexBackend;
use crate::llm::caller_for;
use crate::native::NativeBackend;

/// Builds the backend recorded on the task so continuations
/// deterministically reuse the same kind.
pub struct DefaultBackendFactory {
    claude_bin: String,
    codex_bin: String,
}

impl DefaultBackendFactory {
    pub fn new(claude_bin: impl Into<String>, codex_bin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            claude_bin: claude_bin.into(),
            codex_bin: codex_bin.into(),
        })
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, task: &Task, settings: &Settings) -> Result<Box<dyn AgentBackend>> {
        let worktree = task
            .worktree_path
            .as_deref()
            .ok_or_else(|| Error::Conflict(format!("task {} has no worktree", task.id)))?;

        Ok(match task.backend_kind {
            BackendKind::Native => {
                let caller = caller_for(&task.model_id, settings);
                Box::new(NativeBackend::new(Arc::from(caller), worktree, &task.model_id))
            }
            BackendKind::ClaudeCode => Box::new(
                ClaudeCodeBackend::new(&self.claude_bin, &task.model_id, worktree, settings)
                    .with_session(task.session_id.clone()),
            ),
            BackendKind::Codex => Box::new(
                CodexBackend::new(&self.codex_bin, &task.model_id, worktree, settings)
                    .with_session(task.session_id.clone()),
            ),
        })
    }
}

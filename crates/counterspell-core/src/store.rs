use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{
    BackendKind, Event, EventPayload, GitHubConnection, RepoRef, Role, Settings, StoredMessage,
    Task, TaskStatus,
};

const SCHEMA_SQL: &str = include_str!("../schema.sql");

const TASK_COLUMNS: &str = "id, intent, owner, repo, base_branch, status, worktree_path, \
     branch_name, base_commit, model_id, backend_kind, session_id, conversation_state, \
     final_message, pr_url, fail_reason, conflict_files, created_at, updated_at";

/// Typed CRUD over the SQLite database. The only component that touches it.
pub struct Store {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn ts_str(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn now_str() -> String {
    ts_str(Utc::now())
}

// ── Error classification ─────────────────────────────────────────────────

fn db_err(e: rusqlite::Error, ctx: &str) -> Error {
    match &e {
        rusqlite::Error::QueryReturnedNoRows => Error::NotFound(ctx.to_string()),
        rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                Error::Transient(format!("{ctx}: {e}"))
            }
            ErrorCode::ConstraintViolation => Error::Conflict(format!("{ctx}: {e}")),
            _ => Error::Internal(format!("{ctx}: {e}")),
        },
        _ => Error::Internal(format!("{ctx}: {e}")),
    }
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(5)?;
    let backend_str: String = row.get(10)?;
    let conflict_files: Option<String> = row.get(16)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;
    Ok(Task {
        id: row.get(0)?,
        intent: row.get(1)?,
        repo: RepoRef {
            owner: row.get(2)?,
            repo: row.get(3)?,
            base_branch: row.get(4)?,
        },
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        worktree_path: row.get(6)?,
        branch_name: row.get(7)?,
        base_commit: row.get(8)?,
        model_id: row.get(9)?,
        backend_kind: BackendKind::parse(&backend_str).unwrap_or(BackendKind::ClaudeCode),
        session_id: row.get(11)?,
        conversation_state: row.get(12)?,
        final_message: row.get(13)?,
        pr_url: row.get(14)?,
        fail_reason: row.get(15)?,
        conflict_files: conflict_files
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role_str: String = row.get(2)?;
    let blocks_str: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(StoredMessage {
        task_id: row.get(0)?,
        seq: row.get(1)?,
        role: Role::parse(&role_str).unwrap_or(Role::Assistant),
        blocks: serde_json::from_str(&blocks_str).unwrap_or_default(),
        created_at: parse_ts(&created_at),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let id: i64 = row.get(0)?;
    let payload_str: String = row.get(3)?;
    let ts: String = row.get(4)?;
    Ok(Event {
        id: id as u64,
        task_id: row.get(1)?,
        ts: parse_ts(&ts),
        payload: serde_json::from_str(&payload_str).unwrap_or(EventPayload::Done),
    })
}

// ── Store impl ────────────────────────────────────────────────────────────

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Internal(format!("open database at {path:?}: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| db_err(e, "set pragmas"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| db_err(e, "set pragmas"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| db_err(e, "apply schema"))?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub fn create_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let conflict_files = if task.conflict_files.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&task.conflict_files)?)
        };
        conn.execute(
            "INSERT INTO tasks \
             (id, intent, owner, repo, base_branch, status, worktree_path, branch_name, \
              base_commit, model_id, backend_kind, session_id, conversation_state, \
              final_message, pr_url, fail_reason, conflict_files, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                task.id,
                task.intent,
                task.repo.owner,
                task.repo.repo,
                task.repo.base_branch,
                task.status.as_str(),
                task.worktree_path,
                task.branch_name,
                task.base_commit,
                task.model_id,
                task.backend_kind.as_str(),
                task.session_id,
                task.conversation_state,
                task.final_message,
                task.pr_url,
                task.fail_reason,
                conflict_files,
                ts_str(task.created_at),
                ts_str(task.updated_at),
            ],
        )
        .map_err(|e| db_err(e, "create_task"))?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            row_to_task,
        )
        .optional()
        .map_err(|e| db_err(e, "get_task"))?
        .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    pub fn list_tasks(&self, repo: Option<&RepoRef>) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE (?1 IS NULL OR (owner = ?1 AND repo = ?2)) \
                 ORDER BY created_at DESC, id DESC"
            ))
            .map_err(|e| db_err(e, "list_tasks prepare"))?;
        let owner = repo.map(|r| r.owner.as_str());
        let name = repo.map(|r| r.repo.as_str());
        let tasks = stmt
            .query_map(params![owner, name], row_to_task)
            .map_err(|e| db_err(e, "list_tasks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err(e, "list_tasks collect"))?;
        Ok(tasks)
    }

    pub fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        fail_reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE tasks SET status = ?1, fail_reason = COALESCE(?2, fail_reason), \
                 updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), fail_reason, now_str(), id],
            )
            .map_err(|e| db_err(e, "update_task_status"))?;
        if n == 0 {
            return Err(Error::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    pub fn update_task_worktree(
        &self,
        id: &str,
        worktree_path: &str,
        base_commit: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET worktree_path = ?1, base_commit = ?2, updated_at = ?3 WHERE id = ?4",
            params![worktree_path, base_commit, now_str(), id],
        )
        .map_err(|e| db_err(e, "update_task_worktree"))?;
        Ok(())
    }

    pub fn update_task_session(&self, id: &str, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET session_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![session_id, now_str(), id],
        )
        .map_err(|e| db_err(e, "update_task_session"))?;
        Ok(())
    }

    pub fn update_task_conversation(
        &self,
        id: &str,
        blob: &str,
        session_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET conversation_state = ?1, \
             session_id = COALESCE(?2, session_id), updated_at = ?3 WHERE id = ?4",
            params![blob, session_id, now_str(), id],
        )
        .map_err(|e| db_err(e, "update_task_conversation"))?;
        Ok(())
    }

    pub fn update_task_final_message(&self, id: &str, final_message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET final_message = ?1, updated_at = ?2 WHERE id = ?3",
            params![final_message, now_str(), id],
        )
        .map_err(|e| db_err(e, "update_task_final_message"))?;
        Ok(())
    }

    pub fn update_task_pr_url(&self, id: &str, pr_url: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET pr_url = ?1, updated_at = ?2 WHERE id = ?3",
            params![pr_url, now_str(), id],
        )
        .map_err(|e| db_err(e, "update_task_pr_url"))?;
        Ok(())
    }

    pub fn update_task_conflicts(&self, id: &str, files: &[String]) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let json = if files.is_empty() {
            None
        } else {
            Some(serde_json::to_string(files)?)
        };
        conn.execute(
            "UPDATE tasks SET conflict_files = ?1, updated_at = ?2 WHERE id = ?3",
            params![json, now_str(), id],
        )
        .map_err(|e| db_err(e, "update_task_conflicts"))?;
        Ok(())
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction()
            .map_err(|e| db_err(e, "delete_task begin"))?;
        tx.execute("DELETE FROM messages WHERE task_id = ?1", params![id])
            .map_err(|e| db_err(e, "delete_task messages"))?;
        tx.execute("DELETE FROM events WHERE task_id = ?1", params![id])
            .map_err(|e| db_err(e, "delete_task events"))?;
        let n = tx
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .map_err(|e| db_err(e, "delete_task"))?;
        tx.commit().map_err(|e| db_err(e, "delete_task commit"))?;
        if n == 0 {
            return Err(Error::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Startup reconciliation: tasks left mid-execution by a previous
    /// process are not auto-resumed.
    pub fn fail_running_tasks(&self, reason: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE tasks SET status = 'failed', fail_reason = ?1, updated_at = ?2 \
                 WHERE status IN ('pending', 'planning', 'in_progress')",
                params![reason, now_str()],
            )
            .map_err(|e| db_err(e, "fail_running_tasks"))?;
        Ok(n)
    }

    // ── Messages ──────────────────────────────────────────────────────────

    /// Append a message; `seq = max(seq) + 1` is assigned inside the
    /// transaction so concurrent appenders never collide.
    pub fn append_message(&self, task_id: &str, role: Role, blocks: &[crate::types::Block]) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction()
            .map_err(|e| db_err(e, "append_message begin"))?;
        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE task_id = ?1",
                params![task_id],
                |r| r.get(0),
            )
            .map_err(|e| db_err(e, "append_message seq"))?;
        tx.execute(
            "INSERT INTO messages (task_id, seq, role, blocks, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task_id,
                seq,
                role.as_str(),
                serde_json::to_string(blocks)?,
                now_str()
            ],
        )
        .map_err(|e| db_err(e, "append_message"))?;
        tx.commit().map_err(|e| db_err(e, "append_message commit"))?;
        Ok(seq)
    }

    pub fn list_messages(&self, task_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT task_id, seq, role, blocks, created_at \
                 FROM messages WHERE task_id = ?1 ORDER BY seq ASC",
            )
            .map_err(|e| db_err(e, "list_messages prepare"))?;
        let messages = stmt
            .query_map(params![task_id], row_to_message)
            .map_err(|e| db_err(e, "list_messages"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err(e, "list_messages collect"))?;
        Ok(messages)
    }

    // ── Events ────────────────────────────────────────────────────────────

    pub fn insert_event(&self, event: &Event) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO events (id, task_id, kind, payload, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id as i64,
                event.task_id,
                event.kind(),
                serde_json::to_string(&event.payload)?,
                ts_str(event.ts),
            ],
        )
        .map_err(|e| db_err(e, "insert_event"))?;
        Ok(())
    }

    /// Replay events after `last_id`, optionally scoped to one task.
    pub fn list_events_since(
        &self,
        last_id: u64,
        task_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, kind, payload, ts FROM events \
                 WHERE id > ?1 AND (?2 IS NULL OR task_id = ?2) \
                 ORDER BY id ASC LIMIT ?3",
            )
            .map_err(|e| db_err(e, "list_events_since prepare"))?;
        let events = stmt
            .query_map(params![last_id as i64, task_id, limit], row_to_event)
            .map_err(|e| db_err(e, "list_events_since"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err(e, "list_events_since collect"))?;
        Ok(events)
    }

    pub fn max_event_id(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let id: i64 = conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |r| r.get(0))
            .map_err(|e| db_err(e, "max_event_id"))?;
        Ok(id as u64)
    }

    // ── Settings ──────────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err(e, "get_setting"))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_str()],
        )
        .map_err(|e| db_err(e, "set_setting"))?;
        Ok(())
    }

    /// Seed a setting only if it has no value yet; DB values win afterwards.
    pub fn seed_setting(&self, key: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_str()],
        )
        .map_err(|e| db_err(e, "seed_setting"))?;
        Ok(())
    }

    pub fn get_settings(&self) -> Result<Settings> {
        let get = |key: &str| self.get_setting(key).map(Option::unwrap_or_default);
        Ok(Settings {
            anthropic_api_key: get("anthropic_api_key")?,
            anthropic_auth_token: get("anthropic_auth_token")?,
            anthropic_base_url: get("anthropic_base_url")?,
            openai_api_key: get("openai_api_key")?,
            openai_base_url: get("openai_base_url")?,
            default_backend: get("default_backend")?,
            default_model: get("default_model")?,
        })
    }

    // ── GitHub connection ─────────────────────────────────────────────────

    pub fn get_github_connection(&self) -> Result<Option<GitHubConnection>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT access_token, login, connected_at FROM github_connections WHERE id = 1",
            [],
            |row| {
                let connected_at: String = row.get(2)?;
                Ok(GitHubConnection {
                    access_token: row.get(0)?,
                    login: row.get(1)?,
                    connected_at: parse_ts(&connected_at),
                })
            },
        )
        .optional()
        .map_err(|e| db_err(e, "get_github_connection"))
    }

    pub fn set_github_connection(&self, conn_info: &GitHubConnection) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO github_connections (id, access_token, login, connected_at) \
             VALUES (1, ?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET access_token = excluded.access_token, \
               login = excluded.login, connected_at = excluded.connected_at",
            params![
                conn_info.access_token,
                conn_info.login,
                ts_str(conn_info.connected_at)
            ],
        )
        .map_err(|e| db_err(e, "set_github_connection"))?;
        Ok(())
    }

    pub fn delete_github_connection(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM github_connections WHERE id = 1", [])
            .map_err(|e| db_err(e, "delete_github_connection"))?;
        Ok(())
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::git::{git, git_ok};
use crate::types::{RepoRef, Task};

/// Attempts for operations that can fail on clone lock contention.
const CREATE_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub base_commit: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictFile {
    pub path: String,
    pub ours: String,
    pub theirs: String,
}

/// Maintains one shared bare clone per `(owner, repo)` and per-task
/// worktrees under the data directory.
///
/// Locking: a per-repo lock covers operations that mutate the shared clone
/// (merge, push); same-task operations serialize on a per-task lock; fetch
/// uses a coalescer instead of the repo lock so unrelated worktree creation
/// is never serialized behind network I/O.
pub struct WorktreeManager {
    data_dir: PathBuf,
    /// Prefix remotes are resolved against; overridable for self-hosted
    /// git and test fixtures.
    remote_base: String,
    repo_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// One in-flight fetch per repo key; later callers await its outcome.
    fetch_inflight: Mutex<HashMap<String, broadcast::Sender<std::result::Result<(), String>>>>,
}

impl WorktreeManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_remote_base(data_dir, "https://github.com")
    }

    pub fn with_remote_base(data_dir: impl Into<PathBuf>, remote_base: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            data_dir: data_dir.into(),
            remote_base: remote_base.into(),
            repo_locks: Mutex::new(HashMap::new()),
            task_locks: Mutex::new(HashMap::new()),
            fetch_inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn bare_path(&self, repo: &RepoRef) -> PathBuf {
        self.data_dir
            .join("repos")
            .join(&repo.owner)
            .join(format!("{}.git", repo.repo))
    }

    pub fn worktree_path(&self, repo: &RepoRef, task_id: &str) -> PathBuf {
        self.data_dir
            .join("workspaces")
            .join("worktrees")
            .join(format!("{}_{}", repo.repo, task_id))
    }

    async fn repo_lock(&self, repo: &RepoRef) -> Arc<Mutex<()>> {
        let mut map = self.repo_locks.lock().await;
        Arc::clone(map.entry(repo.key()).or_default())
    }

    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.task_locks.lock().await;
        Arc::clone(map.entry(task_id.to_string()).or_default())
    }

    // ── Clone / fetch ─────────────────────────────────────────────────────

    fn remote_url(&self, repo: &RepoRef, auth_token: Option<&str>) -> String {
        match auth_token {
            Some(token) if !token.is_empty() && self.remote_base.starts_with("https://") => {
                let host = self.remote_base.trim_start_matches("https://");
                format!(
                    "https://x-access-token:{token}@{host}/{}/{}.git",
                    repo.owner, repo.repo
                )
            }
            _ => format!("{}/{}/{}.git", self.remote_base, repo.owner, repo.repo),
        }
    }

    /// Clone the bare repo if absent, otherwise fetch. Concurrent calls for
    /// the same key coalesce into one fetch; the rest await its outcome.
    pub async fn ensure_clone(&self, repo: &RepoRef, auth_token: Option<&str>) -> Result<()> {
        let key = repo.key();

        let mut rx = {
            let mut inflight = self.fetch_inflight.lock().await;
            match inflight.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            return match rx.recv().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(msg)) => Err(Error::Transient(msg)),
                Err(_) => Err(Error::Transient(format!("coalesced fetch for {key} aborted"))),
            };
        }

        let outcome = self.clone_or_fetch(repo, auth_token).await;

        let tx = self.fetch_inflight.lock().await.remove(&key);
        if let Some(tx) = tx {
            let _ = tx.send(outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        }
        outcome
    }

    async fn clone_or_fetch(&self, repo: &RepoRef, auth_token: Option<&str>) -> Result<()> {
        let bare = self.bare_path(repo);
        if bare.join("HEAD").exists() {
            git_ok(&bare, &["fetch", "--prune", "origin"])
                .await
                .map_err(|e| Error::Transient(format!("fetch {}: {e}", repo.key())))?;
            return Ok(());
        }

        let parent = bare
            .parent()
            .ok_or_else(|| Error::Internal(format!("bare path has no parent: {}", bare.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        let url = self.remote_url(repo, auth_token);
        let bare_str = bare.to_string_lossy().into_owned();
        let result = git(parent, &["clone", "--bare", &url, &bare_str]).await?;
        if !result.success() {
            // never leak the token into errors or logs
            let mut detail = result.combined_output();
            if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
                detail = detail.replace(token, "***");
            }
            return Err(Error::Transient(format!(
                "clone {}: {}",
                repo.key(),
                detail.trim()
            )));
        }

        // Bare clones do not track remote branches by default; worktrees
        // branch from origin/<base>, so pin the remote and mirror heads
        // into remotes.
        git_ok(&bare, &["config", "remote.origin.url", &url]).await?;
        git_ok(
            &bare,
            &[
                "config",
                "remote.origin.fetch",
                "+refs/heads/*:refs/remotes/origin/*",
            ],
        )
        .await?;
        git_ok(&bare, &["fetch", "--prune", "origin"])
            .await
            .map_err(|e| Error::Transient(format!("initial fetch {}: {e}", repo.key())))?;

        info!(repo = %repo.key(), "cloned bare repository");
        Ok(())
    }

    // ── Worktrees ─────────────────────────────────────────────────────────

    /// `git worktree add` at a fresh directory with branch
    /// `cspell/<task_id>` based on `origin/<base_branch>`.
    pub async fn create_worktree(&self, repo: &RepoRef, task_id: &str) -> Result<WorktreeInfo> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let bare = self.bare_path(repo);
        let wt_path = self.worktree_path(repo, task_id);
        let branch = Task::branch_for(task_id);
        let base = format!("origin/{}", repo.base_branch);

        if let Some(parent) = wt_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let base_commit = git_ok(&bare, &["rev-parse", &base]).await?.stdout.trim().to_string();

        let wt_str = wt_path.to_string_lossy().into_owned();
        let mut last_err: Option<Error> = None;
        for attempt in 0..CREATE_RETRIES {
            match git_ok(&bare, &["worktree", "add", &wt_str, "-b", &branch, &base]).await {
                Ok(_) => {
                    info!(task_id, branch = %branch, path = %wt_path.display(), "created worktree");
                    return Ok(WorktreeInfo {
                        path: wt_path,
                        branch,
                        base_commit,
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(task_id, attempt, "worktree add hit clone lock, retrying: {e}");
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_millis(200 * (1 << attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("worktree add failed".into())))
    }

    /// Unified diff of the worktree against the task's base commit; empty
    /// string when nothing changed (committed or not). Untracked files are
    /// registered with intent-to-add so they appear in the diff.
    pub async fn get_diff(&self, task: &Task) -> Result<String> {
        let wt = self.require_worktree(task)?;
        let base = task
            .base_commit
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("task {} has no base commit", task.id)))?;
        let _ = git(&wt, &["add", "--intent-to-add", "-A", "."]).await;
        let result = git_ok(&wt, &["diff", "--no-color", base]).await?;
        Ok(result.stdout)
    }

    fn require_worktree(&self, task: &Task) -> Result<PathBuf> {
        let path = task
            .worktree_path
            .as_deref()
            .ok_or_else(|| Error::Conflict(format!("task {} has no worktree", task.id)))?;
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "worktree for task {} missing at {}",
                task.id,
                path.display()
            )));
        }
        Ok(path)
    }

    // ── Merge workflow ────────────────────────────────────────────────────

    /// Merge the task branch into the base branch with `--no-ff` and push.
    ///
    /// A bare clone has no working tree, so the merge runs inside the
    /// task's worktree: check out the base branch at `origin/<base>`,
    /// merge, push. On conflicts the worktree is left mid-merge for the
    /// resolution workflow and origin is untouched.
    pub async fn merge_task(&self, task: &Task) -> Result<()> {
        let repo_lock = self.repo_lock(&task.repo).await;
        let _repo_guard = repo_lock.lock().await;
        let task_lock = self.task_lock(&task.id).await;
        let _task_guard = task_lock.lock().await;

        let wt = self.require_worktree(task)?;
        let base = &task.repo.base_branch;

        git_ok(&wt, &["checkout", "-B", base, &format!("origin/{base}")])
            .await
            .map_err(|e| match e {
                Error::Internal(msg) if msg.contains("already used by worktree")
                    || msg.contains("already checked out") =>
                {
                    Error::Conflict(format!(
                        "base branch {base} is checked out by another task's merge"
                    ))
                }
                other => other,
            })?;

        let merge = git(&wt, &["merge", "--no-ff", "--no-edit", &task.branch_name]).await?;
        if !merge.success() {
            let files = self.unmerged_files(&wt).await?;
            if files.is_empty() {
                // not a content conflict: undo and surface
                let _ = git(&wt, &["merge", "--abort"]).await;
                let _ = git(&wt, &["checkout", &task.branch_name]).await;
                return Err(Error::Internal(format!(
                    "merge of {} failed: {}",
                    task.branch_name,
                    merge.combined_output().trim()
                )));
            }
            info!(task_id = %task.id, files = files.len(), "merge stopped on conflicts");
            return Err(Error::MergeConflict { files });
        }

        git_ok(&wt, &["push", "origin", base]).await.map_err(|e| {
            Error::Transient(format!("push {base} after merge of {}: {e}", task.id))
        })?;
        info!(task_id = %task.id, base = %base, "merged and pushed");
        Ok(())
    }

    async fn unmerged_files(&self, wt: &Path) -> Result<Vec<String>> {
        let result = git_ok(wt, &["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(result
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Three-way contents (`ours` = base branch side, `theirs` = task
    /// branch side) for each conflicted file.
    pub async fn conflict_details(&self, task: &Task, files: &[String]) -> Result<Vec<ConflictFile>> {
        let wt = self.require_worktree(task)?;
        let mut out = Vec::with_capacity(files.len());
        for path in files {
            let ours = git(&wt, &["show", &format!(":2:{path}")]).await?;
            let theirs = git(&wt, &["show", &format!(":3:{path}")]).await?;
            out.push(ConflictFile {
                path: path.clone(),
                ours: if ours.success() { ours.stdout } else { String::new() },
                theirs: if theirs.success() { theirs.stdout } else { String::new() },
            });
        }
        Ok(out)
    }

    /// Write resolved content and stage it; the merge stays in progress.
    pub async fn resolve_conflict(&self, task: &Task, path: &str, content: &str) -> Result<()> {
        let lock = self.task_lock(&task.id).await;
        let _guard = lock.lock().await;
        let wt = self.require_worktree(task)?;
        if path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(Error::InvalidInput(format!("bad conflict path {path:?}")));
        }
        let file = wt.join(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, content).await?;
        git_ok(&wt, &["add", "--", path]).await?;
        Ok(())
    }

    /// Commit the merge and push, provided no conflict entries remain.
    pub async fn complete_merge(&self, task: &Task) -> Result<()> {
        let repo_lock = self.repo_lock(&task.repo).await;
        let _repo_guard = repo_lock.lock().await;
        let task_lock = self.task_lock(&task.id).await;
        let _task_guard = task_lock.lock().await;

        let wt = self.require_worktree(task)?;
        let remaining = self.unmerged_files(&wt).await?;
        if !remaining.is_empty() {
            return Err(Error::Conflict(format!(
                "{} file(s) still unresolved",
                remaining.len()
            )));
        }
        git_ok(&wt, &["commit", "--no-edit"]).await?;
        let base = &task.repo.base_branch;
        git_ok(&wt, &["push", "origin", base])
            .await
            .map_err(|e| Error::Transient(format!("push {base}: {e}")))?;
        info!(task_id = %task.id, "merge resolution completed and pushed");
        Ok(())
    }

    /// Abandon the in-progress merge and return to the task branch.
    pub async fn abort_merge(&self, task: &Task) -> Result<()> {
        let lock = self.task_lock(&task.id).await;
        let _guard = lock.lock().await;
        let wt = self.require_worktree(task)?;
        git_ok(&wt, &["merge", "--abort"]).await?;
        git_ok(&wt, &["checkout", &task.branch_name]).await?;
        Ok(())
    }

    // ── PR ────────────────────────────────────────────────────────────────

    /// Push the task branch so a PR can target it.
    pub async fn push_task_branch(&self, task: &Task) -> Result<()> {
        let lock = self.task_lock(&task.id).await;
        let _guard = lock.lock().await;
        let wt = self.require_worktree(task)?;
        git_ok(&wt, &["push", "--force-with-lease", "origin", &task.branch_name])
            .await
            .map_err(|e| Error::Transient(format!("push {}: {e}", task.branch_name)))?;
        Ok(())
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    /// Remove the worktree and its branch. Best-effort and idempotent.
    pub async fn cleanup_worktree(&self, repo: &RepoRef, task_id: &str) {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let bare = self.bare_path(repo);
        let wt_path = self.worktree_path(repo, task_id);
        let wt_str = wt_path.to_string_lossy().into_owned();
        let branch = Task::branch_for(task_id);

        if let Ok(result) = git(&bare, &["worktree", "remove", "--force", &wt_str]).await {
            if !result.success() && wt_path.exists() {
                let _ = tokio::fs::remove_dir_all(&wt_path).await;
            }
        }
        let _ = git(&bare, &["worktree", "prune"]).await;
        let _ = git(&bare, &["branch", "-D", &branch]).await;
        self.task_locks.lock().await.remove(task_id);
        info!(task_id, "cleaned up worktree");
    }
}

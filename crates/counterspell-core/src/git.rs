use std::path::Path;

use tokio::process::Command;

use crate::error::{Error, Result};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Run `git -C <dir> <args>` and capture output. Spawn failures are
/// internal errors; non-zero exits are returned for the caller to judge.
pub async fn git(dir: &Path, args: &[&str]) -> Result<ExecResult> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            Error::Internal(format!(
                "spawn git -C {} {}: {e}",
                dir.display(),
                args.join(" ")
            ))
        })?;

    Ok(ExecResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(1),
    })
}

/// Like [`git`] but a non-zero exit becomes an error carrying the combined
/// output.
pub async fn git_ok(dir: &Path, args: &[&str]) -> Result<ExecResult> {
    let result = git(dir, args).await?;
    if !result.success() {
        let detail = result.combined_output();
        let detail = detail.trim();
        if is_lock_contention(detail) {
            return Err(Error::Transient(format!(
                "git {} in {}: {detail}",
                args.first().unwrap_or(&""),
                dir.display()
            )));
        }
        return Err(Error::Internal(format!(
            "git {} in {}: {detail}",
            args.first().unwrap_or(&""),
            dir.display()
        )));
    }
    Ok(result)
}

/// Lock contention on the shared clone is retryable by callers.
fn is_lock_contention(detail: &str) -> bool {
    detail.contains("index.lock")
        || detail.contains("could not lock")
        || detail.contains("Unable to create")
        || detail.contains("File exists")
}

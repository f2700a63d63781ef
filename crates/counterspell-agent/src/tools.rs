//! Tools offered to the LLM by the native backend. Every tool executes
//! inside the task's worktree; paths are validated so the agent cannot
//! reach outside it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use globset::Glob;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::process::Command;
use walkdir::WalkDir;

use counterspell_core::types::TodoItem;

const MAX_READ_BYTES: usize = 256 * 1024;
const MAX_MATCHES: usize = 200;
const MAX_TOOL_OUTPUT: usize = 32 * 1024;
const BASH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

/// What a tool produced: text for the model, plus an updated tasklist when
/// the `todos` tool ran.
#[derive(Debug)]
pub struct ToolOutcome {
    pub content: String,
    pub todos: Option<Vec<TodoItem>>,
}

impl ToolOutcome {
    fn text(content: impl Into<String>) -> Self {
        Self {
            content: truncate(content.into(), MAX_TOOL_OUTPUT),
            todos: None,
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        s.truncate(max);
        s.push_str("\n... (truncated)");
    }
    s
}

/// JSON schema definitions for the chat-completion request.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

pub struct ToolSet {
    root: PathBuf,
}

// ── Argument types ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ReadArgs {
    path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct EditArgs {
    path: String,
    old: String,
    new: String,
    #[serde(default)]
    all: bool,
}

#[derive(Deserialize)]
struct GlobArgs {
    pattern: String,
}

#[derive(Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct BashArgs {
    command: String,
    #[serde(default)]
    timeout_s: Option<u64>,
}

#[derive(Deserialize)]
struct LsArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct TodosArgs {
    items: Vec<TodoItem>,
}

fn parse_args<T: serde::de::DeserializeOwned>(input: &Value) -> Result<T, ToolError> {
    serde_json::from_value(input.clone()).map_err(|e| ToolError::InvalidInput(e.to_string()))
}

impl ToolSet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "read",
                description: "Read a file from the worktree, optionally from a line offset",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "offset": {"type": "integer"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["path"]
                }),
            },
            ToolDefinition {
                name: "write",
                description: "Create or overwrite a file with the given content",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            },
            ToolDefinition {
                name: "edit",
                description: "Replace an exact string in a file; set all=true to replace every occurrence",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "old": {"type": "string"},
                        "new": {"type": "string"},
                        "all": {"type": "boolean"}
                    },
                    "required": ["path", "old", "new"]
                }),
            },
            ToolDefinition {
                name: "glob",
                description: "Find files matching a glob pattern",
                input_schema: json!({
                    "type": "object",
                    "properties": {"pattern": {"type": "string"}},
                    "required": ["pattern"]
                }),
            },
            ToolDefinition {
                name: "grep",
                description: "Search file contents with a regular expression",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string"},
                        "path": {"type": "string"}
                    },
                    "required": ["pattern"]
                }),
            },
            ToolDefinition {
                name: "bash",
                description: "Run a shell command with the worktree as working directory",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string"},
                        "timeout_s": {"type": "integer"}
                    },
                    "required": ["command"]
                }),
            },
            ToolDefinition {
                name: "ls",
                description: "List a directory in the worktree",
                input_schema: json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}}
                }),
            },
            ToolDefinition {
                name: "todos",
                description: "Replace the task list with the given items",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "items": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "content": {"type": "string"},
                                    "status": {"type": "string"},
                                    "active_form": {"type": "string"}
                                },
                                "required": ["content", "status", "active_form"]
                            }
                        }
                    },
                    "required": ["items"]
                }),
            },
        ]
    }

    pub async fn execute(&self, name: &str, input: &Value) -> Result<ToolOutcome, ToolError> {
        match name {
            "read" => self.read(parse_args(input)?).await,
            "write" => self.write(parse_args(input)?).await,
            "edit" => self.edit(parse_args(input)?).await,
            "glob" => self.glob(parse_args(input)?),
            "grep" => self.grep(parse_args(input)?),
            "bash" => self.bash(parse_args(input)?).await,
            "ls" => self.ls(parse_args(input)?),
            "todos" => {
                let args: TodosArgs = parse_args(input)?;
                Ok(ToolOutcome {
                    content: format!("tasklist updated ({} items)", args.items.len()),
                    todos: Some(args.items),
                })
            }
            other => Err(ToolError::InvalidInput(format!("unknown tool {other:?}"))),
        }
    }

    /// Resolve a relative path under the worktree root, rejecting escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        if path.is_empty() {
            return Err(ToolError::InvalidInput("path must not be empty".into()));
        }
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let mut normalized = PathBuf::new();
        for comp in joined.components() {
            match comp {
                std::path::Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(ToolError::InvalidInput(format!(
                            "path {path:?} escapes the worktree"
                        )));
                    }
                }
                std::path::Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.root) {
            return Err(ToolError::InvalidInput(format!(
                "path {path:?} is outside the worktree"
            )));
        }
        Ok(normalized)
    }

    async fn read(&self, args: ReadArgs) -> Result<ToolOutcome, ToolError> {
        let path = self.resolve(&args.path)?;
        let bytes = tokio::fs::read(&path).await?;
        if bytes.len() > MAX_READ_BYTES && args.offset.is_none() && args.limit.is_none() {
            return Err(ToolError::InvalidInput(format!(
                "file is {} bytes; pass offset/limit to read it in chunks",
                bytes.len()
            )));
        }
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();
        let offset = args.offset.unwrap_or(0).min(lines.len());
        let limit = args.limit.unwrap_or(lines.len());
        let slice = lines[offset..(offset + limit).min(lines.len())].join("\n");
        Ok(ToolOutcome::text(slice))
    }

    async fn write(&self, args: WriteArgs) -> Result<ToolOutcome, ToolError> {
        let path = self.resolve(&args.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &args.content).await?;
        Ok(ToolOutcome::text(format!(
            "wrote {} bytes to {}",
            args.content.len(),
            args.path
        )))
    }

    /// Exact string replacement. Ambiguous `old` with `all=false` is a
    /// typed error and the file is left unchanged.
    async fn edit(&self, args: EditArgs) -> Result<ToolOutcome, ToolError> {
        if args.old.is_empty() {
            return Err(ToolError::InvalidInput("old must not be empty".into()));
        }
        if args.old == args.new {
            return Err(ToolError::InvalidInput("new must differ from old".into()));
        }
        let path = self.resolve(&args.path)?;
        let content = tokio::fs::read_to_string(&path).await?;
        let count = content.matches(&args.old).count();
        if count == 0 {
            return Err(ToolError::InvalidInput(
                "old string not found in file".into(),
            ));
        }
        if count > 1 && !args.all {
            return Err(ToolError::InvalidInput(format!(
                "old string appears {count} times; provide more context or set all=true"
            )));
        }
        let new_content = if args.all {
            content.replace(&args.old, &args.new)
        } else {
            content.replacen(&args.old, &args.new, 1)
        };
        tokio::fs::write(&path, new_content).await?;
        let replaced = if args.all { count } else { 1 };
        Ok(ToolOutcome::text(format!(
            "edited {} ({replaced} replacement(s))",
            args.path
        )))
    }

    fn glob(&self, args: GlobArgs) -> Result<ToolOutcome, ToolError> {
        let matcher = Glob::new(&args.pattern)
            .map_err(|e| ToolError::InvalidInput(format!("bad glob pattern: {e}")))?
            .compile_matcher();
        let mut matches = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.file_name() != std::ffi::OsStr::new(".git"))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path());
            if matcher.is_match(rel) {
                matches.push(rel.to_string_lossy().into_owned());
                if matches.len() >= MAX_MATCHES {
                    break;
                }
            }
        }
        matches.sort();
        Ok(ToolOutcome::text(if matches.is_empty() {
            "no matches".to_string()
        } else {
            matches.join("\n")
        }))
    }

    fn grep(&self, args: GrepArgs) -> Result<ToolOutcome, ToolError> {
        let re = Regex::new(&args.pattern)
            .map_err(|e| ToolError::InvalidInput(format!("bad regex: {e}")))?;
        let base = match args.path.as_deref() {
            Some(p) => self.resolve(p)?,
            None => self.root.clone(),
        };
        let mut out = Vec::new();
        for entry in WalkDir::new(&base)
            .into_iter()
            .filter_entry(|e| e.file_name() != std::ffi::OsStr::new(".git"))
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // binary or unreadable
            };
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            for (lineno, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    out.push(format!("{rel}:{}:{line}", lineno + 1));
                    if out.len() >= MAX_MATCHES {
                        break;
                    }
                }
            }
            if out.len() >= MAX_MATCHES {
                break;
            }
        }
        Ok(ToolOutcome::text(if out.is_empty() {
            "no matches".to_string()
        } else {
            out.join("\n")
        }))
    }

    async fn bash(&self, args: BashArgs) -> Result<ToolOutcome, ToolError> {
        let timeout = args
            .timeout_s
            .map(Duration::from_secs)
            .unwrap_or(BASH_TIMEOUT);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&args.command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| ToolError::Timeout(timeout))?
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if !output.status.success() {
            text.push_str(&format!(
                "\n(exit code {})",
                output.status.code().unwrap_or(1)
            ));
        }
        Ok(ToolOutcome::text(text))
    }

    fn ls(&self, args: LsArgs) -> Result<ToolOutcome, ToolError> {
        let base = match args.path.as_deref() {
            Some(p) => self.resolve(p)?,
            None => self.root.clone(),
        };
        let mut entries: Vec<String> = std::fs::read_dir(&base)?
            .filter_map(|e| e.ok())
            .map(|e| {
                let mut name = e.file_name().to_string_lossy().into_owned();
                if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                name
            })
            .collect();
        entries.sort();
        Ok(ToolOutcome::text(entries.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn toolset(dir: &tempfile::TempDir) -> ToolSet {
        ToolSet::new(dir.path())
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempdir().unwrap();
        let tools = toolset(&dir);
        tools
            .execute("write", &json!({"path": "notes/a.txt", "content": "hello"}))
            .await
            .unwrap();
        let out = tools
            .execute("read", &json!({"path": "notes/a.txt"}))
            .await
            .unwrap();
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn edit_rejects_ambiguous_old_and_leaves_file_unchanged() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "foo bar foo").unwrap();
        let tools = toolset(&dir);
        let err = tools
            .execute("edit", &json!({"path": "f.txt", "old": "foo", "new": "qux"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
        assert!(err.to_string().contains("2 times"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "foo bar foo"
        );
    }

    #[tokio::test]
    async fn edit_replace_all() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "foo bar foo").unwrap();
        let tools = toolset(&dir);
        tools
            .execute(
                "edit",
                &json!({"path": "f.txt", "old": "foo", "new": "qux", "all": true}),
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "qux bar qux"
        );
    }

    #[tokio::test]
    async fn paths_cannot_escape_the_worktree() {
        let dir = tempdir().unwrap();
        let tools = toolset(&dir);
        let err = tools
            .execute("read", &json!({"path": "../../etc/passwd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn glob_finds_files_relative_to_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        let tools = toolset(&dir);
        let out = tools
            .execute("glob", &json!({"pattern": "**/*.rs"}))
            .await
            .unwrap();
        assert_eq!(out.content, "src/lib.rs");
    }

    #[tokio::test]
    async fn grep_reports_line_numbers() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "alpha\nbeta\ngamma beta").unwrap();
        let tools = toolset(&dir);
        let out = tools
            .execute("grep", &json!({"pattern": "beta"}))
            .await
            .unwrap();
        assert!(out.content.contains("f.txt:2:beta"));
        assert!(out.content.contains("f.txt:3:gamma beta"));
    }

    #[tokio::test]
    async fn bash_runs_in_worktree_and_reports_exit_code() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "x").unwrap();
        let tools = toolset(&dir);
        let out = tools
            .execute("bash", &json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(out.content.contains("present.txt"));
        let out = tools
            .execute("bash", &json!({"command": "exit 3"}))
            .await
            .unwrap();
        assert!(out.content.contains("exit code 3"));
    }

    #[tokio::test]
    async fn todos_updates_tasklist() {
        let dir = tempdir().unwrap();
        let tools = toolset(&dir);
        let out = tools
            .execute(
                "todos",
                &json!({"items": [
                    {"content": "write tests", "status": "pending", "active_form": "writing tests"}
                ]}),
            )
            .await
            .unwrap();
        let todos = out.todos.unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].content, "write tests");
    }
}

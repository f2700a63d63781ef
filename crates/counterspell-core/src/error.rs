use thiserror::Error;

/// Error taxonomy shared across the core, backends, and the HTTP surface.
///
/// Handlers map these onto status codes; the orchestrator decides retry
/// behaviour from [`Error::is_transient`].
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request. Caller error, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// State precondition violated (wrong task status, unique constraint).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Merge stopped on conflicting files. The base branch is untouched.
    #[error("merge conflict in {0} file(s)", .files.len())]
    MergeConflict { files: Vec<String> },

    /// Network or subprocess hiccup worth retrying with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Agent subprocess exited non-zero or its stream closed unexpectedly.
    #[error("backend failure: {0}")]
    BackendFailure(String),

    /// Cooperative cancellation.
    #[error("cancelled")]
    Cancelled,

    /// Bug or invariant violation; logged at error, opaque to callers.
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short human-readable message for API responses; technical detail
    /// stays in the structured log.
    pub fn user_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json: {e}"))
    }
}

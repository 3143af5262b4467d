use thiserror::Error;

/// Closed error taxonomy for the sync engine. Every variant here is one a
/// caller is expected to match on and recover from; anything unexpected
/// should be an `anyhow::Error` at the process boundary instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("path escapes working directory: {path}")]
    PathEscape { path: String },

    #[error("content missing from CDS for {resource}")]
    ContentMissing { resource: String },

    #[error("git lock present for {repo}")]
    GitLocked { repo: String },

    #[error("git command failed ({command}): {detail}")]
    GitCommandFailed { command: String, detail: String },

    #[error("push failed ({kind}) for {repo}: {detail}")]
    PushFailure {
        repo: String,
        kind: PushFailureKind,
        detail: String,
    },

    #[error("state corrupted at {path}: {detail}")]
    StateCorruption { path: String, detail: String },

    #[error("invalid connector config: {detail}")]
    ConfigError { detail: String },

    #[error("CDS transport error: {0}")]
    TransportError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailureKind {
    NonFastForward,
    Auth,
    Other,
}

impl std::fmt::Display for PushFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PushFailureKind::NonFastForward => "non-fast-forward",
            PushFailureKind::Auth => "auth",
            PushFailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

impl PushFailureKind {
    /// Classify raw git stderr the same way the reference implementation does:
    /// substring sniffing, not exit-code parsing, since git's exit codes
    /// collapse every failure mode to 1.
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("non-fast-forward") || lower.contains("fetch first") {
            PushFailureKind::NonFastForward
        } else if lower.contains("permission denied")
            || lower.contains("authentication failed")
            || lower.contains("could not read username")
            || lower.contains("publickey")
        {
            PushFailureKind::Auth
        } else {
            PushFailureKind::Other
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

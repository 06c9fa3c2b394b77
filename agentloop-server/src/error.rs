//! Error taxonomy.
//!
//! - [`StoreError`]: anything that went wrong talking to the durable store.
//! - [`IngestError`]: why an inbound webhook was rejected before persistence.
//! - [`JobError`]: how a handler failed, which decides whether the job is retried.
//! - [`ToolError`]: why an agent's tool call produced no result.
//!
//! Iteration exhaustion is deliberately absent: it is a phase of the PR state
//! machine, not an error.

use std::fmt;

/// Errors from the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// SQLite (or the blocking task running it) failed.
    Storage { operation: String, message: String },
    /// A row could not be decoded.
    Corruption { what: String },
    /// The database was written by a newer binary.
    SchemaTooNew { found: i64, supported: i64 },
    /// A completion or failure was reported by a worker that no longer holds
    /// the job's lease (it expired and was reaped).
    LeaseLost { job_id: i64, worker_id: String },
    /// The referenced row does not exist.
    NotFound { what: String },
}

impl StoreError {
    pub fn storage(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage { operation, message } => {
                write!(f, "storage error during {}: {}", operation, message)
            }
            Self::Corruption { what } => write!(f, "corrupt data: {}", what),
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "database schema version {} is newer than supported version {}; upgrade the application",
                found, supported
            ),
            Self::LeaseLost { job_id, worker_id } => write!(
                f,
                "worker {} no longer holds the lease on job {}",
                worker_id, job_id
            ),
            Self::NotFound { what } => write!(f, "not found: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

/// Why an inbound event was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Signature missing or not matching any configured secret.
    AuthFailure,
    /// Headers missing or payload unusable.
    MalformedEvent(String),
    /// The store could not record the delivery.
    Store(StoreError),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthFailure => write!(f, "invalid webhook signature"),
            Self::MalformedEvent(reason) => write!(f, "malformed event: {}", reason),
            Self::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// How a job handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Rate limits, network trouble, timeouts: worth another attempt.
    Transient(String),
    /// Invalid repository state, rejected requests: retrying cannot help.
    Permanent(String),
}

impl JobError {
    pub fn transient(message: impl fmt::Display) -> Self {
        Self::Transient(message.to_string())
    }

    pub fn permanent(message: impl fmt::Display) -> Self {
        Self::Permanent(message.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }

    /// Prefix the message with what was being attempted, keeping the class.
    pub fn context(self, what: &str) -> Self {
        match self {
            Self::Transient(m) => Self::Transient(format!("{}: {}", what, m)),
            Self::Permanent(m) => Self::Permanent(format!("{}: {}", what, m)),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(m) => write!(f, "transient: {}", m),
            Self::Permanent(m) => write!(f, "permanent: {}", m),
        }
    }
}

impl std::error::Error for JobError {}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corruption { .. } | StoreError::SchemaTooNew { .. } => {
                Self::Permanent(e.to_string())
            }
            _ => Self::Transient(e.to_string()),
        }
    }
}

/// Why a tool call failed.
///
/// Everything except a transient remote failure is reported back to the
/// agent as an observation; a transient remote failure aborts the run so the
/// job can be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Unknown tool, or not on the caller's allowlist.
    NotAllowed(String),
    InvalidArguments(String),
    /// A path that would leave the workspace.
    PathEscape(String),
    /// Local failure: missing file, git error, limits exceeded.
    Failed(String),
    /// The repository API failed.
    Remote(JobError),
}

impl ToolError {
    pub fn invalid(message: impl fmt::Display) -> Self {
        Self::InvalidArguments(message.to_string())
    }

    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Whether the agent run must stop and the job be retried.
    pub fn aborts_run(&self) -> bool {
        matches!(self, Self::Remote(JobError::Transient(_)))
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAllowed(tool) => write!(f, "tool '{}' is not available", tool),
            Self::InvalidArguments(m) => write!(f, "invalid arguments: {}", m),
            Self::PathEscape(path) => write!(f, "path '{}' is outside the repository", path),
            Self::Failed(m) => write!(f, "{}", m),
            Self::Remote(e) => write!(f, "repository API error: {}", e.message()),
        }
    }
}

impl std::error::Error for ToolError {}

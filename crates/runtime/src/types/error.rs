//! Error types and recovery classification for the defender runtime
//!
//! Each subsystem has its own error enum; `DefenderError` composes them at
//! the supervisor boundary. Recovery policy lives next to the error: the
//! `is_transient` / `is_retryable` predicates decide whether the retry
//! combinator re-runs an operation or the failure is journaled and dropped.

use thiserror::Error;

use super::ExecutionStatus;

/// Top-level runtime error.
#[derive(Error, Debug)]
pub enum DefenderError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DefenderError {
    /// Process exit code mandated for this error class.
    ///
    /// `1` for configuration failures, `2` for unrecoverable I/O on the
    /// journal or state store, `0` otherwise (recovered locally).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Journal(_) | Self::Store(_) => 2,
            _ => 0,
        }
    }
}

/// Configuration errors; always fatal at startup.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required variable: {0}")]
    MissingVar(String),
}

/// Timeline journal errors.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Journal I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Journal writer is gone")]
    WriterGone,

    #[error("Malformed journal line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Alert store and state store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Another process holds the writer lock on {path}")]
    Locked { path: String },

    #[error("State file {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Ingest path errors surfaced as HTTP status codes.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed alert payload: {0}")]
    Malformed(String),

    #[error("Alert payload of {size} bytes exceeds the {max} byte limit")]
    Oversize { size: usize, max: usize },

    #[error("Failed to persist alert: {0}")]
    Persist(String),
}

/// Plan generation errors.
///
/// Transient kinds are retried with backoff; `Malformed` is not retried and
/// the fingerprint stays marked so the alert cannot replay within the run.
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("LLM request failed: {0}")]
    Network(String),

    #[error("LLM request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("LLM endpoint returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("LLM response body unreadable: {0}")]
    Body(String),

    #[error("LLM output contains no remediation plan array: {preview}")]
    Malformed { preview: String },
}

impl PlannerError {
    /// Whether the retry combinator should re-run the generate call.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Malformed { .. })
    }

    /// Journal tag for the error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "planner_malformed",
            _ => "planner_transient",
        }
    }
}

/// Coder-agent session errors, mapped to execution outcomes.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Cannot reach coder agent at {base_url}: {reason}")]
    Connect { base_url: String, reason: String },

    #[error("Coder agent returned HTTP {status} on {operation}")]
    Http { status: u16, operation: &'static str },

    #[error("Attempt deadline elapsed after {seconds}s")]
    Deadline { seconds: u64 },

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Coder agent protocol violation: {0}")]
    Protocol(String),
}

impl SessionError {
    /// Terminal status an attempt failing with this error reports.
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Connect { .. } => ExecutionStatus::ConnectError,
            Self::Deadline { .. } => ExecutionStatus::Timeout,
            _ => ExecutionStatus::Failure,
        }
    }

    /// Whether the executor may start a fresh attempt for this failure.
    ///
    /// 4xx answers mean the agent rejected the request; retrying the same
    /// plan would reject again, so only transport-level failures, 5xx and
    /// deadlines are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Deadline { .. } | Self::Stream(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Protocol(_) => false,
        }
    }
}

/// Result alias used across the runtime.
pub type DefenderResult<T> = Result<T, DefenderError>;

//! Error types for the Parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; every error can be
//! classified into an [`ErrorKind`] so the turn loop can decide between
//! retrying, reporting, and recording the failure in history.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Backend errors ---
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Persistence errors ---
    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),

    // --- Context management errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error into the orchestrator-level taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend(e) => e.kind(),
            Self::Tool(e) => e.kind(),
            Self::Store(_) => ErrorKind::PersistenceFailure,
            Self::Context(e) => e.kind(),
            Self::Config { .. } => ErrorKind::InvalidConfiguration,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Unknown,
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Orchestrator-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedBackend,
    InvalidConfiguration,
    Authentication,
    Network,
    RateLimited,
    ServiceUnavailable,
    InvalidRequest,
    ContextLengthExceeded,
    ContentFiltered,
    ToolNotFound,
    ToolInputInvalid,
    ToolFailed,
    PersistenceFailure,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnsupportedBackend => "unsupported_backend",
            Self::InvalidConfiguration => "invalid_configuration",
            Self::Authentication => "authentication",
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::InvalidRequest => "invalid_request",
            Self::ContextLengthExceeded => "context_length_exceeded",
            Self::ContentFiltered => "content_filtered",
            Self::ToolNotFound => "tool_not_found",
            Self::ToolInputInvalid => "tool_input_invalid",
            Self::ToolFailed => "tool_failed",
            Self::PersistenceFailure => "persistence_failure",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Unsupported backend: {0}")]
    Unsupported(String),

    #[error("Invalid backend configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by backend, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Content filtered: {0}")]
    ContentFiltered(String),

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unexpected backend error: {0}")]
    Unknown(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unsupported(_) => ErrorKind::UnsupportedBackend,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Network(_) | Self::Timeout { .. } | Self::Cancelled => ErrorKind::Network,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::ContextLengthExceeded(_) => ErrorKind::ContextLengthExceeded,
            Self::ContentFiltered(_) => ErrorKind::ContentFiltered,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether a bounded retry may succeed. Timeouts and cancellations are
    /// not retried: the caller already gave up on them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::ServiceUnavailable(_)
        )
    }

    /// Map an HTTP status and response body to the error taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let lower = body.to_lowercase();
        match status {
            401 | 403 => Self::Authentication(body),
            408 => Self::Network(body),
            429 => Self::RateLimited { retry_after_secs: 5 },
            400 | 413 | 422
                if lower.contains("context_length")
                    || lower.contains("context length")
                    || lower.contains("too many tokens")
                    || lower.contains("prompt is too long") =>
            {
                Self::ContextLengthExceeded(body)
            }
            400..=499 => Self::InvalidRequest(body),
            500..=599 => Self::ServiceUnavailable(body),
            _ => Self::Unknown(format!("status {status}: {body}")),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid input for tool {tool_name}: {reason}")]
    InvalidInput { tool_name: String, reason: String },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Duplicate category: {0}")]
    DuplicateCategory(String),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("Category not found: {0}")]
    CategoryNotFound(String),

    #[error("Permission denied for category {category}: {reason}")]
    PermissionDenied { category: String, reason: String },
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::ToolNotFound,
            Self::InvalidInput { .. } => ErrorKind::ToolInputInvalid,
            Self::ExecutionFailed { .. } | Self::Timeout { .. } => ErrorKind::ToolFailed,
            Self::DuplicateCategory(_)
            | Self::DuplicateTool(_)
            | Self::CategoryNotFound(_)
            | Self::PermissionDenied { .. } => ErrorKind::InvalidConfiguration,
        }
    }

    /// Shorthand used by tools when serde decoding of their arguments fails.
    pub fn invalid_input(tool_name: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            tool_name: tool_name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a failed tool operation.
    pub fn failed(tool_name: &str, reason: impl std::fmt::Display) -> Self {
        Self::ExecutionFailed {
            tool_name: tool_name.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to encode session {session_id}: {reason}")]
    Encode { session_id: String, reason: String },

    #[error("Failed to decode session {session_id}: {reason}")]
    Decode { session_id: String, reason: String },

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Summarization failed: {0}")]
    Summarization(#[from] BackendError),

    #[error("Summarization queue is full ({max_depth} tasks)")]
    QueueFull { max_depth: usize },

    #[error("Nothing to summarize")]
    EmptySummaryInput,

    #[error("Selection failed: {0}")]
    Selection(String),
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Summarization(e) => e.kind(),
            _ => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_displays_correctly() {
        let err = Error::Backend(BackendError::RateLimited {
            retry_after_secs: 30,
        });
        assert!(err.to_string().contains("30s"));
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn timeout_is_classified_as_network() {
        let err = BackendError::Timeout { timeout_secs: 60 };
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(BackendError::from_status(401, "nope").kind(), ErrorKind::Authentication);
        assert_eq!(BackendError::from_status(429, "").kind(), ErrorKind::RateLimited);
        assert_eq!(BackendError::from_status(503, "down").kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(
            BackendError::from_status(400, "This model's maximum context length is 8192 tokens")
                .kind(),
            ErrorKind::ContextLengthExceeded
        );
        assert_eq!(BackendError::from_status(400, "bad json").kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn retryable_kinds() {
        assert!(BackendError::Network("reset".into()).is_retryable());
        assert!(BackendError::ServiceUnavailable("502".into()).is_retryable());
        assert!(!BackendError::Authentication("bad key".into()).is_retryable());
        assert!(!BackendError::ContentFiltered("blocked".into()).is_retryable());
    }

    #[test]
    fn tool_error_kinds() {
        assert_eq!(ToolError::NotFound("x".into()).kind(), ErrorKind::ToolNotFound);
        assert_eq!(
            ToolError::invalid_input("read_file", "missing path").kind(),
            ErrorKind::ToolInputInvalid
        );
        let err = Error::Tool(ToolError::failed("shell", "exit 1"));
        assert_eq!(err.kind(), ErrorKind::ToolFailed);
        assert!(err.to_string().contains("shell"));
    }
}

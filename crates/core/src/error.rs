//! Error types for the MetricChat domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the retry classification
//! shared by tools and the model provider lives here as well so the
//! retryable/terminal rule is written exactly once.

use thiserror::Error;

// --- Retry classification ---

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Resource contention, rate limits, network blips, timeouts.
    Retryable,
    /// Invalid arguments, permission denied, anything deterministic.
    Terminal,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

/// Errors that know their default retry classification.
pub trait Classify {
    fn failure_class(&self) -> FailureClass;
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl Classify for ProviderError {
    fn failure_class(&self) -> FailureClass {
        match self {
            Self::RateLimited { .. }
            | Self::StreamInterrupted(_)
            | Self::Timeout(_)
            | Self::Network(_) => FailureClass::Retryable,
            Self::ApiError { status_code, .. } if *status_code == 429 || *status_code >= 500 => {
                FailureClass::Retryable
            }
            Self::ApiError { .. } | Self::AuthenticationFailed(_) | Self::NotConfigured(_) => {
                FailureClass::Terminal
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool execution failed: {tool_name} ({reason})")]
    ExecutionFailed { tool_name: String, reason: String },

    /// The capability reported a temporary condition (lock contention,
    /// upstream rate limit) and asked to be retried.
    #[error("Tool temporarily unavailable: {tool_name} ({reason})")]
    Unavailable { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Permission denied: {tool_name} ({reason})")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Tool panicked: {0}")]
    Panicked(String),
}

impl Classify for ToolError {
    fn failure_class(&self) -> FailureClass {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Network(_) => {
                FailureClass::Retryable
            }
            Self::ExecutionFailed { .. }
            | Self::PermissionDenied { .. }
            | Self::InvalidArguments(_)
            | Self::Panicked(_) => FailureClass::Terminal,
        }
    }
}

/// A requested tool could not be turned into a dispatchable call.
#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    #[error("Unknown tool '{name}' (available: {})", .available.join(", "))]
    UnknownTool {
        name: String,
        available: Vec<String>,
    },

    #[error("Invalid arguments for '{tool_name}': {source}")]
    InvalidArguments {
        tool_name: String,
        #[source]
        source: ValidationError,
    },
}

/// Argument schema violations found before dispatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("arguments must be a JSON object, got {found}")]
    NotAnObject { found: String },

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' must be {expected}, got {found}")]
    WrongType {
        field: String,
        expected: String,
        found: String,
    },

    #[error("field '{field}' must be one of [{}], got {value}", .allowed.join(", "))]
    NotAllowed {
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("unknown field '{0}'")]
    UnknownField(String),
}

/// The model's decision stream could not be turned into a PlannerDecision.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("stream ended before any decision object started")]
    Empty,

    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("stream ended before the decision object closed (depth {depth})")]
    Unterminated { depth: usize },

    #[error("unexpected content after the decision object at offset {offset}")]
    TrailingContent { offset: usize },

    #[error("decision has an invalid shape: {0}")]
    Shape(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Out-of-order append for session {session_id}: expected index {expected}, got {got}")]
    OutOfOrder {
        session_id: String,
        expected: u32,
        got: u32,
    },

    #[error("Corrupted record in {location}: {reason}")]
    Corrupted { location: String, reason: String },
}

//! Error types for the reagent domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator boundary has its own error enum; [`Error`] is the
//! top-level type the engine propagates internally. Callers never see it
//! directly: the engine turns it into an [`ErrorCode`] on the result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all reagent operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model call errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors (only faults reach this level; failures are data) ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// The guard or a before-start hook refused the invocation.
    #[error("Rejected ({category}): {reason}")]
    Rejected { reason: String, category: String },

    /// Cancellation is never classified or retried; every layer re-raises it.
    #[error("Execution cancelled")]
    Cancelled,

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Provider(ProviderError::Cancelled))
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Malformed request: {0}")]
    InvalidRequest(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Model call cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool task faulted: {0}")]
    Fault(String),
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("Hook '{hook}' failed: {reason}")]
    Failed { hook: String, reason: String },
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Guard unavailable: {0}")]
    Unavailable(String),

    #[error("Guard check failed: {0}")]
    CheckFailed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Missing session id in command metadata")]
    MissingSession,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Retrieval failed: {0}")]
    Failed(String),
}

/// Stable, caller-visible classification of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    Timeout,
    ContextTooLong,
    ToolError,
    InvalidResponse,
    /// Guard or hook refusal.
    Rejected,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ContextTooLong => "CONTEXT_TOO_LONG",
            ErrorCode::ToolError => "TOOL_ERROR",
            ErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ErrorCode::Rejected => "REJECTED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

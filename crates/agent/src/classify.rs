//! Error classification.
//!
//! [`classify`] maps a terminal error to the caller-visible [`ErrorCode`]
//! by inspecting its message text, the same way whatever upstream client
//! raised it would be read by a human. [`is_transient`] decides whether
//! the retry controller may try a failed model call again.

use reagent_core::error::{Error, ErrorCode, ProviderError};

/// Map an error to a stable code. Order matters: the first phrase wins.
pub fn classify(error: &Error) -> ErrorCode {
    if let Error::Rejected { .. } = error {
        return ErrorCode::Rejected;
    }
    classify_message(&error.to_string())
}

/// Classify free text (also used for errors from foreign sources).
pub fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();

    if lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("too many requests")
    {
        ErrorCode::RateLimited
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorCode::Timeout
    } else if lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("context_length")
        || lower.contains("too long")
        || lower.contains("maximum context")
    {
        ErrorCode::ContextTooLong
    } else if lower.contains("tool") {
        ErrorCode::ToolError
    } else if lower.contains("invalid response") {
        ErrorCode::InvalidResponse
    } else {
        ErrorCode::Unknown
    }
}

/// Whether a failed model call is worth retrying.
///
/// Transient: rate limits, timeouts, 5xx, connection-level failures.
/// Permanent: authentication, context length, malformed requests, and
/// anything else we cannot positively identify as transient.
/// Cancellation is never transient.
pub fn is_transient(error: &ProviderError) -> bool {
    match error {
        ProviderError::RateLimited { .. }
        | ProviderError::Timeout(_)
        | ProviderError::Network(_)
        | ProviderError::StreamInterrupted(_) => true,
        ProviderError::ApiError { status_code, message } => match status_code {
            408 | 429 => true,
            500..=599 => true,
            400..=499 => false,
            _ => matches!(
                classify_message(message),
                ErrorCode::RateLimited | ErrorCode::Timeout
            ),
        },
        ProviderError::AuthenticationFailed(_)
        | ProviderError::ContextLengthExceeded(_)
        | ProviderError::InvalidRequest(_)
        | ProviderError::ModelNotFound(_)
        | ProviderError::InvalidResponse(_)
        | ProviderError::NotConfigured(_)
        | ProviderError::Cancelled => false,
    }
}

//! Error classification for handler failures.
//!
//! Classification works on the error message text so that foreign errors
//! (from arbitrary handlers) can be bucketed without a shared error type.
//! Engine-produced errors (timeouts, missing handlers) phrase their
//! messages so they classify correctly by construction.

use serde::{Deserialize, Serialize};

/// Coarse error category recorded on execution logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    NetworkError,
    RateLimit,
    MemoryError,
    PermissionError,
    ValidationError,
    NotFound,
    HandlerError,
    UnknownError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::MemoryError => "MEMORY_ERROR",
            ErrorCode::PermissionError => "PERMISSION_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TIMEOUT" => Ok(ErrorCode::Timeout),
            "NETWORK_ERROR" => Ok(ErrorCode::NetworkError),
            "RATE_LIMIT" => Ok(ErrorCode::RateLimit),
            "MEMORY_ERROR" => Ok(ErrorCode::MemoryError),
            "PERMISSION_ERROR" => Ok(ErrorCode::PermissionError),
            "VALIDATION_ERROR" => Ok(ErrorCode::ValidationError),
            "NOT_FOUND" => Ok(ErrorCode::NotFound),
            "HANDLER_ERROR" => Ok(ErrorCode::HandlerError),
            "UNKNOWN_ERROR" => Ok(ErrorCode::UnknownError),
            other => Err(crate::error::DomainError::validation(format!(
                "unknown error code '{other}'"
            ))),
        }
    }
}

/// Classify an error message by ordered case-insensitive substring match.
pub fn classify_error(message: &str) -> ErrorCode {
    let m = message.to_lowercase();
    if m.contains("timeout") {
        ErrorCode::Timeout
    } else if m.contains("network") || m.contains("econnrefused") {
        ErrorCode::NetworkError
    } else if m.contains("rate limit") {
        ErrorCode::RateLimit
    } else if m.contains("memory") {
        ErrorCode::MemoryError
    } else if m.contains("permission") || m.contains("forbidden") {
        ErrorCode::PermissionError
    } else if m.contains("validation") {
        ErrorCode::ValidationError
    } else if m.contains("not found") {
        ErrorCode::NotFound
    } else if m.contains("handler") {
        ErrorCode::HandlerError
    } else {
        ErrorCode::UnknownError
    }
}

const NON_RETRYABLE_MARKERS: &[&str] = &[
    "validation",
    "invalid",
    "not found",
    "unauthorized",
    "forbidden",
    "no handler",
    "syntax error",
];

/// Whether a failure is permanent regardless of retries remaining.
pub fn is_non_retryable(message: &str) -> bool {
    let m = message.to_lowercase();
    NON_RETRYABLE_MARKERS.iter().any(|marker| m.contains(marker))
}

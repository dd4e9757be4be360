//! Error types and the closed classification taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of task error classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    Network,
    InvalidApiKey,
    /// Malformed or 5xx provider responses
    ModelError,
    UserCancelled,
    UserPaused,
    /// Recovery marker for tasks found `sending` at process start
    AppCrashed,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Network => "NETWORK",
            ErrorKind::InvalidApiKey => "INVALID_API_KEY",
            ErrorKind::ModelError => "MODEL_ERROR",
            ErrorKind::UserCancelled => "USER_CANCELLED",
            ErrorKind::UserPaused => "USER_PAUSED",
            ErrorKind::AppCrashed => "APP_CRASHED",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify an HTTP status code, if it maps to a known kind
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        429 => Some(ErrorKind::RateLimit),
        401 | 403 => Some(ErrorKind::InvalidApiKey),
        408 | 504 => Some(ErrorKind::Timeout),
        s if s >= 500 => Some(ErrorKind::ModelError),
        _ => None,
    }
}

/// Fallback classification by message substring
pub fn classify_message(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();
    if msg.contains("rate limit") || msg.contains("too many requests") {
        ErrorKind::RateLimit
    } else if msg.contains("timeout") || msg.contains("timed out") {
        ErrorKind::Timeout
    } else if msg.contains("api key") || msg.contains("unauthorized") || msg.contains("forbidden")
    {
        ErrorKind::InvalidApiKey
    } else if msg.contains("network")
        || msg.contains("connection")
        || msg.contains("dns")
        || msg.contains("connect")
    {
        ErrorKind::Network
    } else if msg.contains("cancel") {
        ErrorKind::UserCancelled
    } else {
        ErrorKind::Unknown
    }
}

/// Translation-related errors
#[derive(Error, Debug)]
pub enum TranslationError {
    /// Provider returned a non-success status
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// Provider signalled rate limiting
    #[error("Rate limit exceeded. Retry after {retry_after:?} seconds")]
    RateLimitError { retry_after: Option<u64> },

    /// Request timed out
    #[error("Request timeout")]
    TimeoutError,

    /// Network failure before a response arrived
    #[error("Network error: {message}")]
    NetworkError { message: String },

    /// Response arrived but could not be interpreted
    #[error("Invalid response: {message}")]
    InvalidResponseError { message: String },

    /// In-flight call aborted by the user
    #[error("Cancelled by user")]
    Cancelled,

    /// Task state transition or lookup failure
    #[error("Task state error: {message}")]
    StateError { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Reqwest error
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TranslationError {
    /// Classify this error into the closed taxonomy.
    ///
    /// HTTP status wins over message matching; anything unmatched is
    /// `UNKNOWN`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslationError::ApiError { status, message } => {
                classify_status(*status).unwrap_or_else(|| classify_message(message))
            }
            TranslationError::RateLimitError { .. } => ErrorKind::RateLimit,
            TranslationError::TimeoutError => ErrorKind::Timeout,
            TranslationError::NetworkError { .. } => ErrorKind::Network,
            TranslationError::InvalidResponseError { .. } => ErrorKind::ModelError,
            TranslationError::Cancelled => ErrorKind::UserCancelled,
            TranslationError::HttpError(e) => {
                if e.is_timeout() {
                    ErrorKind::Timeout
                } else if e.is_connect() {
                    ErrorKind::Network
                } else {
                    classify_message(&e.to_string())
                }
            }
            TranslationError::JsonError(_) => ErrorKind::ModelError,
            TranslationError::StateError { .. }
            | TranslationError::ConfigError { .. }
            | TranslationError::IoError(_) => ErrorKind::Unknown,
        }
    }
}

/// Result type for scheduling and translation operations
pub type Result<T> = std::result::Result<T, TranslationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(429), Some(ErrorKind::RateLimit));
        assert_eq!(classify_status(401), Some(ErrorKind::InvalidApiKey));
        assert_eq!(classify_status(403), Some(ErrorKind::InvalidApiKey));
        assert_eq!(classify_status(408), Some(ErrorKind::Timeout));
        assert_eq!(classify_status(504), Some(ErrorKind::Timeout));
        assert_eq!(classify_status(500), Some(ErrorKind::ModelError));
        assert_eq!(classify_status(502), Some(ErrorKind::ModelError));
        assert_eq!(classify_status(404), None);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(classify_message("Rate limit hit, slow down"), ErrorKind::RateLimit);
        assert_eq!(classify_message("request timed out"), ErrorKind::Timeout);
        assert_eq!(classify_message("connection refused"), ErrorKind::Network);
        assert_eq!(classify_message("invalid API key"), ErrorKind::InvalidApiKey);
        assert_eq!(classify_message("something else entirely"), ErrorKind::Unknown);
    }

    #[test]
    fn test_status_wins_over_message() {
        let err = TranslationError::ApiError {
            status: 429,
            message: "connection closed".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimit);
    }

    #[test]
    fn test_api_error_falls_back_to_message() {
        let err = TranslationError::ApiError {
            status: 400,
            message: "too many requests from this key".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimit);
    }

    #[test]
    fn test_cancelled_kind() {
        assert_eq!(TranslationError::Cancelled.kind(), ErrorKind::UserCancelled);
    }
}

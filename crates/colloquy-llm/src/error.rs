//! Error types for the LLM crate.
//!
//! The variants map onto three classes:
//! - configuration errors (`Config`): raised before any network call, never retried
//! - transient errors (`Network`, `Timeout`, `Server`, `RateLimit`): retried with backoff
//! - permanent errors (`Auth`, `InvalidRequest`, ...): surfaced immediately

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the LLM error type.
pub type Result<T> = std::result::Result<T, LlmError>;

// ─────────────────────────────────────────────────────────────────────────────
// Rate Limit Info
// ─────────────────────────────────────────────────────────────────────────────

/// Information about a rate limit error.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    /// The error message from the provider.
    pub message: String,
    /// How long to wait before retrying (if the provider specified).
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// Create a new rate limit info with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Parse rate limit info from a response body and optional `Retry-After` header.
    ///
    /// Falls back to the "try again in 6.5s" phrasing Groq embeds in its messages.
    pub fn parse(message: &str, retry_after_header: Option<&str>) -> Self {
        let retry_after = retry_after_header
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .or_else(|| parse_try_again_in(message));

        Self {
            message: message.to_string(),
            retry_after,
        }
    }
}

impl std::fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(retry_after) = self.retry_after {
            write!(f, " (retry after {:.2}s)", retry_after.as_secs_f64())?;
        }
        Ok(())
    }
}

fn parse_try_again_in(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    let idx = lower.find("try again in ")?;
    let rest = &lower[idx + "try again in ".len()..];
    let num: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let seconds = num.parse::<f64>().ok()?;
    if rest[num.len()..].starts_with("ms") {
        Some(Duration::from_secs_f64(seconds / 1000.0))
    } else {
        Some(Duration::from_secs_f64(seconds))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Error
// ─────────────────────────────────────────────────────────────────────────────

/// Error type for LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Backend/API error from the provider.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Network/connectivity error (retryable).
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded its deadline (retryable).
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Provider returned a 5xx status (retryable).
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Configuration error (missing credential, etc.). Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid request parameters.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Rate limit exceeded (retryable with backoff).
    #[error("Rate limit exceeded: {0}")]
    RateLimit(RateLimitInfo),

    /// Authentication failed.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LlmError {
    /// Create a rate limit error from a message string.
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(RateLimitInfo::new(message))
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Get the retry-after duration if this is a rate limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit(info) => info.retry_after,
            _ => None,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Server { .. } | Self::RateLimit(_)
        )
    }

    /// Returns true for configuration errors.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Map an HTTP error status and body into the taxonomy.
    pub fn from_status(status: u16, body: &str, retry_after: Option<&str>) -> Self {
        match status {
            401 | 403 => Self::Auth(body.to_string()),
            408 => Self::Timeout(body.to_string()),
            429 => Self::RateLimit(RateLimitInfo::parse(body, retry_after)),
            400 | 404 | 422 => Self::InvalidRequest(body.to_string()),
            500..=599 => Self::Server {
                status,
                message: body.to_string(),
            },
            _ => Self::Backend(format!("{}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else if err.is_connect() {
            LlmError::Network(format!("Connection failed: {}", err))
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Serialization(err.to_string())
    }
}

//! Error types for MCP operations.

use thiserror::Error;

/// Result type for MCP operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Error type for MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Failed to reach the MCP server.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server returned an error response.
    #[error("server error {code}: {message}")]
    ServerError {
        /// Error code from the server.
        code: i64,
        /// Error message from the server.
        message: String,
        /// Optional additional data.
        data: Option<serde_json::Value>,
    },

    /// The server rejected our credentials (HTTP 401/403).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success HTTP status other than an auth rejection.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Tool execution failed.
    #[error("tool error: {0}")]
    ToolError(String),

    /// Server not initialized.
    #[error("server not initialized")]
    NotInitialized,

    /// Timeout waiting for response.
    #[error("timeout waiting for response")]
    Timeout,
}

impl McpError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a server error from an error response.
    pub fn server_error(
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
            data,
        }
    }

    /// Create a tool error.
    pub fn tool_error(msg: impl Into<String>) -> Self {
        Self::ToolError(msg.into())
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Unauthorized(body),
            _ => Self::Http { status, body },
        }
    }

    /// Whether the failure is worth another attempt.
    ///
    /// Network failures, timeouts, rate limits and 5xx responses are
    /// transient. Everything else (auth, protocol, tool errors) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::ServerError { code, .. } => *code == crate::protocol::JsonRpcError::INTERNAL_ERROR,
            _ => false,
        }
    }

    /// Whether the server rejected the caller's credentials.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::ServerError { message, .. } => {
                let message = message.to_lowercase();
                message.contains("unauthorized")
                    || message.contains("unauthenticated")
                    || message.contains("authentication")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = McpError::transport("connection refused");
        assert!(err.to_string().contains("transport"));
        assert!(err.to_string().contains("connection refused"));

        let err = McpError::server_error(-32600, "Invalid Request", None);
        assert!(err.to_string().contains("-32600"));
        assert!(err.to_string().contains("Invalid Request"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let mcp_err: McpError = json_err.into();
        assert!(matches!(mcp_err, McpError::Json(_)));
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            McpError::from_status(401, "no token"),
            McpError::Unauthorized(_)
        ));
        assert!(matches!(
            McpError::from_status(403, "forbidden"),
            McpError::Unauthorized(_)
        ));
        assert!(matches!(
            McpError::from_status(502, "bad gateway"),
            McpError::Http { status: 502, .. }
        ));
    }

    #[test]
    fn test_retry_classification() {
        assert!(McpError::Timeout.is_retryable());
        assert!(McpError::transport("reset").is_retryable());
        assert!(McpError::from_status(503, "").is_retryable());
        assert!(McpError::from_status(429, "").is_retryable());
        assert!(!McpError::from_status(400, "").is_retryable());
        assert!(!McpError::from_status(401, "").is_retryable());
        assert!(!McpError::protocol("bad frame").is_retryable());
        assert!(!McpError::tool_error("boom").is_retryable());
    }

    #[test]
    fn test_auth_classification() {
        assert!(McpError::Unauthorized("expired".into()).is_auth());
        assert!(McpError::server_error(-32001, "Unauthorized: token expired", None).is_auth());
        assert!(!McpError::server_error(-32603, "internal", None).is_auth());
        assert!(!McpError::Timeout.is_auth());
    }
}

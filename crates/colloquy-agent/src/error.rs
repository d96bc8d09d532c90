//! Error types for the agent crate.

use thiserror::Error;

/// Result type alias using the agent error type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Error type for agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// LLM backend error.
    #[error("LLM error: {0}")]
    Llm(#[from] colloquy_llm::LlmError),

    /// Remote tool catalog error.
    #[error("MCP error: {0}")]
    Mcp(#[from] colloquy_mcp::McpError),

    /// Tool execution error.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Tool not found in registry.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Invalid tool parameters.
    #[error("Invalid tool parameters: {0}")]
    InvalidToolParams(String),

    /// Conversation store error.
    #[error("Store error: {0}")]
    Store(String),

    /// Memory manager error.
    #[error("Memory error: {0}")]
    Memory(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task was cancelled.
    #[error("Task cancelled")]
    Cancelled,

    /// An operation ran past its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Maximum iterations exceeded.
    #[error("Maximum iterations exceeded: {0}")]
    MaxIterations(u32),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create a tool error.
    pub fn tool(msg: impl Into<String>) -> Self {
        Self::Tool(msg.into())
    }

    /// Create an invalid-parameters error.
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidToolParams(msg.into())
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a memory error.
    pub fn memory(msg: impl Into<String>) -> Self {
        Self::Memory(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Configuration problems are fatal and never retried.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Llm(e) => e.is_config(),
            _ => false,
        }
    }

    /// Remote failures caused by rejected credentials.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Mcp(e) => e.is_auth(),
            Self::Llm(colloquy_llm::LlmError::Auth(_)) => true,
            _ => false,
        }
    }

    /// Failures that will not change on a second attempt.
    ///
    /// Remote errors defer to the catalog's own classification: only
    /// transport failures, timeouts, 429 and 5xx are worth retrying.
    pub fn is_permanent(&self) -> bool {
        self.is_auth()
            || self.is_config()
            || matches!(self, Self::Mcp(e) if !e.is_retryable())
            || matches!(
                self,
                Self::InvalidToolParams(_) | Self::ToolNotFound(_) | Self::Cancelled
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::tool("failed to reach search API");
        assert!(err.to_string().contains("Tool error"));
        assert!(err.to_string().contains("failed to reach search API"));
    }

    #[test]
    fn test_tool_not_found() {
        let err = AgentError::ToolNotFound("unknown_tool".to_string());
        assert!(err.to_string().contains("Tool not found"));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_classification() {
        let auth: AgentError = colloquy_mcp::McpError::Unauthorized("expired".into()).into();
        assert!(auth.is_auth());
        assert!(auth.is_permanent());

        let transient: AgentError = colloquy_mcp::McpError::Timeout.into();
        assert!(!transient.is_auth());
        assert!(!transient.is_permanent());

        let bad_request: AgentError = colloquy_mcp::McpError::from_status(400, "bad").into();
        assert!(bad_request.is_permanent());
        let rate_limited: AgentError = colloquy_mcp::McpError::from_status(429, "slow").into();
        assert!(!rate_limited.is_permanent());

        let config: AgentError = colloquy_llm::LlmError::config("missing key").into();
        assert!(config.is_config());
        assert!(AgentError::invalid_params("query is required").is_permanent());
    }
}

//! Tool executor.
//!
//! Runs the tool calls a model requested against the tools bound for the
//! turn and always produces exactly one [`ToolResultRecord`] per call, in
//! request order. Unknown tools, failures, timeouts and exhausted retries all
//! become descriptive in-band results; nothing here aborts a turn.

use std::time::Duration;

use crate::context::estimate_tokens;
use crate::error::AgentError;
use crate::tool::{DEFAULT_MAX_OUTPUT_SIZE, ToolContext, ToolRegistry, ToolResult, truncate_output};
use crate::types::{ToolCall, ToolResultRecord};

/// Timeout and retry settings for remote tool calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub initial_backoff: Duration,
    /// Upper bound for the delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Dispatches tool calls to built-in and remote tools.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    remote: RetryPolicy,
    max_output_size: usize,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutor {
    /// Create an executor with default remote policy.
    pub fn new() -> Self {
        Self {
            remote: RetryPolicy::default(),
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
        }
    }

    /// Use a different remote retry policy.
    pub fn with_remote_policy(mut self, policy: RetryPolicy) -> Self {
        self.remote = policy;
        self
    }

    /// Cap the size of tool output handed back to the model.
    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    /// Remote retry policy.
    pub fn remote_policy(&self) -> &RetryPolicy {
        &self.remote
    }

    /// Execute calls one after another, results in request order.
    pub async fn execute(
        &self,
        calls: &[ToolCall],
        registry: &ToolRegistry,
        ctx: &ToolContext,
    ) -> Vec<ToolResultRecord> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_call(call, registry, ctx).await);
        }
        results
    }

    /// Execute a single call.
    pub async fn execute_call(
        &self,
        call: &ToolCall,
        registry: &ToolRegistry,
        ctx: &ToolContext,
    ) -> ToolResultRecord {
        let Some(tool) = registry.get(&call.name) else {
            tracing::warn!(tool = %call.name, tool_call_id = %call.id, "Tool not found");
            return self.record(call, not_found(&call.name, registry));
        };

        let input = call.arguments.to_string();
        tracing::debug!(
            tool = %call.name,
            tool_call_id = %call.id,
            input_bytes = input.len(),
            input_tokens = estimate_tokens(&input),
            "Tool: executing"
        );

        let ctx = ctx.for_call(&call.id);
        let result = if tool.source().is_remote() {
            self.run_remote(call, tool.as_ref(), &ctx).await
        } else {
            match tool.execute(call.arguments.clone(), &ctx).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "Tool execution failed");
                    ToolResult::error(e.to_string())
                }
            }
        };

        self.record(call, result)
    }

    async fn run_remote(
        &self,
        call: &ToolCall,
        tool: &dyn crate::tool::Tool,
        ctx: &ToolContext,
    ) -> ToolResult {
        let policy = &self.remote;
        let attempts = policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if ctx.is_cancelled() {
                return ToolResult::error(format!("Tool '{}' was cancelled", call.name));
            }

            let outcome =
                tokio::time::timeout(policy.timeout, tool.execute(call.arguments.clone(), ctx))
                    .await;

            let error = match outcome {
                Ok(Ok(result)) => return result,
                Ok(Err(e)) => e,
                Err(_) => AgentError::Timeout(policy.timeout),
            };

            if error.is_auth() {
                tracing::warn!(tool = %call.name, error = %error, "Remote tool authentication failed");
                return ToolResult::error(format!(
                    "Authentication failed for tool '{}': {}. Reconnect the integration and try again.",
                    call.name, error
                ));
            }
            if error.is_permanent() {
                tracing::warn!(tool = %call.name, error = %error, "Remote tool failed permanently");
                return ToolResult::error(error.to_string());
            }

            last_error = error.to_string();
            if attempt < attempts {
                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    tool = %call.name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "Remote tool failed, retrying"
                );
                tokio::select! {
                    _ = ctx.cancellation.cancelled() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        tracing::warn!(tool = %call.name, attempts, error = %last_error, "Remote tool retries exhausted");
        ToolResult::error(format!(
            "Tool '{}' failed after {} attempts: {}",
            call.name, attempts, last_error
        ))
    }

    fn record(&self, call: &ToolCall, result: ToolResult) -> ToolResultRecord {
        let content = truncate_output(result.to_llm_content(), self.max_output_size);
        tracing::debug!(
            tool = %call.name,
            tool_call_id = %call.id,
            success = result.is_success(),
            output_bytes = content.len(),
            "Tool: finished"
        );
        ToolResultRecord {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: result.is_success(),
            content,
            citations: result.citations,
        }
    }
}

fn not_found(name: &str, registry: &ToolRegistry) -> ToolResult {
    let available = if registry.is_empty() {
        "none".to_string()
    } else {
        registry.names().join(", ")
    };
    ToolResult::error(format!(
        "Tool '{}' not found. Available tools: {}",
        name, available
    ))
}

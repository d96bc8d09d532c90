//! Tool framework for agent capabilities.
//!
//! This module defines the [`Tool`] trait that all tools implement (built-in,
//! agent-specific, or remote MCP adapters), the per-invocation
//! [`ToolContext`], and the ordered [`ToolRegistry`].
//!
//! # Example
//!
//! ```rust,ignore
//! use colloquy_agent::{Tool, ToolContext, ToolResult, ToolRegistry};
//!
//! struct MyTool;
//!
//! #[async_trait]
//! impl Tool for MyTool {
//!     fn name(&self) -> &str { "my_tool" }
//!     fn description(&self) -> &str { "Does something useful" }
//!     fn parameters(&self) -> Value { json!({"type": "object"}) }
//!
//!     async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult> {
//!         Ok(ToolResult::text("Done!"))
//!     }
//! }
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(MyTool);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use colloquy_llm::UsageAccumulator;

use crate::bridge::{DuplexChannel, events};
use crate::error::{AgentError, Result};
use crate::types::{Citation, ConversationId, TurnId};

/// Tool output beyond this many bytes is truncated before reaching the model.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 64 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Parameter Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Error type for tool parameter validation failures.
///
/// Messages are phrased so the model can correct its next call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParameterValidationError {
    /// A required parameter is missing.
    #[error("missing required parameter '{name}': {hint}")]
    MissingRequired {
        /// The parameter name.
        name: &'static str,
        /// Hint for the LLM on how to fix.
        hint: &'static str,
    },

    /// A parameter value is out of range.
    #[error("'{name}' value {value} is out of range: {constraint}")]
    OutOfRange {
        /// The parameter name.
        name: &'static str,
        /// The actual value as string.
        value: String,
        /// Description of the valid range.
        constraint: String,
    },

    /// A parameter value is not acceptable.
    #[error("'{name}' has invalid value '{value}': {message}")]
    InvalidValue {
        /// The parameter name.
        name: &'static str,
        /// The invalid value.
        value: String,
        /// Why it's invalid.
        message: String,
    },
}

impl ParameterValidationError {
    /// Create a missing required parameter error.
    pub fn missing(name: &'static str, hint: &'static str) -> Self {
        Self::MissingRequired { name, hint }
    }

    /// Create an out of range error.
    pub fn out_of_range(
        name: &'static str,
        value: impl ToString,
        constraint: impl Into<String>,
    ) -> Self {
        Self::OutOfRange {
            name,
            value: value.to_string(),
            constraint: constraint.into(),
        }
    }

    /// Create an invalid value error.
    pub fn invalid_value(
        name: &'static str,
        value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            name,
            value: value.into(),
            message: message.into(),
        }
    }
}

impl From<ParameterValidationError> for AgentError {
    fn from(err: ParameterValidationError) -> Self {
        AgentError::InvalidToolParams(err.to_string())
    }
}

/// Result type for parameter validation.
pub type ParamResult<T> = std::result::Result<T, ParameterValidationError>;

/// Helper trait for extracting parameters from JSON.
pub trait ParamExt {
    /// Get a required, non-blank string parameter.
    fn required_str(&self, name: &'static str, hint: &'static str) -> ParamResult<&str>;

    /// Get an optional string parameter.
    fn optional_str(&self, name: &str) -> Option<&str>;

    /// Get an optional integer parameter with default.
    fn optional_i64(&self, name: &str, default: i64) -> i64;

    /// Get an optional u64 parameter with default.
    fn optional_u64(&self, name: &str, default: u64) -> u64;
}

impl ParamExt for serde_json::Value {
    fn required_str(&self, name: &'static str, hint: &'static str) -> ParamResult<&str> {
        self.get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ParameterValidationError::missing(name, hint))
    }

    fn optional_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    fn optional_i64(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(|v| v.as_i64()).unwrap_or(default)
    }

    fn optional_u64(&self, name: &str, default: u64) -> u64 {
        self.get(name).and_then(|v| v.as_u64()).unwrap_or(default)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Where a tool's implementation lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSource {
    /// Compiled into the engine.
    Builtin,
    /// Supplied by the agent profile for this turn.
    Agent,
    /// Served by a remote MCP catalog.
    Remote {
        /// Configured server name.
        server: String,
    },
}

impl ToolSource {
    /// Whether calls cross the network to a remote catalog.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Trait for agent tools.
///
/// Each tool defines its parameters as a JSON Schema and implements async
/// execution. Errors returned from [`Tool::execute`] are turned into result
/// messages by the executor; they never abort a turn.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the unique name of this tool.
    fn name(&self) -> &str;

    /// Get a human-readable description of what this tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for this tool's parameters.
    fn parameters(&self) -> serde_json::Value;

    /// Where the tool runs. Remote tools get timeouts and retries.
    fn source(&self) -> ToolSource {
        ToolSource::Builtin
    }

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Context
// ─────────────────────────────────────────────────────────────────────────────

/// Per-invocation context handed to every tool.
///
/// Everything a tool may need from the surrounding turn travels here
/// explicitly: the conversation it belongs to, its cancellation token, the
/// client channel for progress notices, and the turn's usage accumulator.
#[derive(Clone)]
pub struct ToolContext {
    /// Conversation this tool is running in.
    pub conversation_id: ConversationId,
    /// Turn this tool is running in.
    pub turn_id: TurnId,
    /// Token to check for cancellation.
    pub cancellation: CancellationToken,
    /// Tool call ID being served, if any.
    pub tool_call_id: Option<String>,
    /// Delegation depth (0 for the top-level agent).
    pub depth: u32,
    channel: Option<Arc<dyn DuplexChannel>>,
    usage: Option<Arc<UsageAccumulator>>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("conversation_id", &self.conversation_id)
            .field("turn_id", &self.turn_id)
            .field("tool_call_id", &self.tool_call_id)
            .field("depth", &self.depth)
            .field("has_channel", &self.channel.is_some())
            .finish()
    }
}

impl ToolContext {
    /// Create a new tool context.
    pub fn new(conversation_id: ConversationId, turn_id: TurnId) -> Self {
        Self {
            conversation_id,
            turn_id,
            cancellation: CancellationToken::new(),
            tool_call_id: None,
            depth: 0,
            channel: None,
            usage: None,
        }
    }

    /// Use the given cancellation token.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Route progress notices to a client channel.
    pub fn with_channel(mut self, channel: Arc<dyn DuplexChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Record tool-side spend into this accumulator.
    pub fn with_usage(mut self, usage: Arc<UsageAccumulator>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Context for serving one specific call.
    pub fn for_call(&self, tool_call_id: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.tool_call_id = Some(tool_call_id.into());
        ctx
    }

    /// Context for a delegated sub-agent run.
    pub fn child(&self) -> Self {
        let mut ctx = self.clone();
        ctx.tool_call_id = None;
        ctx.depth += 1;
        ctx
    }

    /// The turn's usage accumulator, if any.
    pub fn usage(&self) -> Option<&Arc<UsageAccumulator>> {
        self.usage.as_ref()
    }

    /// Check if execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Send a user-visible progress notice. Returns false without a channel.
    pub fn progress(&self, message: impl Into<String>) -> bool {
        let Some(channel) = &self.channel else {
            return false;
        };
        channel.emit(
            events::PROGRESS,
            serde_json::json!({
                "conversation_id": self.conversation_id,
                "tool_call_id": self.tool_call_id,
                "message": message.into(),
            }),
        );
        true
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new(ConversationId::new(), TurnId::new())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Result
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOutput {
    /// Successful text output.
    Text {
        /// The text content.
        content: String,
    },
    /// Successful JSON output.
    Json {
        /// The JSON content.
        content: serde_json::Value,
    },
    /// Tool execution failed.
    Error {
        /// Error message.
        message: String,
    },
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// What the tool produced.
    pub output: ToolOutput,
    /// Sources backing the output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl ToolResult {
    /// Create a text result.
    pub fn text(content: impl Into<String>) -> Self {
        Self::from_output(ToolOutput::Text {
            content: content.into(),
        })
    }

    /// Create a JSON result.
    pub fn json(content: serde_json::Value) -> Self {
        Self::from_output(ToolOutput::Json { content })
    }

    /// Create an error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self::from_output(ToolOutput::Error {
            message: message.into(),
        })
    }

    fn from_output(output: ToolOutput) -> Self {
        Self {
            output,
            citations: Vec::new(),
        }
    }

    /// Attach citations.
    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = citations;
        self
    }

    /// Check if this result is an error.
    pub fn is_error(&self) -> bool {
        matches!(self.output, ToolOutput::Error { .. })
    }

    /// Check if this result is successful.
    pub fn is_success(&self) -> bool {
        !self.is_error()
    }

    /// Plain-text rendering for the next model context.
    ///
    /// Strings pass through. JSON objects are reduced to their `content` or
    /// `text` field when it is a string, otherwise serialized.
    pub fn to_llm_content(&self) -> String {
        match &self.output {
            ToolOutput::Text { content } => content.clone(),
            ToolOutput::Json { content } => normalize_json(content),
            ToolOutput::Error { message } => format!("Error: {}", message),
        }
    }
}

fn normalize_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => ["content", "text"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Cut `content` to at most `max_bytes`, on a char boundary, with a marker.
pub fn truncate_output(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }
    let mut cut = max_bytes;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n\n[Output truncated: {} of {} bytes shown]",
        &content[..cut],
        cut,
        content.len()
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered collection of tools, unique by name.
///
/// Registration order is the catalog order used to break selection ties.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// A tool with the same name is replaced in place, keeping its position.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a tool from an Arc.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&pos) => self.tools[pos] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    /// Register a tool unless the name is already taken. Returns whether it was added.
    pub fn register_if_absent(&mut self, tool: Arc<dyn Tool>) -> bool {
        if self.contains(tool.name()) {
            return false;
        }
        self.register_arc(tool);
        true
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&pos| Arc::clone(&self.tools[pos]))
    }

    /// Check if a tool exists.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Tools in registration order.
    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Get the number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Convert all tools to LLM tool definitions.
    pub fn to_llm_definitions(&self) -> Vec<colloquy_llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| {
                colloquy_llm::ToolDefinition::new(
                    tool.name(),
                    tool.description(),
                    tool.parameters(),
                )
            })
            .collect()
    }

    /// A registry holding only the named tools, in the order given.
    ///
    /// Unknown names are ignored.
    pub fn filtered_by_names(&self, names: &[&str]) -> ToolRegistry {
        let mut filtered = ToolRegistry::new();
        for name in names {
            if let Some(tool) = self.get(name) {
                filtered.register_arc(tool);
            }
        }
        filtered
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl FromIterator<Arc<dyn Tool>> for ToolRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Tool>>>(iter: I) -> Self {
        let mut registry = ToolRegistry::new();
        for tool in iter {
            registry.register_arc(tool);
        }
        registry
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Tool (for testing)
// ─────────────────────────────────────────────────────────────────────────────

/// A mock tool for testing.
///
/// Returns a configurable response and tracks calls for verification.
#[cfg(test)]
#[derive(Debug)]
pub struct MockTool {
    name: String,
    description: String,
    source: ToolSource,
    response: std::sync::Mutex<Option<ToolResult>>,
    calls: std::sync::Mutex<Vec<serde_json::Value>>,
}

#[cfg(test)]
impl MockTool {
    /// Create a new mock tool.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "A mock tool for testing".to_string(),
            source: ToolSource::Builtin,
            response: std::sync::Mutex::new(None),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the source.
    pub fn with_source(mut self, source: ToolSource) -> Self {
        self.source = source;
        self
    }

    /// Set the response to return.
    pub fn with_response(self, response: ToolResult) -> Self {
        *self.response.lock().unwrap() = Some(response);
        self
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    fn source(&self) -> ToolSource {
        self.source.clone()
    }

    async fn execute(&self, params: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult> {
        self.calls.lock().unwrap().push(params);
        Ok(self
            .response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| ToolResult::text("mock response")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::InMemoryChannel;
    use serde_json::json;

    #[test]
    fn test_registry_keeps_order_and_replaces_in_place() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("b"));
        registry.register(MockTool::new("a"));
        registry.register(MockTool::new("c"));
        registry.register(MockTool::new("a").with_description("replaced"));

        assert_eq!(registry.names(), vec!["b", "a", "c"]);
        assert_eq!(registry.get("a").unwrap().description(), "replaced");
        assert!(!registry.register_if_absent(Arc::new(MockTool::new("c"))));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_filtered_by_names_follows_given_order() {
        let registry: ToolRegistry = ["x", "y", "z"]
            .into_iter()
            .map(|n| Arc::new(MockTool::new(n)) as Arc<dyn Tool>)
            .collect();
        let filtered = registry.filtered_by_names(&["z", "missing", "x"]);
        assert_eq!(filtered.names(), vec!["z", "x"]);
    }

    #[test]
    fn test_to_llm_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("get_current_time"));
        let defs = registry.to_llm_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "get_current_time");
    }

    #[test]
    fn test_result_normalization() {
        assert_eq!(ToolResult::text("plain").to_llm_content(), "plain");
        assert_eq!(
            ToolResult::json(json!({"content": "from field", "extra": 1})).to_llm_content(),
            "from field"
        );
        assert_eq!(
            ToolResult::json(json!({"text": "text field"})).to_llm_content(),
            "text field"
        );
        assert_eq!(
            ToolResult::json(json!({"a": 1})).to_llm_content(),
            r#"{"a":1}"#
        );
        assert_eq!(ToolResult::json(json!("bare")).to_llm_content(), "bare");
        assert_eq!(ToolResult::error("boom").to_llm_content(), "Error: boom");
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short".into(), 10), "short");
        let long = "é".repeat(10);
        let cut = truncate_output(long, 5);
        assert!(cut.starts_with("éé"));
        assert!(cut.contains("[Output truncated"));
    }

    #[test]
    fn test_param_ext() {
        let params = json!({"query": "rust", "blank": "  ", "n": 3});
        assert_eq!(params.required_str("query", "hint").unwrap(), "rust");
        assert!(params.required_str("blank", "hint").is_err());
        assert!(params.required_str("missing", "hint").is_err());
        assert_eq!(params.optional_u64("n", 5), 3);
        assert_eq!(params.optional_u64("m", 5), 5);

        let err: AgentError = ParameterValidationError::missing("query", "provide one").into();
        assert!(matches!(err, AgentError::InvalidToolParams(_)));
    }

    #[test]
    fn test_context_progress_goes_to_channel() {
        let channel = Arc::new(InMemoryChannel::new());
        let ctx = ToolContext::new(ConversationId::from("c1"), TurnId::new())
            .with_channel(channel.clone())
            .for_call("call_1");

        assert!(ctx.progress("Generating image..."));
        let emitted = channel.emitted_named(events::PROGRESS);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0]["tool_call_id"], "call_1");
        assert_eq!(emitted[0]["conversation_id"], "c1");

        assert!(!ToolContext::default().progress("nobody listening"));
    }

    #[test]
    fn test_child_context_increments_depth() {
        let ctx = ToolContext::default().for_call("call_1");
        let child = ctx.child();
        assert_eq!(child.depth, 1);
        assert!(child.tool_call_id.is_none());
        assert_eq!(child.conversation_id, ctx.conversation_id);
    }
}

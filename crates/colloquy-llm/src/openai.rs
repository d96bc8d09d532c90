//! OpenAI-compatible API backend implementation.
//!
//! This module provides `OpenAiBackend` which connects to OpenAI's chat
//! completions API or any compatible service (Groq, Ollama). Requests are
//! translated from the crate's Messages-shaped types; streamed chunks are
//! translated back into [`StreamEvent`]s.

use async_trait::async_trait;
use reqwest::{Client, Response, header};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    BlockStart, ContentDelta, LlmBackend, ResponseStream, StreamEvent, with_retry,
};
use crate::error::{LlmError, Result};
use crate::sse::{SseFrame, SseTranslator, translate_sse};
use crate::types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, Role, StopReason, ToolChoice,
    Usage,
};

/// Default OpenAI API base URL.
const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

/// Default Groq API base URL.
const DEFAULT_GROQ_BASE: &str = "https://api.groq.com/openai/v1";

/// Default Ollama API base URL.
const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434/v1";

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for authentication (optional for local services like Ollama).
    pub api_key: Option<String>,

    /// Base URL for the API.
    pub base_url: String,

    /// Request timeout.
    pub timeout: Duration,

    /// Maximum retries for transient errors.
    pub max_retries: u32,

    /// Initial backoff duration for retries.
    pub retry_backoff: Duration,

    /// Name for this backend instance.
    pub name: String,

    /// Merge all system sections into one leading system message.
    pub single_system_message: bool,
}

impl OpenAiConfig {
    fn base(name: &str, api_key: Option<String>, base_url: &str) -> Self {
        Self {
            api_key,
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            name: name.to_string(),
            single_system_message: false,
        }
    }

    /// Create a new config for OpenAI.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::base("openai", Some(api_key.into()), DEFAULT_OPENAI_BASE)
    }

    /// Create a new config for Groq.
    pub fn groq(api_key: impl Into<String>) -> Self {
        let mut config = Self::base("groq", Some(api_key.into()), DEFAULT_GROQ_BASE);
        config.single_system_message = true;
        config
    }

    /// Create a new config for Ollama (local).
    pub fn ollama() -> Self {
        let mut config = Self::base("ollama", None, DEFAULT_OLLAMA_BASE);
        // Local inference is slow on first load
        config.timeout = Duration::from_secs(600);
        config.single_system_message = true;
        config
    }

    /// Create config from environment for OpenAI.
    pub fn openai_from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            LlmError::Config("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::openai(api_key))
    }

    /// Create config from environment for Groq.
    pub fn groq_from_env() -> Result<Self> {
        let api_key = std::env::var("GROQ_API_KEY").map_err(|_| {
            LlmError::Config("GROQ_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::groq(api_key))
    }

    /// Set a custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the backend name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set max retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Force a single merged system message.
    pub fn with_single_system_message(mut self, single: bool) -> Self {
        self.single_system_message = single;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI Backend
// ─────────────────────────────────────────────────────────────────────────────

/// OpenAI-compatible API backend.
pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    /// Create a new OpenAI-compatible backend with the given configuration.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Create an OpenAI backend from environment.
    pub fn openai_from_env() -> Result<Self> {
        Self::new(OpenAiConfig::openai_from_env()?)
    }

    /// Create a Groq backend from environment.
    pub fn groq_from_env() -> Result<Self> {
        Self::new(OpenAiConfig::groq_from_env()?)
    }

    /// Create an Ollama backend with default local settings.
    pub fn ollama() -> Result<Self> {
        Self::new(OpenAiConfig::ollama())
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Build the chat completions endpoint URL.
    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url())
    }

    /// Add authentication headers to a request.
    fn add_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(header::CONTENT_TYPE, "application/json");

        match &self.config.api_key {
            Some(api_key) => builder.header(header::AUTHORIZATION, format!("Bearer {}", api_key)),
            None => builder,
        }
    }

    /// Convert our CompletionRequest to OpenAI-compatible format.
    fn to_openai_request(&self, request: &CompletionRequest) -> OpenAiChatRequest {
        let mut messages: Vec<OpenAiMessage> = Vec::new();

        if let Some(system) = request.system.as_ref().filter(|s| !s.is_empty()) {
            if self.config.single_system_message {
                messages.push(OpenAiMessage::text("system", system.to_text()));
            } else {
                for section in system.sections() {
                    messages.push(OpenAiMessage::text("system", section));
                }
            }
        }

        for message in &request.messages {
            convert_message(message, &mut messages);
        }

        let tools: Option<Vec<OpenAiTool>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAiTool {
                        tool_type: "function".to_string(),
                        function: OpenAiFunction {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        let tool_choice = match (&tools, &request.tool_choice) {
            (None, _) | (_, None) => None,
            (Some(_), Some(ToolChoice::Auto)) => Some(serde_json::json!("auto")),
            (Some(_), Some(ToolChoice::Any)) => Some(serde_json::json!("required")),
            (Some(_), Some(ToolChoice::None)) => Some(serde_json::json!("none")),
            (Some(_), Some(ToolChoice::Tool { name })) => Some(serde_json::json!({
                "type": "function",
                "function": {"name": name}
            })),
        };

        let stop = if request.stop_sequences.is_empty() {
            None
        } else {
            Some(request.stop_sequences.clone())
        };

        OpenAiChatRequest {
            model: request.model.clone(),
            messages,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions {
                include_usage: true,
            }),
            tools,
            tool_choice,
            stop,
        }
    }

    async fn send(&self, body: &OpenAiChatRequest) -> Result<Response> {
        let response = self
            .add_headers(self.client.post(self.completions_url()))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::handle_error_response(response).await);
        }
        Ok(response)
    }

    /// Handle an error response.
    async fn handle_error_response(response: Response) -> LlmError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<OpenAiErrorResponse>(&body) {
            Ok(error) => error.error.message,
            Err(_) => body,
        };

        LlmError::from_status(status, &message, retry_after.as_deref())
    }
}

/// Append the OpenAI rendition of one message.
///
/// Tool results become one `tool` message each; assistant tool uses become
/// `tool_calls`; images become `image_url` parts.
fn convert_message(message: &Message, out: &mut Vec<OpenAiMessage>) {
    let blocks = message.content.blocks();

    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in &blocks {
        match block {
            ContentBlock::Text { text } => parts.push(OpenAiContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => parts.push(OpenAiContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: source.to_url(),
                },
            }),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(OpenAiToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: OpenAiFunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut text = content.as_ref().map(|c| c.to_text()).unwrap_or_default();
                if *is_error && !text.starts_with("Error") {
                    text = format!("Error: {}", text);
                }
                out.push(OpenAiMessage {
                    role: "tool".to_string(),
                    content: Some(OpenAiContent::Text(text)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
        }
    }

    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    if !tool_calls.is_empty() {
        let text = parts_text(&parts);
        out.push(OpenAiMessage {
            role: "assistant".to_string(),
            content: (!text.is_empty()).then_some(OpenAiContent::Text(text)),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        });
        return;
    }

    if parts.is_empty() {
        return;
    }

    let content = if parts
        .iter()
        .any(|p| matches!(p, OpenAiContentPart::ImageUrl { .. }))
    {
        OpenAiContent::Parts(parts)
    } else {
        OpenAiContent::Text(parts_text(&parts))
    };

    out.push(OpenAiMessage {
        role: role.to_string(),
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    });
}

fn parts_text(parts: &[OpenAiContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            OpenAiContentPart::Text { text } => Some(text.as_str()),
            OpenAiContentPart::ImageUrl { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut request = request;
        request.stream = false;

        let openai_request = self.to_openai_request(&request);

        tracing::debug!(
            backend = %self.config.name,
            model = %openai_request.model,
            messages = openai_request.messages.len(),
            tools = openai_request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            "Sending OpenAI-compatible request"
        );

        with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            &self.config.name,
            || async {
                let response = self.send(&openai_request).await?;
                let body = response.text().await?;
                let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
                parsed.into_response()
            },
        )
        .await
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let mut request = request;
        request.stream = true;

        let openai_request = self.to_openai_request(&request);
        let response = with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            &self.config.name,
            || self.send(&openai_request),
        )
        .await?;

        Ok(translate_sse(
            response.bytes_stream(),
            OpenAiTranslator::default(),
        ))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn health_check(&self) -> Result<()> {
        let models_url = format!("{}/models", self.base_url());
        let response = self
            .add_headers(self.client.get(&models_url))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::handle_error_response(response).await)
        }
    }
}

/// Create a shared OpenAI-compatible backend.
pub fn create_shared_backend(config: OpenAiConfig) -> Result<Arc<dyn LlmBackend>> {
    Ok(Arc::new(OpenAiBackend::new(config)?))
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI API Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, serde::Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, serde::Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, serde::Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(OpenAiContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, serde::Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, serde::Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, serde::Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    id: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    model: String,
    usage: Option<OpenAiUsage>,
}

impl OpenAiChatResponse {
    fn into_response(self) -> Result<CompletionResponse> {
        let mut content = Vec::new();
        let mut finish_reason = None;

        if let Some(choice) = self.choices.into_iter().next() {
            if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
                content.push(ContentBlock::text(text));
            }
            for call in choice.message.tool_calls.unwrap_or_default() {
                let input = parse_arguments(&call.function.name, &call.function.arguments)?;
                content.push(ContentBlock::tool_use(call.id, call.function.name, input));
            }
            finish_reason = choice.finish_reason;
        }

        let has_tool_use = content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let stop_reason = map_finish_reason(finish_reason.as_deref(), has_tool_use);

        Ok(CompletionResponse::new(
            self.id,
            self.model,
            content,
            stop_reason,
            self.usage.map(Usage::from).unwrap_or_default(),
        ))
    }
}

fn parse_arguments(name: &str, arguments: &str) -> Result<serde_json::Value> {
    if arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(arguments).map_err(|e| {
        LlmError::Serialization(format!("invalid arguments for tool call '{}': {}", name, e))
    })
}

fn map_finish_reason(reason: Option<&str>, has_tool_use: bool) -> StopReason {
    match reason {
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some("stop") if has_tool_use => StopReason::ToolUse,
        Some(_) => StopReason::EndTurn,
        None if has_tool_use => StopReason::ToolUse,
        None => StopReason::EndTurn,
    }
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<OpenAiUsage> for Usage {
    fn from(usage: OpenAiUsage) -> Self {
        Usage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiError {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE Translation
// ─────────────────────────────────────────────────────────────────────────────

/// Stateful chunk → event translator.
///
/// OpenAI chunks carry no block structure, so this assigns block indices:
/// text gets one block, each tool call index gets its own. The stop reason
/// and the trailing usage chunk are held back and emitted together at
/// `[DONE]`.
#[derive(Debug, Default)]
struct OpenAiTranslator {
    started: bool,
    finished: bool,
    next_index: usize,
    text_index: Option<usize>,
    tool_indices: HashMap<usize, usize>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl OpenAiTranslator {
    fn closing_events(&mut self) -> Vec<StreamEvent> {
        if self.finished || !self.started {
            return Vec::new();
        }
        self.finished = true;
        let stop_reason =
            map_finish_reason(self.finish_reason.as_deref(), !self.tool_indices.is_empty());
        vec![
            StreamEvent::MessageDelta {
                stop_reason,
                usage: self.usage.unwrap_or_default(),
            },
            StreamEvent::MessageStop,
        ]
    }
}

impl SseTranslator for OpenAiTranslator {
    fn translate(&mut self, frame: SseFrame) -> Result<Vec<StreamEvent>> {
        let data = frame.data.trim();
        if data == "[DONE]" {
            return Ok(self.closing_events());
        }

        let chunk: OpenAiStreamChunk = serde_json::from_str(data)?;
        if let Some(error) = chunk.error {
            return Ok(vec![StreamEvent::Error {
                message: error.message,
            }]);
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
                usage: Usage::default(),
            });
        }

        if let Some(usage) = chunk
            .usage
            .or_else(|| chunk.x_groq.and_then(|x| x.usage))
        {
            self.usage = Some(usage.into());
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    let index = match self.text_index {
                        Some(index) => index,
                        None => {
                            let index = self.next_index;
                            self.next_index += 1;
                            self.text_index = Some(index);
                            events.push(StreamEvent::ContentBlockStart {
                                index,
                                block: BlockStart::Text,
                            });
                            index
                        }
                    };
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::TextDelta(text),
                    });
                }

                for call in delta.tool_calls.unwrap_or_default() {
                    let call_index = call.index.unwrap_or(0);
                    let function = call.function.unwrap_or_default();
                    let index = match self.tool_indices.get(&call_index) {
                        Some(index) => *index,
                        None => {
                            let index = self.next_index;
                            self.next_index += 1;
                            self.tool_indices.insert(call_index, index);
                            events.push(StreamEvent::ContentBlockStart {
                                index,
                                block: BlockStart::ToolUse {
                                    id: call
                                        .id
                                        .unwrap_or_else(|| format!("call_{}", call_index)),
                                    name: function.name.clone().unwrap_or_default(),
                                },
                            });
                            index
                        }
                    };
                    if let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) {
                        events.push(StreamEvent::ContentBlockDelta {
                            index,
                            delta: ContentDelta::InputJsonDelta(arguments),
                        });
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        // Some compatible servers close the connection without [DONE]
        self.closing_events()
    }
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
    x_groq: Option<GroqExtension>,
    error: Option<OpenAiError>,
}

#[derive(Debug, serde::Deserialize)]
struct GroqExtension {
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StreamAccumulator;
    use crate::types::{SystemPrompt, ToolDefinition, ToolResultBlock};
    use bytes::Bytes;
    use futures::StreamExt;
    use serde_json::json;

    fn backend(config: OpenAiConfig) -> OpenAiBackend {
        OpenAiBackend::new(config).unwrap()
    }

    #[test]
    fn test_provider_configs() {
        let openai = OpenAiConfig::openai("test-key");
        assert_eq!(openai.api_key, Some("test-key".to_string()));
        assert_eq!(openai.base_url, DEFAULT_OPENAI_BASE);
        assert!(!openai.single_system_message);

        let groq = OpenAiConfig::groq("k");
        assert!(groq.base_url.contains("groq.com"));
        assert!(groq.single_system_message);

        let ollama = OpenAiConfig::ollama();
        assert!(ollama.api_key.is_none());
        assert_eq!(ollama.timeout, Duration::from_secs(600));
        assert_eq!(ollama.name, "ollama");
    }

    #[test]
    fn test_completions_url() {
        assert_eq!(
            backend(OpenAiConfig::groq("key")).completions_url(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(
            backend(OpenAiConfig::ollama().with_base_url("http://box:11434/v1/")).completions_url(),
            "http://box:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_system_sections_split_or_merged() {
        let request = CompletionRequest::new("m", vec![Message::user("Hi")], 100)
            .with_system_prompt(Some(SystemPrompt::blocks(["persona", "summary"])));

        let split = backend(OpenAiConfig::openai("k")).to_openai_request(&request);
        assert_eq!(split.messages.len(), 3);
        assert_eq!(split.messages[0].role, "system");
        assert_eq!(split.messages[1].role, "system");

        let merged = backend(OpenAiConfig::groq("k")).to_openai_request(&request);
        assert_eq!(merged.messages.len(), 2);
        let body = serde_json::to_value(&merged).unwrap();
        assert_eq!(body["messages"][0]["content"], "persona\n\nsummary");
    }

    #[test]
    fn test_tool_round_trip_messages() {
        let request = CompletionRequest::new(
            "gpt-4o",
            vec![
                Message::user("time?"),
                Message::assistant_blocks(vec![ContentBlock::tool_use(
                    "call_1",
                    "get_current_time",
                    json!({}),
                )]),
                Message::tool_results(vec![ToolResultBlock::success("call_1", "12:00")]),
            ],
            100,
        )
        .with_tools(vec![ToolDefinition::new(
            "get_current_time",
            "Current time",
            json!({"type": "object"}),
        )])
        .with_tool_choice(ToolChoice::Auto);

        let body =
            serde_json::to_value(backend(OpenAiConfig::openai("k")).to_openai_request(&request))
                .unwrap();
        assert_eq!(body["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(body["messages"][2]["content"], "12:00");
        assert_eq!(body["tools"][0]["function"]["name"], "get_current_time");
        assert_eq!(body["tool_choice"], "auto");
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_images_become_content_parts() {
        let request = CompletionRequest::new(
            "gpt-4o",
            vec![Message::user_blocks(vec![
                ContentBlock::text("what is this?"),
                ContentBlock::image_base64("image/png", "AAAA"),
            ])],
            100,
        )
        .with_streaming();

        let body =
            serde_json::to_value(backend(OpenAiConfig::openai("k")).to_openai_request(&request))
                .unwrap();
        let parts = &body["messages"][0]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_response_conversion_with_tool_calls() {
        let body = r#"{
            "id": "chatcmpl-456",
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": "Let me check.",
                    "tool_calls": [{"id": "call_123", "type": "function",
                        "function": {"name": "web_search", "arguments": "{\"query\": \"rust\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 50, "completion_tokens": 30}
        }"#;

        let response = serde_json::from_str::<OpenAiChatResponse>(body)
            .unwrap()
            .into_response()
            .unwrap();
        assert_eq!(response.text(), "Let me check.");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage, Usage::new(50, 30));
        assert_eq!(response.tool_uses()[0].input, json!({"query": "rust"}));
    }

    #[test]
    fn test_response_with_bad_arguments_fails() {
        let body = r#"{"choices": [{"message": {"content": null, "tool_calls": [
            {"id": "c", "function": {"name": "web_search", "arguments": "{oops"}}]},
            "finish_reason": "tool_calls"}]}"#;
        let err = serde_json::from_str::<OpenAiChatResponse>(body)
            .unwrap()
            .into_response()
            .unwrap_err();
        assert!(matches!(err, LlmError::Serialization(_)));
    }

    async fn collect(sse: &str) -> CompletionResponse {
        let chunks: Vec<reqwest::Result<Bytes>> = sse
            .as_bytes()
            .chunks(29)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut stream = translate_sse(futures::stream::iter(chunks), OpenAiTranslator::default());
        let mut acc = StreamAccumulator::new();
        while let Some(event) = stream.next().await {
            acc.push(&event.unwrap()).unwrap();
        }
        acc.finish().unwrap()
    }

    #[tokio::test]
    async fn test_stream_keeps_first_chunk_content() {
        let sse = concat!(
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        let response = collect(sse).await;
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.usage, Usage::new(9, 2));
    }

    #[tokio::test]
    async fn test_stream_parallel_tool_calls() {
        let sse = concat!(
            "data: {\"id\":\"c2\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"web_search\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"id\":\"c2\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"query\\\":\"}}]}}]}\n\n",
            "data: {\"id\":\"c2\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"call_b\",\"function\":{\"name\":\"get_current_time\",\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: {\"id\":\"c2\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"rust\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let response = collect(sse).await;
        let uses = response.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].id, "call_a");
        assert_eq!(uses[0].input, json!({"query": "rust"}));
        assert_eq!(uses[1].name, "get_current_time");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[tokio::test]
    async fn test_stream_without_done_marker() {
        let sse = "data: {\"id\":\"c3\",\"model\":\"llama3\",\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}],\"x_groq\":{\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1}}}\n\n";
        let response = collect(sse).await;
        assert_eq!(response.text(), "ok");
        assert_eq!(response.usage, Usage::new(3, 1));
    }
}

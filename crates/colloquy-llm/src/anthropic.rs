//! Anthropic API backend implementation.
//!
//! This module provides the `AnthropicBackend` which connects to Anthropic's
//! Messages API. The crate's request types already follow the Messages wire
//! shape, so requests serialize directly; only responses and stream frames
//! need translating.

use async_trait::async_trait;
use reqwest::{Client, Response, header};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    BlockStart, ContentDelta, LlmBackend, ResponseStream, StreamEvent, with_retry,
};
use crate::error::{LlmError, Result};
use crate::sse::{SseFrame, SseTranslator, translate_sse};
use crate::types::{CompletionRequest, CompletionResponse, ContentBlock, StopReason, Usage};

/// Default API base URL.
const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

/// Default API version.
const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// API key for authentication.
    pub api_key: String,

    /// Base URL for the API.
    pub base_url: String,

    /// API version header.
    pub api_version: String,

    /// Request timeout.
    pub timeout: Duration,

    /// Maximum retries for transient errors.
    pub max_retries: u32,

    /// Initial backoff duration for retries.
    pub retry_backoff: Duration,
}

impl AnthropicConfig {
    /// Create a new config with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_API_BASE.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Create config from environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            LlmError::Config("ANTHROPIC_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
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
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic Backend
// ─────────────────────────────────────────────────────────────────────────────

/// Anthropic API backend.
pub struct AnthropicBackend {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicBackend {
    /// Create a new Anthropic backend with the given configuration.
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Create a backend from environment configuration.
    pub fn from_env() -> Result<Self> {
        Self::new(AnthropicConfig::from_env()?)
    }

    /// Build the messages endpoint URL.
    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    /// Add authentication and API headers to a request.
    fn add_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header(header::CONTENT_TYPE, "application/json")
    }

    async fn send(&self, request: &CompletionRequest) -> Result<Response> {
        let response = self
            .add_headers(self.client.post(self.messages_url()))
            .json(request)
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
        let message = match serde_json::from_str::<ApiError>(&body) {
            Ok(error) => error.error.message,
            Err(_) => body,
        };

        LlmError::from_status(status, &message, retry_after.as_deref())
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut request = request;
        request.stream = false;

        with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            "anthropic",
            || async {
                let response = self.send(&request).await?;
                let body = response.text().await?;
                let parsed: ApiResponse = serde_json::from_str(&body)?;
                Ok(parsed.into())
            },
        )
        .await
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let mut request = request;
        request.stream = true;

        // Only the connection is retried; a stream that fails midway is surfaced.
        let response = with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            "anthropic",
            || self.send(&request),
        )
        .await?;

        Ok(translate_sse(
            response.bytes_stream(),
            AnthropicTranslator::default(),
        ))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Create a shared Anthropic backend.
pub fn create_shared_backend(config: AnthropicConfig) -> Result<Arc<dyn LlmBackend>> {
    Ok(Arc::new(AnthropicBackend::new(config)?))
}

// ─────────────────────────────────────────────────────────────────────────────
// API Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct ApiResponse {
    id: String,
    content: Vec<ApiContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

impl From<ApiResponse> for CompletionResponse {
    fn from(api: ApiResponse) -> Self {
        let content = api
            .content
            .into_iter()
            .filter_map(|block| match block {
                ApiContentBlock::Text { text } => Some(ContentBlock::Text { text }),
                ApiContentBlock::ToolUse { id, name, input } => {
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                ApiContentBlock::Other => None,
            })
            .collect();

        let mut response = CompletionResponse::new(
            api.id,
            api.model,
            content,
            parse_stop_reason(api.stop_reason.as_deref()),
            api.usage.into(),
        );
        if api.stop_reason.is_none() {
            response.stop_reason = None;
        }
        response
    }
}

fn parse_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Thinking blocks, server tool results, and anything newer.
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    cache_creation_input_tokens: Option<u32>,
    cache_read_input_tokens: Option<u32>,
}

impl From<ApiUsage> for Usage {
    fn from(api: ApiUsage) -> Self {
        Usage {
            input_tokens: api.input_tokens,
            output_tokens: api.output_tokens,
            cache_creation_input_tokens: api.cache_creation_input_tokens.unwrap_or(0),
            cache_read_input_tokens: api.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, serde::Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE Translation
// ─────────────────────────────────────────────────────────────────────────────

/// Maps Anthropic's named SSE events onto [`StreamEvent`]s.
#[derive(Debug, Default)]
struct AnthropicTranslator;

impl SseTranslator for AnthropicTranslator {
    fn translate(&mut self, frame: SseFrame) -> Result<Vec<StreamEvent>> {
        let Some(event_type) = frame.event.as_deref() else {
            return Ok(Vec::new());
        };
        Ok(parse_stream_event(event_type, &frame.data)?
            .into_iter()
            .collect())
    }
}

fn parse_stream_event(event_type: &str, data: &str) -> Result<Option<StreamEvent>> {
    let event = match event_type {
        "message_start" => {
            let parsed: MessageStartEvent = serde_json::from_str(data)?;
            // message_delta reports the cumulative output count
            let mut usage: Usage = parsed.message.usage.into();
            usage.output_tokens = 0;
            StreamEvent::MessageStart {
                id: parsed.message.id,
                model: parsed.message.model,
                usage,
            }
        }
        "content_block_start" => {
            let parsed: ContentBlockStartEvent = serde_json::from_str(data)?;
            let block = match parsed.content_block {
                StartBlock::ToolUse { id, name } => BlockStart::ToolUse { id, name },
                StartBlock::Text | StartBlock::Other => BlockStart::Text,
            };
            StreamEvent::ContentBlockStart {
                index: parsed.index,
                block,
            }
        }
        "content_block_delta" => {
            let parsed: ContentBlockDeltaEvent = serde_json::from_str(data)?;
            let delta = match parsed.delta {
                DeltaContent::TextDelta { text } => ContentDelta::TextDelta(text),
                DeltaContent::InputJsonDelta { partial_json } => {
                    ContentDelta::InputJsonDelta(partial_json)
                }
                DeltaContent::Other => return Ok(None),
            };
            StreamEvent::ContentBlockDelta {
                index: parsed.index,
                delta,
            }
        }
        "content_block_stop" => {
            let parsed: ContentBlockStopEvent = serde_json::from_str(data)?;
            StreamEvent::ContentBlockStop {
                index: parsed.index,
            }
        }
        "message_delta" => {
            let parsed: MessageDeltaEvent = serde_json::from_str(data)?;
            StreamEvent::MessageDelta {
                stop_reason: parse_stop_reason(parsed.delta.stop_reason.as_deref()),
                usage: parsed.usage.into(),
            }
        }
        "message_stop" => StreamEvent::MessageStop,
        "ping" => StreamEvent::Ping,
        "error" => {
            let message = serde_json::from_str::<ApiError>(data)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| "Unknown streaming error".to_string());
            StreamEvent::Error { message }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

#[derive(Debug, serde::Deserialize)]
struct MessageStartEvent {
    message: MessageStartMessage,
}

#[derive(Debug, serde::Deserialize)]
struct MessageStartMessage {
    id: String,
    model: String,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, serde::Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: StartBlock,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text,
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, serde::Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: DeltaContent,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeltaContent {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, serde::Deserialize)]
struct ContentBlockStopEvent {
    index: usize,
}

#[derive(Debug, serde::Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, serde::Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StreamAccumulator;
    use bytes::Bytes;
    use futures::StreamExt;

    #[test]
    fn test_config_new() {
        let config = AnthropicConfig::new("test-key");
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_url, DEFAULT_API_BASE);
        assert_eq!(config.api_version, DEFAULT_API_VERSION);
    }

    #[test]
    fn test_config_builders() {
        let config = AnthropicConfig::new("key")
            .with_base_url("http://localhost:8080")
            .with_timeout(Duration::from_secs(60))
            .with_max_retries(1);
        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn test_api_response_conversion() {
        let body = r#"{
            "id": "msg_456",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-latest",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "tool_1", "name": "web_search", "input": {"query": "rust"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 50, "output_tokens": 30, "cache_read_input_tokens": 7}
        }"#;

        let response: CompletionResponse =
            serde_json::from_str::<ApiResponse>(body).unwrap().into();
        assert_eq!(response.text(), "Let me check.");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage.input_tokens, 50);
        assert_eq!(response.usage.cache_read_input_tokens, 7);
        assert_eq!(response.tool_uses()[0].name, "web_search");
    }

    #[test]
    fn test_unknown_blocks_are_skipped() {
        let body = r#"{
            "id": "m", "model": "claude", "stop_reason": "end_turn",
            "content": [{"type": "thinking", "thinking": "..."}, {"type": "text", "text": "ok"}],
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }"#;
        let response: CompletionResponse =
            serde_json::from_str::<ApiResponse>(body).unwrap().into();
        assert_eq!(response.content.len(), 1);
    }

    #[test]
    fn test_messages_url() {
        let backend =
            AnthropicBackend::new(AnthropicConfig::new("key").with_base_url("http://h:1/"))
                .unwrap();
        assert_eq!(backend.messages_url(), "http://h:1/v1/messages");
        assert_eq!(backend.name(), "anthropic");
    }

    #[tokio::test]
    async fn test_stream_translation() {
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude\",\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: ping\n",
            "data: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi \"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"get_current_time\",\"input\":{}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"tz\\\":\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"UTC\\\"}\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":15}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let chunks: Vec<reqwest::Result<Bytes>> = sse
            .as_bytes()
            .chunks(37)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let mut stream = translate_sse(futures::stream::iter(chunks), AnthropicTranslator);
        let mut acc = StreamAccumulator::new();
        while let Some(event) = stream.next().await {
            acc.push(&event.unwrap()).unwrap();
        }
        let response = acc.finish().unwrap();

        assert_eq!(response.text(), "Hi ");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage.input_tokens, 25);
        assert_eq!(response.usage.output_tokens, 15);
        let uses = response.tool_uses();
        assert_eq!(uses[0].id, "toolu_1");
        assert_eq!(uses[0].input, serde_json::json!({"tz": "UTC"}));
    }

    #[test]
    fn test_stream_error_event() {
        let event = parse_stream_event(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::Error {
                message: "Overloaded".into()
            }
        );
    }
}

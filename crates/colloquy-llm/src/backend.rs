//! LLM backend trait, streaming events, and the mock backend.
//!
//! Every provider adapter implements [`LlmBackend`]. Streaming adapters
//! translate their wire format into [`StreamEvent`]s so callers can fold any
//! provider's stream with the same [`StreamAccumulator`].

use async_trait::async_trait;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, ContentBlock, StopReason, Usage};

// ─────────────────────────────────────────────────────────────────────────────
// Shared Retry Logic
// ─────────────────────────────────────────────────────────────────────────────

/// Execute an async operation with exponential backoff retry.
///
/// Retries only transient errors (network, timeout, 5xx, rate limit).
/// A provider-supplied `retry_after` replaces the computed backoff.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    backend_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() || attempt >= max_retries => return Err(e),
            Err(e) => {
                let wait = e.retry_after().unwrap_or(backoff);
                attempt += 1;
                tracing::warn!(
                    backend = backend_name,
                    attempt,
                    max_retries,
                    backoff_ms = wait.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );
                tokio::time::sleep(wait).await;
                backoff *= 2;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Types
// ─────────────────────────────────────────────────────────────────────────────

/// A streaming response from an LLM backend.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + 'static>>;

/// Events emitted during streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Message started. `usage` carries prompt tokens when known up front.
    MessageStart {
        id: String,
        model: String,
        usage: Usage,
    },
    /// Content block started.
    ContentBlockStart { index: usize, block: BlockStart },
    /// Delta within a content block.
    ContentBlockDelta { index: usize, delta: ContentDelta },
    /// Content block finished.
    ContentBlockStop { index: usize },
    /// Message finished with final usage stats.
    MessageDelta {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Message complete.
    MessageStop,
    /// Keep-alive.
    Ping,
    /// Provider reported an error mid-stream.
    Error { message: String },
}

/// Kind of content block being opened.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    /// A text block.
    Text,
    /// A tool call; arguments arrive as [`ContentDelta::InputJsonDelta`].
    ToolUse { id: String, name: String },
}

/// Delta content in a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentDelta {
    /// Text being streamed.
    TextDelta(String),
    /// Partial JSON for tool input.
    InputJsonDelta(String),
}

impl StreamEvent {
    /// Returns true if this is an error event.
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error { .. })
    }

    /// Returns true if this is the final event in a message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::MessageStop | StreamEvent::Error { .. })
    }

    /// Text carried by this event, if it is a text delta.
    pub fn text_delta(&self) -> Option<&str> {
        match self {
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::TextDelta(text),
                ..
            } => Some(text),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Accumulator
// ─────────────────────────────────────────────────────────────────────────────

enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

/// Folds a sequence of [`StreamEvent`]s into a [`CompletionResponse`].
#[derive(Default)]
pub struct StreamAccumulator {
    id: String,
    model: String,
    blocks: Vec<(usize, PartialBlock)>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl StreamAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns an error for in-band stream errors.
    pub fn push(&mut self, event: &StreamEvent) -> Result<()> {
        match event {
            StreamEvent::MessageStart { id, model, usage } => {
                self.id = id.clone();
                self.model = model.clone();
                self.usage.add(usage);
            }
            StreamEvent::ContentBlockStart { index, block } => {
                let partial = match block {
                    BlockStart::Text => PartialBlock::Text(String::new()),
                    BlockStart::ToolUse { id, name } => PartialBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        json: String::new(),
                    },
                };
                self.blocks.push((*index, partial));
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                if !self.blocks.iter().any(|(i, _)| i == index) {
                    // Some providers skip the start event for text
                    self.blocks.push((*index, PartialBlock::Text(String::new())));
                }
                if let Some((_, block)) = self.blocks.iter_mut().rev().find(|(i, _)| i == index)
                {
                    match (block, delta) {
                        (PartialBlock::Text(buf), ContentDelta::TextDelta(t)) => buf.push_str(t),
                        (PartialBlock::ToolUse { json, .. }, ContentDelta::InputJsonDelta(j)) => {
                            json.push_str(j)
                        }
                        _ => {
                            tracing::warn!(index, "Delta type does not match its content block");
                        }
                    }
                }
            }
            StreamEvent::MessageDelta { stop_reason, usage } => {
                self.stop_reason = Some(*stop_reason);
                self.usage.add(usage);
            }
            StreamEvent::Error { message } => {
                return Err(LlmError::Backend(message.clone()));
            }
            StreamEvent::ContentBlockStop { .. } | StreamEvent::MessageStop | StreamEvent::Ping => {
            }
        }
        Ok(())
    }

    /// Finish accumulation and build the response.
    pub fn finish(self) -> Result<CompletionResponse> {
        let mut content = Vec::with_capacity(self.blocks.len());
        for (_, block) in self.blocks {
            match block {
                PartialBlock::Text(text) => {
                    if !text.is_empty() {
                        content.push(ContentBlock::text(text));
                    }
                }
                PartialBlock::ToolUse { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&json).map_err(|e| {
                            LlmError::Serialization(format!(
                                "invalid arguments for tool call '{}': {}",
                                name, e
                            ))
                        })?
                    };
                    content.push(ContentBlock::tool_use(id, name, input));
                }
            }
        }

        let has_tool_use = content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let stop_reason = match self.stop_reason {
            Some(reason) => reason,
            None if has_tool_use => StopReason::ToolUse,
            None => StopReason::EndTurn,
        };

        Ok(CompletionResponse::new(
            self.id,
            self.model,
            content,
            stop_reason,
            self.usage,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for LLM backend providers.
///
/// Implementations translate between [`CompletionRequest`]/[`CompletionResponse`]
/// and the provider's wire format, and report token usage in [`Usage`].
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Execute a completion request and return the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Execute a completion request and return a stream of events.
    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream>;

    /// Get the name of this backend.
    fn name(&self) -> &str;

    /// Check if the backend is available and properly configured.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// A backend that can be shared across tasks.
pub type SharedBackend = Arc<dyn LlmBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted reply for [`MockBackend`].
#[derive(Debug)]
pub enum MockResponse {
    /// Return this response.
    Success(CompletionResponse),
    /// Fail the call with this error.
    Failure(LlmError),
    /// Stream `partial` text, then fail mid-stream with `error`.
    Interrupted { partial: String, error: String },
}

impl From<CompletionResponse> for MockResponse {
    fn from(response: CompletionResponse) -> Self {
        MockResponse::Success(response)
    }
}

/// A mock backend for testing purposes.
///
/// Returns scripted replies in order. Streaming splits text into word-sized
/// deltas, optionally pausing between them so tests can interrupt mid-stream.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    responses: Mutex<VecDeque<MockResponse>>,
    request_log: Mutex<Vec<CompletionRequest>>,
    token_delay: Option<Duration>,
}

impl MockBackend {
    /// Create a new mock backend with the given responses.
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self::scripted(responses.into_iter().map(MockResponse::Success).collect())
    }

    /// Create a mock backend from scripted replies, including failures.
    pub fn scripted(responses: Vec<MockResponse>) -> Self {
        Self {
            name: "mock".to_string(),
            responses: Mutex::new(responses.into()),
            request_log: Mutex::new(Vec::new()),
            token_delay: None,
        }
    }

    /// Create a mock backend with a single text response.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![Self::text_response(text)])
    }

    /// Build a text-only response with fixed usage.
    pub fn text_response(text: impl Into<String>) -> CompletionResponse {
        CompletionResponse::new(
            "mock_msg",
            "mock-model",
            vec![ContentBlock::text(text)],
            StopReason::EndTurn,
            Usage::new(10, 20),
        )
    }

    /// Build a response that requests one tool call.
    pub fn tool_call_response(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> CompletionResponse {
        CompletionResponse::new(
            "mock_msg",
            "mock-model",
            vec![ContentBlock::tool_use(id, name, input)],
            StopReason::ToolUse,
            Usage::new(12, 8),
        )
    }

    /// Override the backend name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pause between streamed deltas.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Queue another reply.
    pub fn push(&self, response: impl Into<MockResponse>) {
        self.responses.lock().push_back(response.into());
    }

    /// Get all requests that were made to this backend.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.request_log.lock().clone()
    }

    /// Get the number of requests made.
    pub fn request_count(&self) -> usize {
        self.request_log.lock().len()
    }

    /// Number of replies still queued.
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }

    fn next(&self, request: CompletionRequest) -> Result<MockResponse> {
        self.request_log.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| LlmError::Backend("MockBackend: no more responses available".into()))
    }
}

fn stream_events(response: &CompletionResponse) -> Vec<Result<StreamEvent>> {
    let mut events = vec![Ok(StreamEvent::MessageStart {
        id: response.id.clone(),
        model: response.model.clone(),
        usage: Usage::new(response.usage.input_tokens, 0),
    })];

    for (index, block) in response.content.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => {
                events.push(Ok(StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::Text,
                }));
                for piece in text.split_inclusive(' ') {
                    events.push(Ok(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::TextDelta(piece.to_string()),
                    }));
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                events.push(Ok(StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                    },
                }));
                events.push(Ok(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta(input.to_string()),
                }));
            }
            _ => continue,
        }
        events.push(Ok(StreamEvent::ContentBlockStop { index }));
    }

    events.push(Ok(StreamEvent::MessageDelta {
        stop_reason: response.stop_reason.unwrap_or(StopReason::EndTurn),
        usage: Usage::new(0, response.usage.output_tokens),
    }));
    events.push(Ok(StreamEvent::MessageStop));
    events
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        match self.next(request)? {
            MockResponse::Success(response) => Ok(response),
            MockResponse::Failure(err) => Err(err),
            MockResponse::Interrupted { error, .. } => Err(LlmError::Network(error)),
        }
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let events = match self.next(request)? {
            MockResponse::Success(response) => stream_events(&response),
            MockResponse::Failure(err) => return Err(err),
            MockResponse::Interrupted { partial, error } => {
                let mut events = stream_events(&Self::text_response(partial));
                // Drop MessageDelta + MessageStop and fail instead
                events.truncate(events.len() - 2);
                events.push(Err(LlmError::Network(error)));
                events
            }
        };

        let stream = futures::stream::iter(events);
        match self.token_delay {
            None => Ok(Box::pin(stream)),
            Some(delay) => Ok(Box::pin(futures::StreamExt::then(stream, move |event| async move {
                tokio::time::sleep(delay).await;
                event
            }))),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn request() -> CompletionRequest {
        CompletionRequest::new("test-model", vec![Message::user("Hi")], 100)
    }

    #[tokio::test]
    async fn test_mock_backend_single_response() {
        let backend = MockBackend::with_text("Hello!");
        let response = backend.complete(request()).await.unwrap();

        assert_eq!(response.text(), "Hello!");
        assert_eq!(backend.request_count(), 1);
        assert!(backend.complete(request()).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_backend_scripted_failure() {
        let backend = MockBackend::scripted(vec![
            MockResponse::Failure(LlmError::Auth("bad key".into())),
            MockBackend::text_response("ok").into(),
        ]);

        assert!(matches!(
            backend.complete(request()).await,
            Err(LlmError::Auth(_))
        ));
        assert_eq!(backend.complete(request()).await.unwrap().text(), "ok");
    }

    #[tokio::test]
    async fn test_mock_stream_accumulates_to_same_response() {
        let backend = MockBackend::new(vec![CompletionResponse::new(
            "msg_1",
            "mock-model",
            vec![
                ContentBlock::text("Checking the time now"),
                ContentBlock::tool_use("call_1", "get_current_time", json!({"utc": true})),
            ],
            StopReason::ToolUse,
            Usage::new(30, 12),
        )]);

        let mut stream = backend.complete_stream(request()).await.unwrap();
        let mut acc = StreamAccumulator::new();
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            let event = event.unwrap();
            if let Some(t) = event.text_delta() {
                text.push_str(t);
            }
            acc.push(&event).unwrap();
        }

        assert_eq!(text, "Checking the time now");
        let response = acc.finish().unwrap();
        assert_eq!(response.text(), "Checking the time now");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        let uses = response.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].id, "call_1");
        assert_eq!(uses[0].input, json!({"utc": true}));
        assert_eq!(response.usage.input_tokens, 30);
        assert_eq!(response.usage.output_tokens, 12);
    }

    #[tokio::test]
    async fn test_mock_stream_interrupted() {
        let backend = MockBackend::scripted(vec![MockResponse::Interrupted {
            partial: "half an".into(),
            error: "connection reset".into(),
        }]);

        let events: Vec<_> = backend.complete_stream(request()).await.unwrap().collect().await;
        assert!(events.last().unwrap().is_err());
        let text: String = events
            .iter()
            .filter_map(|e| e.as_ref().ok())
            .filter_map(|e| e.text_delta())
            .collect();
        assert_eq!(text, "half an");
    }

    #[test]
    fn test_accumulator_rejects_bad_tool_json() {
        let mut acc = StreamAccumulator::new();
        acc.push(&StreamEvent::ContentBlockStart {
            index: 0,
            block: BlockStart::ToolUse {
                id: "c".into(),
                name: "web_search".into(),
            },
        })
        .unwrap();
        acc.push(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::InputJsonDelta("{\"query\": ".into()),
        })
        .unwrap();

        assert!(matches!(acc.finish(), Err(LlmError::Serialization(_))));
    }

    #[test]
    fn test_accumulator_error_event() {
        let mut acc = StreamAccumulator::new();
        let err = acc
            .push(&StreamEvent::Error {
                message: "overloaded".into(),
            })
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_millis(10), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::Server {
                        status: 503,
                        message: "busy".into(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(3, Duration::from_millis(10), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Auth("denied".into())) }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_exhausts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(2, Duration::from_millis(10), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Timeout("slow".into())) }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

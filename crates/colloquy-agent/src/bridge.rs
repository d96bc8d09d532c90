//! Streaming bridge between the orchestration graph and the client channel.
//!
//! The graph produces an ordered stream of [`GraphEvent`]s. The bridge turns
//! them into duplex-channel events (`llm_response_chunk`, `tool_start`,
//! `tool_end`, ...) and assembles the final text. A `force_stop` event from
//! the client cancels the turn at the next token boundary; the partial text
//! is kept and annotated so the turn can still be persisted.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use colloquy_llm::UsageRecord;

use crate::error::{AgentError, Result};
use crate::graph::GraphEvent;
use crate::types::{Checkpoint, Citation, ConversationId, ToolCall};

/// Event names on the duplex channel.
pub mod events {
    /// Incremental assistant text.
    pub const LLM_RESPONSE_CHUNK: &str = "llm_response_chunk";
    /// Turn finished; carries the assembled text.
    pub const LLM_RESPONSE_DONE: &str = "llm_response_done";
    /// A tool call started.
    pub const TOOL_START: &str = "tool_start";
    /// A tool call finished.
    pub const TOOL_END: &str = "tool_end";
    /// The turn failed.
    pub const CONVERSATION_ERROR: &str = "conversation_error";
    /// Acknowledges a client force-stop.
    pub const FORCE_STOP_ACK: &str = "force_stop_ack";
    /// User-visible progress notice.
    pub const PROGRESS: &str = "progress";
    /// Client to server: stop generating.
    pub const FORCE_STOP: &str = "force_stop";
}

/// Appended to the assembled text when the user stops generation.
pub const STOPPED_ANNOTATION: &str = "\n\n[Stopped by user]";

/// Message sent to the client when a turn fails.
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong while generating a response. Please try again.";

// ─────────────────────────────────────────────────────────────────────────────
// Duplex Channel
// ─────────────────────────────────────────────────────────────────────────────

/// Handler for events received from the client.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies a registered handler so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Client transport: events out, handlers for events in.
pub trait DuplexChannel: Send + Sync {
    /// Send an event to the client.
    fn emit(&self, event: &str, payload: Value);

    /// Register a handler for every occurrence of `event`.
    fn on(&self, event: &str, handler: EventHandler) -> HandlerId;

    /// Register a handler for the next occurrence of `event` only.
    fn once(&self, event: &str, handler: EventHandler) -> HandlerId;

    /// Remove a handler. Unknown ids are ignored.
    fn off(&self, event: &str, id: HandlerId);
}

struct Registration {
    id: HandlerId,
    handler: EventHandler,
    once: bool,
}

/// Reaction of a simulated client to an emitted event.
pub type Responder = Arc<dyn Fn(&str, &Value) -> Option<(String, Value)> + Send + Sync>;

/// In-process channel that records emitted events.
///
/// Used by tests and by embedders that poll events instead of pushing them
/// over a socket. [`InMemoryChannel::deliver`] plays the client side.
#[derive(Default)]
pub struct InMemoryChannel {
    emitted: Mutex<Vec<(String, Value)>>,
    handlers: Mutex<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
    responder: Mutex<Option<Responder>>,
}

impl InMemoryChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a simulated client that may answer emitted events.
    pub fn with_responder(self, responder: Responder) -> Self {
        *self.responder.lock() = Some(responder);
        self
    }

    /// Deliver a client event to registered handlers.
    pub fn deliver(&self, event: &str, payload: Value) {
        let handlers: Vec<EventHandler> = {
            let mut table = self.handlers.lock();
            let Some(registrations) = table.get_mut(event) else {
                return;
            };
            let handlers = registrations.iter().map(|r| Arc::clone(&r.handler)).collect();
            registrations.retain(|r| !r.once);
            handlers
        };
        for handler in handlers {
            handler(&payload);
        }
    }

    /// Every emitted event, in order.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().clone()
    }

    /// Names of emitted events, in order.
    pub fn event_names(&self) -> Vec<String> {
        self.emitted.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Payloads of emitted events with the given name.
    pub fn emitted_named(&self, event: &str) -> Vec<Value> {
        self.emitted
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, Vec::len)
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.emitted.lock().clear();
    }

    fn register(&self, event: &str, handler: EventHandler, once: bool) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, handler, once });
        id
    }
}

impl DuplexChannel for InMemoryChannel {
    fn emit(&self, event: &str, payload: Value) {
        self.emitted.lock().push((event.to_string(), payload.clone()));
        let responder = self.responder.lock().clone();
        if let Some(reply) = responder.and_then(|r| r(event, &payload)) {
            self.deliver(&reply.0, reply.1);
        }
    }

    fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.register(event, handler, false)
    }

    fn once(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.register(event, handler, true)
    }

    fn off(&self, event: &str, id: HandlerId) {
        if let Some(registrations) = self.handlers.lock().get_mut(event) {
            registrations.retain(|r| r.id != id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Bridge
// ─────────────────────────────────────────────────────────────────────────────

/// What the bridge assembled from one graph run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeOutcome {
    /// Streamed text, annotated when stopped.
    pub text: String,
    /// Whether the user stopped generation.
    pub stopped: bool,
    /// Citations reported by tools.
    pub citations: Vec<Citation>,
    /// Tool calls started during the run.
    pub tool_calls: Vec<ToolCall>,
    /// Agent iterations the graph completed.
    pub iterations: u32,
}

/// Forwards graph events to one conversation's client channel.
pub struct StreamingBridge {
    channel: Arc<dyn DuplexChannel>,
    conversation_id: ConversationId,
    cancellation: CancellationToken,
    stop_handler: Mutex<Option<HandlerId>>,
}

impl StreamingBridge {
    /// Create a bridge with a fresh cancellation token.
    pub fn new(channel: Arc<dyn DuplexChannel>, conversation_id: ConversationId) -> Self {
        Self {
            channel,
            conversation_id,
            cancellation: CancellationToken::new(),
            stop_handler: Mutex::new(None),
        }
    }

    /// Token cancelled when the client asks to stop.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Client channel.
    pub fn channel(&self) -> &Arc<dyn DuplexChannel> {
        &self.channel
    }

    /// Start listening for `force_stop` addressed to this conversation.
    ///
    /// Payloads without a `conversation_id` apply to whichever turn is
    /// listening on the channel.
    pub fn listen_for_stop(&self) {
        let token = self.cancellation.clone();
        let conversation_id = self.conversation_id.clone();
        let handler: EventHandler = Arc::new(move |payload: &Value| {
            let target = payload.get("conversation_id").and_then(Value::as_str);
            if target.is_none_or(|id| id == conversation_id.as_str()) {
                tracing::info!(conversation_id = %conversation_id, "Force stop requested");
                token.cancel();
            }
        });
        let id = self.channel.on(events::FORCE_STOP, handler);
        if let Some(previous) = self.stop_handler.lock().replace(id) {
            self.channel.off(events::FORCE_STOP, previous);
        }
    }

    /// Stop listening for `force_stop`.
    pub fn release(&self) {
        if let Some(id) = self.stop_handler.lock().take() {
            self.channel.off(events::FORCE_STOP, id);
        }
    }

    /// Forward graph events until the run completes or the user stops it.
    ///
    /// Errors from the stream are returned unchanged; the caller reports them
    /// through [`StreamingBridge::emit_error`].
    pub async fn forward<S>(&self, events: S) -> Result<BridgeOutcome>
    where
        S: Stream<Item = Result<GraphEvent>>,
    {
        let mut events = std::pin::pin!(events);
        let mut outcome = BridgeOutcome::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => None,
                event = events.next() => Some(event),
            };

            let event = match next {
                None => {
                    self.acknowledge_stop(&mut outcome);
                    return Ok(outcome);
                }
                Some(None) => {
                    return Err(AgentError::internal(
                        "orchestration stream ended before completion",
                    ));
                }
                Some(Some(event)) => event?,
            };

            match event {
                GraphEvent::Token(text) => {
                    if self.cancellation.is_cancelled() {
                        self.acknowledge_stop(&mut outcome);
                        return Ok(outcome);
                    }
                    tracing::trace!(len = text.len(), "Forwarding chunk");
                    self.channel.emit(
                        events::LLM_RESPONSE_CHUNK,
                        json!({
                            "conversation_id": self.conversation_id,
                            "chunk": text,
                        }),
                    );
                    outcome.text.push_str(&text);
                }
                GraphEvent::ToolStart(call) => {
                    self.channel.emit(
                        events::TOOL_START,
                        json!({
                            "conversation_id": self.conversation_id,
                            "tool_call_id": call.id,
                            "tool": call.name,
                            "input": call.arguments,
                        }),
                    );
                    outcome.tool_calls.push(call);
                }
                GraphEvent::ToolEnd(result) => {
                    self.channel.emit(
                        events::TOOL_END,
                        json!({
                            "conversation_id": self.conversation_id,
                            "tool_call_id": result.tool_call_id,
                            "tool": result.tool_name,
                            "success": result.success,
                            "content": result.content,
                            "citations": result.citations,
                        }),
                    );
                    outcome.citations.extend(result.citations);
                }
                GraphEvent::Done { text, iterations } => {
                    // Non-streaming backends deliver everything at the end
                    if outcome.text.is_empty() && !text.is_empty() {
                        self.channel.emit(
                            events::LLM_RESPONSE_CHUNK,
                            json!({
                                "conversation_id": self.conversation_id,
                                "chunk": text,
                            }),
                        );
                        outcome.text = text;
                    }
                    outcome.iterations = iterations;
                    return Ok(outcome);
                }
            }
        }
    }

    fn acknowledge_stop(&self, outcome: &mut BridgeOutcome) {
        outcome.stopped = true;
        outcome.text.push_str(STOPPED_ANNOTATION);
        self.channel.emit(
            events::FORCE_STOP_ACK,
            json!({ "conversation_id": self.conversation_id }),
        );
    }

    /// Send the terminal `llm_response_done` event.
    pub fn emit_done(&self, outcome: &BridgeOutcome, usage: &UsageRecord, checkpoint: &Checkpoint) {
        self.channel.emit(
            events::LLM_RESPONSE_DONE,
            json!({
                "conversation_id": self.conversation_id,
                "text": outcome.text,
                "stopped": outcome.stopped,
                "citations": outcome.citations,
                "usage": usage,
                "checkpoint": checkpoint,
            }),
        );
    }

    /// Send one generic `conversation_error` event.
    pub fn emit_error(&self, error: &AgentError) {
        tracing::error!(
            conversation_id = %self.conversation_id,
            error = %error,
            "Turn failed"
        );
        self.channel.emit(
            events::CONVERSATION_ERROR,
            json!({
                "conversation_id": self.conversation_id,
                "message": GENERIC_ERROR_MESSAGE,
            }),
        );
    }

    /// Send a `progress` notice.
    pub fn emit_progress(&self, message: &str) {
        self.channel.emit(
            events::PROGRESS,
            json!({
                "conversation_id": self.conversation_id,
                "message": message,
            }),
        );
    }
}

impl Drop for StreamingBridge {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolResultRecord;
    use futures::stream;

    fn bridge(channel: &Arc<InMemoryChannel>) -> StreamingBridge {
        StreamingBridge::new(channel.clone(), ConversationId::from("conv-1"))
    }

    fn tokens(parts: &[&str]) -> Vec<Result<GraphEvent>> {
        let mut events: Vec<Result<GraphEvent>> = parts
            .iter()
            .map(|p| Ok(GraphEvent::Token(p.to_string())))
            .collect();
        events.push(Ok(GraphEvent::Done {
            text: parts.concat(),
            iterations: 1,
        }));
        events
    }

    #[test]
    fn test_channel_on_once_off() {
        let channel = InMemoryChannel::new();
        let hits = Arc::new(AtomicU64::new(0));

        let h = hits.clone();
        let every = channel.on("ping", Arc::new(move |_: &Value| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        channel.once("ping", Arc::new(move |_: &Value| {
            h.fetch_add(10, Ordering::SeqCst);
        }));

        channel.deliver("ping", Value::Null);
        channel.deliver("ping", Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 12);

        channel.off("ping", every);
        channel.deliver("ping", Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 12);
        assert_eq!(channel.handler_count("ping"), 0);
    }

    #[tokio::test]
    async fn test_forward_emits_chunks_in_order() {
        let channel = Arc::new(InMemoryChannel::new());
        let outcome = bridge(&channel)
            .forward(stream::iter(tokens(&["Hel", "lo", "!"])))
            .await
            .unwrap();

        assert_eq!(outcome.text, "Hello!");
        assert!(!outcome.stopped);
        let chunks: Vec<String> = channel
            .emitted_named(events::LLM_RESPONSE_CHUNK)
            .iter()
            .map(|p| p["chunk"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(chunks, vec!["Hel", "lo", "!"]);
    }

    #[tokio::test]
    async fn test_forward_tool_events_and_citations() {
        let channel = Arc::new(InMemoryChannel::new());
        let events = vec![
            Ok(GraphEvent::ToolStart(ToolCall::new("c1", "web_search", json!({"query": "rust"})))),
            Ok(GraphEvent::ToolEnd(ToolResultRecord {
                tool_call_id: "c1".into(),
                tool_name: "web_search".into(),
                success: true,
                content: "results".into(),
                citations: vec![Citation::new("Rust", "https://www.rust-lang.org")],
            })),
            Ok(GraphEvent::Token("Rust is great.".into())),
            Ok(GraphEvent::Done {
                text: "Rust is great.".into(),
                iterations: 2,
            }),
        ];
        let outcome = bridge(&channel).forward(stream::iter(events)).await.unwrap();

        assert_eq!(
            channel.event_names(),
            vec![events::TOOL_START, events::TOOL_END, events::LLM_RESPONSE_CHUNK]
        );
        assert_eq!(outcome.citations.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "web_search");
        assert_eq!(outcome.iterations, 2);
        let end = &channel.emitted_named(events::TOOL_END)[0];
        assert_eq!(end["citations"][0]["url"], "https://www.rust-lang.org");
    }

    #[tokio::test]
    async fn test_force_stop_keeps_prefix() {
        let channel = Arc::new(
            InMemoryChannel::new().with_responder(Arc::new(|event: &str, _: &Value| {
                (event == events::LLM_RESPONSE_CHUNK)
                    .then(|| (events::FORCE_STOP.to_string(), json!({"conversation_id": "conv-1"})))
            })),
        );
        let bridge = bridge(&channel);
        bridge.listen_for_stop();

        let outcome = bridge
            .forward(stream::iter(tokens(&["one ", "two ", "three"])))
            .await
            .unwrap();

        assert!(outcome.stopped);
        assert_eq!(outcome.text, format!("one {}", STOPPED_ANNOTATION));
        assert_eq!(channel.emitted_named(events::FORCE_STOP_ACK).len(), 1);
        assert_eq!(channel.emitted_named(events::LLM_RESPONSE_CHUNK).len(), 1);
    }

    #[tokio::test]
    async fn test_force_stop_for_other_conversation_is_ignored() {
        let channel = Arc::new(InMemoryChannel::new());
        let bridge = bridge(&channel);
        bridge.listen_for_stop();
        channel.deliver(events::FORCE_STOP, json!({"conversation_id": "someone-else"}));
        assert!(!bridge.cancellation().is_cancelled());

        channel.deliver(events::FORCE_STOP, json!({}));
        assert!(bridge.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_release_removes_handler() {
        let channel = Arc::new(InMemoryChannel::new());
        {
            let bridge = bridge(&channel);
            bridge.listen_for_stop();
            assert_eq!(channel.handler_count(events::FORCE_STOP), 1);
        }
        assert_eq!(channel.handler_count(events::FORCE_STOP), 0);
    }

    #[tokio::test]
    async fn test_stream_error_is_returned() {
        let channel = Arc::new(InMemoryChannel::new());
        let events = vec![
            Ok(GraphEvent::Token("partial".into())),
            Err(AgentError::internal("boom")),
        ];
        let bridge = bridge(&channel);
        let err = bridge.forward(stream::iter(events)).await.unwrap_err();
        bridge.emit_error(&err);

        let errors = channel.emitted_named(events::CONVERSATION_ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["message"], GENERIC_ERROR_MESSAGE);
        assert!(channel.emitted_named(events::LLM_RESPONSE_DONE).is_empty());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let channel = Arc::new(InMemoryChannel::new());
        let events = vec![Ok(GraphEvent::Token("partial".into()))];
        assert!(bridge(&channel).forward(stream::iter(events)).await.is_err());
    }
}

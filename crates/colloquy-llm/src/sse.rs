//! Server-sent-events framing shared by the HTTP adapters.
//!
//! [`SseDecoder`] turns raw bytes into `event:`/`data:` frames; an
//! [`SseTranslator`] turns frames into provider-neutral [`StreamEvent`]s.
//! [`translate_sse`] glues both onto a reqwest byte stream.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::backend::{ResponseStream, StreamEvent};
use crate::error::{LlmError, Result};

/// One dispatched SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the last `event:` line, if any.
    pub event: Option<String>,
    /// Concatenated `data:` lines.
    pub data: String,
}

/// Incremental SSE line decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=line_end).collect();
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }

            if let Some((field, value)) = parse_sse_line(line) {
                match field {
                    "event" => self.event = Some(value.to_string()),
                    "data" => self.data.push(value.to_string()),
                    _ => {}
                }
            }
        }
        frames
    }

    /// Flush a trailing frame not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.trim().is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            if let Some(("data", value)) = parse_sse_line(rest.trim_end()) {
                self.data.push(value.to_string());
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

/// Split an SSE line into field and value. Comment lines yield `None`.
pub fn parse_sse_line(line: &str) -> Option<(&str, &str)> {
    if line.starts_with(':') {
        return None;
    }
    let (field, value) = line.split_once(':')?;
    Some((field, value.strip_prefix(' ').unwrap_or(value)))
}

/// Provider-specific mapping from SSE frames to stream events.
pub trait SseTranslator: Send + 'static {
    /// Translate one frame into zero or more events.
    fn translate(&mut self, frame: SseFrame) -> Result<Vec<StreamEvent>>;

    /// Called once when the byte stream ends; may emit closing events.
    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

struct SseState<T> {
    bytes: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    decoder: SseDecoder,
    translator: T,
    pending: VecDeque<Result<StreamEvent>>,
    done: bool,
}

/// Translate a byte stream into a [`ResponseStream`].
///
/// The stream ends after the first terminal event or transport error.
pub fn translate_sse<T: SseTranslator>(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    translator: T,
) -> ResponseStream {
    let state = SseState {
        bytes: Box::pin(byte_stream),
        decoder: SseDecoder::new(),
        translator,
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if matches!(&item, Ok(event) if event.is_terminal()) || item.is_err() {
                    state.pending.clear();
                    state.done = true;
                }
                return Some((item, state));
            }

            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.decoder.push(&chunk) {
                        match state.translator.translate(frame) {
                            Ok(events) => state.pending.extend(events.into_iter().map(Ok)),
                            Err(e) => state.pending.push_back(Err(e)),
                        }
                    }
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(LlmError::from(e)));
                }
                None => {
                    if let Some(frame) = state.decoder.finish() {
                        match state.translator.translate(frame) {
                            Ok(events) => state.pending.extend(events.into_iter().map(Ok)),
                            Err(e) => state.pending.push_back(Err(e)),
                        }
                    }
                    state
                        .pending
                        .extend(state.translator.finish().into_iter().map(Ok));
                    if state.pending.is_empty() {
                        return None;
                    }
                    state.done = true;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line("event: message_start"),
            Some(("event", "message_start"))
        );
        assert_eq!(parse_sse_line("data: {\"a\":1}"), Some(("data", "{\"a\":1}")));
        assert_eq!(parse_sse_line("data:[DONE]"), Some(("data", "[DONE]")));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("garbage"), None);
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: ping\nda").is_empty());
        let frames = decoder.push(b"ta: {}\n\ndata: one\r\n\r\n");

        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: Some("ping".into()),
                    data: "{}".into()
                },
                SseFrame {
                    event: None,
                    data: "one".into()
                },
            ]
        );
    }

    #[test]
    fn test_decoder_multiline_data_and_finish() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: a\ndata: b\n").is_empty());
        assert_eq!(
            decoder.finish(),
            Some(SseFrame {
                event: None,
                data: "a\nb".into()
            })
        );
        assert_eq!(decoder.finish(), None);
    }

    struct Echo;

    impl SseTranslator for Echo {
        fn translate(&mut self, frame: SseFrame) -> Result<Vec<StreamEvent>> {
            if frame.data == "stop" {
                Ok(vec![StreamEvent::MessageStop])
            } else {
                Ok(vec![StreamEvent::Ping])
            }
        }
    }

    #[tokio::test]
    async fn test_translate_sse_stops_at_terminal() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: a\n\ndata: stop\n\n")),
            Ok(Bytes::from_static(b"data: after\n\n")),
        ];
        let events: Vec<_> = translate_sse(futures::stream::iter(chunks), Echo)
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap(), &StreamEvent::Ping);
        assert_eq!(events[1].as_ref().unwrap(), &StreamEvent::MessageStop);
    }
}

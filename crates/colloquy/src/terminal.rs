//! Duplex channel that renders conversation events on the terminal.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use console::Style;
use serde_json::{Value, json};

use colloquy_agent::{DuplexChannel, EventHandler, HandlerId, InMemoryChannel, events};

/// Prints streamed text to stdout and status lines to stderr.
///
/// In JSON mode every event is written as one JSON line instead.
pub struct TerminalChannel {
    handlers: InMemoryChannel,
    json: bool,
    mid_line: AtomicBool,
}

impl TerminalChannel {
    pub fn new(json: bool) -> Self {
        Self {
            handlers: InMemoryChannel::new(),
            json,
            mid_line: AtomicBool::new(false),
        }
    }

    /// Ask the running turn to stop generating.
    pub fn force_stop(&self, conversation_id: &str) {
        self.handlers
            .deliver(events::FORCE_STOP, json!({ "conversation_id": conversation_id }));
    }

    fn end_line(&self) {
        if self.mid_line.swap(false, Ordering::Relaxed) {
            println!();
        }
    }

    fn render(&self, event: &str, payload: &Value) {
        let dim = Style::new().dim();
        match event {
            events::LLM_RESPONSE_CHUNK => {
                if let Some(chunk) = payload["chunk"].as_str() {
                    print!("{}", chunk);
                    let _ = std::io::stdout().flush();
                    self.mid_line.store(!chunk.ends_with('\n'), Ordering::Relaxed);
                }
            }
            events::TOOL_START => {
                self.end_line();
                let tool = payload["tool"].as_str().unwrap_or("tool");
                eprintln!("{}", dim.apply_to(format!("[Running: {}]", tool)));
            }
            events::TOOL_END => {
                let status = if payload["success"].as_bool().unwrap_or(false) {
                    "done"
                } else {
                    "failed"
                };
                eprintln!("{}", dim.apply_to(format!("[{}]", status)));
            }
            events::PROGRESS => {
                self.end_line();
                if let Some(message) = payload["message"].as_str() {
                    eprintln!("{}", dim.apply_to(message));
                }
            }
            events::FORCE_STOP_ACK => {
                self.end_line();
                eprintln!("{}", dim.apply_to("[Stopping...]"));
            }
            events::LLM_RESPONSE_DONE => {
                self.end_line();
                if payload["stopped"].as_bool().unwrap_or(false) {
                    eprintln!("{}", dim.apply_to("[Stopped by user]"));
                }
            }
            events::CONVERSATION_ERROR => {
                self.end_line();
                let message = payload["message"].as_str().unwrap_or("unknown error");
                eprintln!("{} {}", Style::new().red().apply_to("Error:"), message);
            }
            other => {
                tracing::trace!(event = other, "Unrendered event");
            }
        }
    }
}

impl DuplexChannel for TerminalChannel {
    fn emit(&self, event: &str, payload: Value) {
        if self.json {
            println!("{}", json!({ "event": event, "payload": payload }));
        } else {
            self.render(event, &payload);
        }
    }

    fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.handlers.on(event, handler)
    }

    fn once(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.handlers.once(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) {
        self.handlers.off(event, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_force_stop_reaches_handlers() {
        let channel = TerminalChannel::new(true);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        channel.once(
            events::FORCE_STOP,
            Arc::new(move |payload| {
                assert_eq!(payload["conversation_id"], "conv-1");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        channel.force_stop("conv-1");
        channel.force_stop("conv-1");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_handler_not_called() {
        let channel = TerminalChannel::new(false);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = channel.on(
            events::FORCE_STOP,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        channel.off(events::FORCE_STOP, id);

        channel.force_stop("conv-1");
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}

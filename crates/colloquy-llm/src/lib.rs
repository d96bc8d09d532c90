//! Model provider layer for Colloquy.
//!
//! This crate provides a unified interface over the supported providers
//! (Anthropic, OpenAI, Groq, Ollama) with streaming, tool calling and
//! per-turn usage accounting.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  ProviderFactory::create_model()         │
//! │  provider id / model name → Provider     │
//! │  credentials check, toolless cache       │
//! └──────────────────────────────────────────┘
//!                    │ InvocableModel
//!                    ▼
//! ┌──────────────────────────────────────────┐
//! │  LlmBackend trait                        │
//! │  - complete() -> Response                │
//! │  - complete_stream() -> Stream<Event>    │
//! └──────────────────────────────────────────┘
//!          │                     │
//!          ▼                     ▼
//!   ┌───────────┐     ┌─────────────────────┐
//!   │ Anthropic │     │ OpenAI-compatible   │
//!   │           │     │ (OpenAI/Groq/Ollama)│
//!   └───────────┘     └─────────────────────┘
//! ```
//!
//! Every completion reports [`Usage`], normalized to [`TokenUsage`] and
//! priced by the [`PriceTable`] inside a [`UsageAccumulator`].

pub mod backend;
pub mod cost;
pub mod error;
pub mod factory;
pub mod provider;
pub mod sse;
pub mod types;
pub mod usage;

// Provider implementations
pub mod anthropic;
pub mod openai;

pub use backend::{
    BlockStart, ContentDelta, LlmBackend, MockBackend, MockResponse, ResponseStream,
    SharedBackend, StreamAccumulator, StreamEvent, with_retry,
};
pub use cost::{ModelPrice, PriceTable, calculate_cost};
pub use error::{LlmError, RateLimitInfo, Result};
pub use factory::{
    BackendBuilder, Credentials, FixedBackendBuilder, HttpBackendBuilder, InvocableModel,
    ModelOptions, ProviderFactory,
};
pub use provider::Provider;
pub use types::{
    CompletionRequest, CompletionResponse, Content, ContentBlock, ImageSource, Message, Role,
    StopReason, SystemPrompt, ToolChoice, ToolDefinition, ToolResultBlock, ToolResultContent,
    ToolUseBlock, Usage,
};
pub use usage::{TokenUsage, UsageAccumulator, UsageRecord};

// Re-export provider configs
pub use anthropic::{AnthropicBackend, AnthropicConfig};
pub use openai::{OpenAiBackend, OpenAiConfig};

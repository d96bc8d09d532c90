//! Conversation orchestration for Colloquy.
//!
//! This crate turns one user message into a streamed, persisted assistant
//! reply: it picks the tools worth binding, runs the agent/tools loop,
//! forwards tokens to the client, and keeps each conversation's rolling
//! memory under budget.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ConversationEngine                                         │
//! │  - One turn at a time per conversation                      │
//! │  - Usage and cost backfilled onto the persisted turn        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌──────────────┬──────┴───────┬──────────────┐
//!        ▼              ▼              ▼              ▼
//!  ┌──────────┐  ┌────────────┐  ┌──────────┐  ┌─────────────┐
//!  │ Selector │  │   Graph    │  │  Memory  │  │   Bridge    │
//!  │ (tools)  │  │(agent loop)│  │(epochs)  │  │(force stop) │
//!  └──────────┘  └────────────┘  └──────────┘  └─────────────┘
//! ```
//!
//! # Core Components
//!
//! - [`ConversationEngine`]: drives a full turn
//! - [`OrchestrationGraph`]: agent node and tools node until a final answer
//! - [`MemoryManager`]: checkpoints and the rolling summary
//! - [`StreamingBridge`]: graph events to client events, with force-stop
//! - [`select_tools`]: bounded, domain-aware tool selection

pub mod bridge;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod mcp;
pub mod memory;
pub mod rag;
pub mod selector;
pub mod store;
pub mod tool;
pub mod tools;
pub mod types;

// Re-export core types
pub use error::{AgentError, Result};
pub use types::{
    Checkpoint, Citation, ConversationId, Exchange, ToolCall, ToolEligibility, ToolResultRecord,
    TurnId, TurnRecord, UserQuery,
};

// Re-export tool types
pub use tool::{
    DEFAULT_MAX_OUTPUT_SIZE, ParamExt, ParamResult, ParameterValidationError, Tool, ToolContext,
    ToolOutput, ToolRegistry, ToolResult, ToolSource,
};
pub use executor::{RetryPolicy, ToolExecutor};

// Re-export engine
pub use engine::{ConversationEngine, EngineBuilder, EngineSettings, ProviderConfig, TurnOutcome};

// Re-export orchestration types
pub use graph::{DEFAULT_MAX_ITERATIONS, GraphEvent, GraphRun, GraphStream, OrchestrationGraph};
pub use selector::{Confidence, Selection, SelectionPath, classify_tool_eligibility, select_tools};

// Re-export streaming types
pub use bridge::{
    BridgeOutcome, DuplexChannel, EventHandler, HandlerId, InMemoryChannel, StreamingBridge, events,
};

// Re-export memory types
pub use context::Persona;
pub use memory::{ConversationContext, MemoryManager, MemorySettings, MemoryState};
pub use store::{ConversationStore, InMemoryStore};

// Re-export retrieval types
pub use rag::{DocumentIndex, KeywordIndex, RankedChunk, Retriever};

// Re-export remote tool adapter
pub use mcp::{McpToolAdapter, RemoteToolLoader};

// Re-export built-in tools
pub use tools::{
    ChildModelSpec, CurrentTimeTool, DelegateTool, ImageGenConfig, ImageGenTool, SearchProvider,
    SearchResult, SubAgent, WebSearchConfig, WebSearchTool, builtin_registry,
};

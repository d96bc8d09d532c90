//! MCP (Model Context Protocol) client for Colloquy.
//!
//! Remote MCP servers act as tool catalogs: the agent lists their tools,
//! exposes a relevant subset to the model, and forwards calls back.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  RemoteToolCatalog (trait)                                  │
//! │  - server_name, list_tools, call_tool                       │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  McpClient                                                  │
//! │  - JSON-RPC 2.0 over HTTP POST                              │
//! │  - JSON or text/event-stream responses                      │
//! │  - lazy initialize handshake, session header                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use colloquy_mcp::{McpClient, McpServerConfig, RemoteToolCatalog};
//!
//! let config = McpServerConfig::new("slack", "https://mcp.example.com/slack")
//!     .with_header("Authorization", "Bearer xoxb-...");
//! let client = McpClient::new(config)?;
//!
//! for tool in client.list_tools().await? {
//!     println!("{} - {:?}", tool.name, tool.description);
//! }
//!
//! let result = client
//!     .call_tool("send_slack_message", Some(json!({"channel": "#general", "text": "hi"})))
//!     .await?;
//! println!("{}", result.text());
//! ```
//!
//! Retry and timeout policy is not applied here. Callers classify failures
//! with [`McpError::is_retryable`] and [`McpError::is_auth`].

pub mod catalog;
pub mod client;
pub mod error;
pub mod protocol;

pub use catalog::RemoteToolCatalog;
pub use client::{McpClient, McpServerConfig};
pub use error::{McpError, Result};
pub use protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult, ServerCapabilities,
    ToolContent, ToolInfo,
};

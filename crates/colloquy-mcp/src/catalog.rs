//! The remote tool catalog seam.
//!
//! The agent layer only sees [`RemoteToolCatalog`]; [`McpClient`] is the
//! production implementation and tests script their own.

use async_trait::async_trait;
use serde_json::Value;

use crate::client::McpClient;
use crate::error::Result;
use crate::protocol::{CallToolResult, ToolInfo};

/// A remote registry of tools reachable over RPC.
#[async_trait]
pub trait RemoteToolCatalog: Send + Sync {
    /// Name identifying this catalog (the configured server name).
    fn server_name(&self) -> &str;

    /// List the tools this catalog exposes.
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;

    /// Invoke a tool by name.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult>;
}

#[async_trait]
impl RemoteToolCatalog for McpClient {
    fn server_name(&self) -> &str {
        self.name()
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let arguments = match arguments {
            Value::Null => None,
            other => Some(other),
        };
        McpClient::call_tool(self, name, arguments).await
    }
}

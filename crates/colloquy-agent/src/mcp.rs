//! Remote tool integration.
//!
//! [`McpToolAdapter`] wraps one tool of a [`RemoteToolCatalog`] as a [`Tool`],
//! and [`RemoteToolLoader`] lists every configured catalog (with a TTL cache)
//! so the engine can merge remote tools into the per-turn catalog.
//!
//! # Example
//!
//! ```rust,ignore
//! use colloquy_agent::{ToolRegistry, mcp::RemoteToolLoader};
//! use colloquy_mcp::{McpClient, McpServerConfig};
//! use std::sync::Arc;
//!
//! let client = McpClient::new(McpServerConfig::new("slack", "https://mcp.example.com/slack"))?;
//! let loader = RemoteToolLoader::new(CacheConfig::default()).with_catalog(Arc::new(client));
//!
//! let mut registry = ToolRegistry::new();
//! loader.register_into(&mut registry).await;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use colloquy_cache::{CacheConfig, TtlCache};
use colloquy_mcp::{RemoteToolCatalog, ToolInfo};

use crate::error::Result;
use crate::tool::{Tool, ToolContext, ToolRegistry, ToolResult, ToolSource};

/// Adapter that exposes a remote catalog tool as a [`Tool`].
///
/// Transport failures surface as [`AgentError::Mcp`](crate::AgentError::Mcp)
/// so the executor can classify and retry them. Tool-level failures reported
/// by the server become error results.
pub struct McpToolAdapter {
    catalog: Arc<dyn RemoteToolCatalog>,
    name: String,
    description: String,
    parameters: Value,
}

impl McpToolAdapter {
    /// Create an adapter for one listed tool.
    pub fn new(catalog: Arc<dyn RemoteToolCatalog>, info: &ToolInfo) -> Self {
        let description = info
            .description
            .clone()
            .unwrap_or_else(|| format!("{} tool: {}", catalog.server_name(), info.name));
        Self {
            name: info.name.clone(),
            description,
            parameters: info.schema(),
            catalog,
        }
    }

    /// Name of the catalog this tool belongs to.
    pub fn server_name(&self) -> &str {
        self.catalog.server_name()
    }
}

impl std::fmt::Debug for McpToolAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToolAdapter")
            .field("server", &self.server_name())
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    fn source(&self) -> ToolSource {
        ToolSource::Remote {
            server: self.server_name().to_string(),
        }
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        tracing::debug!(server = %self.server_name(), tool = %self.name, "Calling remote tool");

        let result = self.catalog.call_tool(&self.name, params).await?;
        let text = result.text();

        if result.is_error() {
            let message = if text.is_empty() {
                "Unknown remote tool error".to_string()
            } else {
                text
            };
            return Ok(ToolResult::error(message));
        }
        Ok(ToolResult::text(text))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Lists remote catalogs and turns their tools into adapters.
pub struct RemoteToolLoader {
    catalogs: Vec<Arc<dyn RemoteToolCatalog>>,
    listings: TtlCache<Vec<ToolInfo>>,
}

impl RemoteToolLoader {
    /// Create a loader whose listings are cached per server.
    pub fn new(cache: CacheConfig) -> Self {
        Self {
            catalogs: Vec::new(),
            listings: TtlCache::named("remote_tools", cache),
        }
    }

    /// Add a catalog.
    pub fn with_catalog(mut self, catalog: Arc<dyn RemoteToolCatalog>) -> Self {
        self.catalogs.push(catalog);
        self
    }

    /// Number of configured catalogs.
    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    /// Whether no catalogs are configured.
    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }

    /// Adapters for every tool of every reachable catalog.
    ///
    /// A catalog that fails to list is logged and skipped.
    pub async fn load_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for catalog in &self.catalogs {
            let server = catalog.server_name().to_string();
            let listing = self
                .listings
                .get_or_try_insert_with(&server, || async { catalog.list_tools().await })
                .await;

            match listing {
                Ok(infos) => {
                    tracing::debug!(server = %server, tools = infos.len(), "Loaded remote tools");
                    tools.extend(infos.iter().map(|info| {
                        Arc::new(McpToolAdapter::new(Arc::clone(catalog), info)) as Arc<dyn Tool>
                    }));
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "Failed to list remote tools, skipping");
                }
            }
        }
        tools
    }

    /// Add remote tools to a registry. Names already present are kept.
    ///
    /// Returns the number of tools added.
    pub async fn register_into(&self, registry: &mut ToolRegistry) -> usize {
        let mut added = 0;
        for tool in self.load_tools().await {
            let name = tool.name().to_string();
            if registry.register_if_absent(tool) {
                added += 1;
            } else {
                tracing::warn!(tool = %name, "Remote tool shadowed by an existing tool");
            }
        }
        added
    }

    /// Drop a server's cached listing so the next load refetches it.
    pub async fn invalidate(&self, server: &str) {
        self.listings.invalidate(server).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use colloquy_mcp::{CallToolResult, McpError, ToolContent};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedCatalog {
        name: &'static str,
        tools: Vec<&'static str>,
        fail_listing: bool,
        listings: AtomicUsize,
    }

    impl ScriptedCatalog {
        fn new(name: &'static str, tools: Vec<&'static str>) -> Self {
            Self {
                name,
                tools,
                fail_listing: false,
                listings: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteToolCatalog for ScriptedCatalog {
        fn server_name(&self) -> &str {
            self.name
        }

        async fn list_tools(&self) -> colloquy_mcp::Result<Vec<ToolInfo>> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            if self.fail_listing {
                return Err(McpError::transport("connection refused"));
            }
            Ok(self
                .tools
                .iter()
                .map(|name| ToolInfo {
                    name: name.to_string(),
                    description: Some(format!("{} via {}", name, self.name)),
                    input_schema: None,
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> colloquy_mcp::Result<CallToolResult> {
            match name {
                "broken" => Err(McpError::Unauthorized("token expired".into())),
                "refuses" => Ok(CallToolResult {
                    content: vec![ToolContent::Text { text: "channel not found".into() }],
                    structured_content: None,
                    is_error: Some(true),
                }),
                _ => Ok(CallToolResult {
                    content: vec![ToolContent::Text { text: format!("{} ok: {}", name, arguments) }],
                    structured_content: None,
                    is_error: None,
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_adapter_success_and_source() {
        let catalog: Arc<dyn RemoteToolCatalog> = Arc::new(ScriptedCatalog::new("slack", vec![]));
        let info = ToolInfo {
            name: "send_slack_message".into(),
            description: None,
            input_schema: Some(json!({"type": "object", "properties": {"text": {"type": "string"}}})),
        };
        let adapter = McpToolAdapter::new(catalog, &info);

        assert_eq!(adapter.description(), "slack tool: send_slack_message");
        assert_eq!(adapter.source(), ToolSource::Remote { server: "slack".into() });
        assert_eq!(adapter.parameters()["properties"]["text"]["type"], "string");

        let result = adapter
            .execute(json!({"text": "hi"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(result.to_llm_content().starts_with("send_slack_message ok"));
    }

    #[tokio::test]
    async fn test_adapter_error_mapping() {
        let catalog: Arc<dyn RemoteToolCatalog> = Arc::new(ScriptedCatalog::new("slack", vec![]));
        let info = |name: &str| ToolInfo {
            name: name.into(),
            description: None,
            input_schema: None,
        };

        let refused = McpToolAdapter::new(Arc::clone(&catalog), &info("refuses"))
            .execute(json!({}), &ToolContext::default())
            .await
            .unwrap();
        assert!(refused.is_error());
        assert_eq!(refused.to_llm_content(), "Error: channel not found");

        let err = McpToolAdapter::new(catalog, &info("broken"))
            .execute(json!({}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Mcp(_)));
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_loader_caches_and_skips_failures() {
        let slack = Arc::new(ScriptedCatalog::new("slack", vec!["send_slack_message", "list_slack_channels"]));
        let mut down = ScriptedCatalog::new("github", vec!["create_github_issue"]);
        down.fail_listing = true;
        let down = Arc::new(down);

        let loader = RemoteToolLoader::new(CacheConfig::default())
            .with_catalog(slack.clone())
            .with_catalog(down.clone());

        let tools = loader.load_tools().await;
        assert_eq!(tools.len(), 2);
        let tools = loader.load_tools().await;
        assert_eq!(tools.len(), 2);

        assert_eq!(slack.listings.load(Ordering::SeqCst), 1);
        assert_eq!(down.listings.load(Ordering::SeqCst), 2);

        loader.invalidate("slack").await;
        loader.load_tools().await;
        assert_eq!(slack.listings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_register_into_keeps_existing_names() {
        let loader = RemoteToolLoader::new(CacheConfig::default())
            .with_catalog(Arc::new(ScriptedCatalog::new("search", vec!["web_search", "deep_search"])));

        let mut registry = ToolRegistry::new();
        registry.register(crate::tool::MockTool::new("web_search"));

        let added = loader.register_into(&mut registry).await;
        assert_eq!(added, 1);
        assert_eq!(registry.names(), vec!["web_search", "deep_search"]);
        assert_eq!(registry.get("web_search").unwrap().source(), ToolSource::Builtin);
    }
}

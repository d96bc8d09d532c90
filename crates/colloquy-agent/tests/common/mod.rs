//! Common test utilities for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use colloquy_agent::{
    ConversationEngine, ConversationId, EngineBuilder, InMemoryChannel, InMemoryStore,
    MemoryManager, MemorySettings, ProviderConfig, RemoteToolLoader, RetryPolicy, ToolExecutor,
    TurnOutcome, UserQuery,
};
use colloquy_cache::CacheConfig;
use colloquy_llm::{Credentials, FixedBackendBuilder, MockBackend, ProviderFactory};
use colloquy_mcp::{CallToolResult, McpError, RemoteToolCatalog, ToolContent, ToolInfo};

/// An engine wired to a mock model and an in-memory store.
pub struct TestEngine {
    pub engine: ConversationEngine,
    pub backend: Arc<MockBackend>,
    pub store: Arc<InMemoryStore>,
    pub channel: Arc<InMemoryChannel>,
}

impl TestEngine {
    /// Engine with default settings.
    pub fn start(backend: MockBackend) -> Self {
        Self::start_with(backend, MemorySettings::default(), |b| b)
    }

    /// Engine with custom memory settings and builder tweaks.
    pub fn start_with(
        backend: MockBackend,
        memory: MemorySettings,
        configure: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        let backend = Arc::new(backend);
        let factory = Arc::new(ProviderFactory::with_builder(
            Arc::new(FixedBackendBuilder::new(backend.clone())),
            CacheConfig::default(),
        ));
        let store = Arc::new(InMemoryStore::new());
        let memory = Arc::new(MemoryManager::new(store.clone(), memory));

        let engine = configure(
            ConversationEngine::builder()
                .with_factory(factory)
                .with_memory(memory),
        )
        .build()
        .expect("engine should build");

        Self {
            engine,
            backend,
            store,
            channel: Arc::new(InMemoryChannel::new()),
        }
    }

    /// Run a turn on the default channel.
    pub async fn turn(&self, conversation: &str, query: UserQuery) -> colloquy_agent::Result<TurnOutcome> {
        self.turn_on(conversation, query, self.channel.clone()).await
    }

    /// Run a turn on a specific channel.
    pub async fn turn_on(
        &self,
        conversation: &str,
        query: UserQuery,
        channel: Arc<InMemoryChannel>,
    ) -> colloquy_agent::Result<TurnOutcome> {
        self.engine
            .handle_user_turn(&ConversationId::from(conversation), query, &provider(), channel)
            .await
    }
}

/// Provider config that passes credential validation.
pub fn provider() -> ProviderConfig {
    ProviderConfig::new("claude-sonnet", Credentials::api_key("test-key")).with_provider("anthropic")
}

/// Executor with a fast retry schedule.
pub fn fast_executor(max_attempts: u32) -> Arc<ToolExecutor> {
    Arc::new(ToolExecutor::new().with_remote_policy(RetryPolicy {
        timeout: Duration::from_secs(5),
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote Catalogs
// ─────────────────────────────────────────────────────────────────────────────

/// A remote catalog whose tools echo their input, or fail every call.
pub struct TestCatalog {
    name: &'static str,
    tools: Vec<&'static str>,
    failing: bool,
    calls: AtomicUsize,
}

impl TestCatalog {
    /// Catalog whose tools succeed.
    pub fn new(name: &'static str, tools: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            name,
            tools,
            failing: false,
            calls: AtomicUsize::new(0),
        })
    }

    /// Catalog whose tool calls always fail with a transport error.
    pub fn failing(name: &'static str, tools: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            name,
            tools,
            failing: true,
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of tool calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteToolCatalog for TestCatalog {
    fn server_name(&self) -> &str {
        self.name
    }

    async fn list_tools(&self) -> colloquy_mcp::Result<Vec<ToolInfo>> {
        Ok(self
            .tools
            .iter()
            .map(|name| ToolInfo {
                name: name.to_string(),
                description: Some(format!("{} on {}", name.replace('_', " "), self.name)),
                input_schema: Some(json!({"type": "object"})),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> colloquy_mcp::Result<CallToolResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(McpError::transport("connection reset by peer"));
        }
        Ok(CallToolResult {
            content: vec![ToolContent::Text {
                text: format!("{} done: {}", name, arguments),
            }],
            structured_content: None,
            is_error: None,
        })
    }
}

/// Loader over the given catalogs.
pub fn remote_tools(catalogs: Vec<Arc<TestCatalog>>) -> Arc<RemoteToolLoader> {
    Arc::new(
        catalogs
            .into_iter()
            .fold(RemoteToolLoader::new(CacheConfig::default()), |loader, catalog| {
                loader.with_catalog(catalog)
            }),
    )
}

/// Slack tools as a remote catalog would list them.
pub fn slack_catalog() -> Arc<TestCatalog> {
    TestCatalog::new(
        "slack",
        vec![
            "send_slack_message",
            "list_slack_channels",
            "get_slack_thread",
            "add_slack_reaction",
        ],
    )
}

/// GitHub tools as a remote catalog would list them.
pub fn github_catalog() -> Arc<TestCatalog> {
    TestCatalog::new(
        "github",
        vec!["create_github_issue", "list_github_pull_requests", "search_github_code"],
    )
}

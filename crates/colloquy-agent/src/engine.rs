//! The conversation engine: one entry point that drives a full turn.
//!
//! ```text
//! handle_user_turn
//!   ├─ per-conversation lock (turns are strictly sequential)
//!   ├─ memory.load_context ── retrieval (skipped for image turns)
//!   ├─ tool eligibility ── select_tools ── factory.create_model
//!   ├─ graph.run ──▶ bridge.forward ──▶ channel   (under the turn timeout)
//!   └─ memory.record_turn ── store.update_usage ── llm_response_done
//! ```
//!
//! Failures anywhere before `llm_response_done` emit exactly one
//! `conversation_error` and persist nothing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use colloquy_llm::{Credentials, ModelOptions, ProviderFactory, UsageAccumulator, UsageRecord};

use crate::bridge::{DuplexChannel, StreamingBridge};
use crate::context::{Persona, assemble};
use crate::error::{AgentError, Result};
use crate::executor::ToolExecutor;
use crate::graph::{DEFAULT_MAX_ITERATIONS, OrchestrationGraph};
use crate::mcp::RemoteToolLoader;
use crate::memory::MemoryManager;
use crate::rag::Retriever;
use crate::selector::{Selection, SelectionPath, classify_tool_eligibility, select_tools};
use crate::tool::{ToolContext, ToolRegistry};
use crate::tools::{ChildModelSpec, DelegateTool, SubAgent};
use crate::types::{ConversationId, Exchange, ToolEligibility, TurnId, TurnRecord, UserQuery};

/// Notice sent when document search fails and the turn continues without it.
pub const RETRIEVAL_FALLBACK_NOTICE: &str =
    "Couldn't search the attached documents; answering without them.";

/// Which model answers a turn.
#[derive(Clone)]
pub struct ProviderConfig {
    /// Explicit provider id; inferred from the model name when absent.
    pub provider: Option<String>,
    /// Model name.
    pub model: String,
    /// Provider credentials.
    pub credentials: Credentials,
    /// Completion token cap.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl ProviderConfig {
    /// Config for a model with credentials.
    pub fn new(model: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            provider: None,
            model: model.into(),
            credentials,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Set the provider explicitly.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    fn options(&self) -> ModelOptions {
        let mut options = ModelOptions::new();
        if let Some(max_tokens) = self.max_tokens {
            options = options.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            options = options.with_temperature(temperature);
        }
        options
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum tools bound to one model.
    pub max_tools: usize,
    /// Agent iterations per turn.
    pub max_iterations: u32,
    /// Wall-clock budget for the model/tool loop of one turn.
    pub turn_timeout: Duration,
    /// Persona and custom instructions.
    pub persona: Persona,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_tools: 10,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            turn_timeout: Duration::from_secs(300),
            persona: Persona::default(),
        }
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The persisted turn.
    pub turn: TurnRecord,
    /// Final usage tally.
    pub usage: UsageRecord,
    /// Agent iterations completed.
    pub iterations: u32,
    /// Tools bound to the model.
    pub tools: Vec<String>,
}

impl TurnOutcome {
    /// Assistant text as persisted.
    pub fn text(&self) -> &str {
        &self.turn.assistant
    }

    /// Whether the user stopped the turn.
    pub fn stopped(&self) -> bool {
        self.turn.stopped
    }
}

type LockTable = Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>;

/// A conversation's turn lock, dropped from the table once no turn holds
/// or awaits it.
struct TurnSlot<'a> {
    locks: &'a LockTable,
    conversation_id: ConversationId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // One reference in the table, one here
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.conversation_id);
        }
    }
}

/// Drives conversation turns end to end.
pub struct ConversationEngine {
    factory: Arc<ProviderFactory>,
    memory: Arc<MemoryManager>,
    builtins: ToolRegistry,
    remote: Option<Arc<RemoteToolLoader>>,
    executor: Arc<ToolExecutor>,
    retriever: Option<Retriever>,
    subagents: Vec<SubAgent>,
    settings: EngineSettings,
    locks: LockTable,
}

impl ConversationEngine {
    /// Create a builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Memory manager.
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Engine settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn conversation_lock(&self, conversation_id: &ConversationId) -> TurnSlot<'_> {
        let lock = Arc::clone(self.locks.lock().entry(conversation_id.clone()).or_default());
        TurnSlot {
            locks: &self.locks,
            conversation_id: conversation_id.clone(),
            lock,
        }
    }

    /// Every tool available this turn: built-ins, remote catalogs, and the
    /// delegate tool when sub-agents are configured.
    pub async fn catalog(&self, provider: Option<&ProviderConfig>) -> ToolRegistry {
        let mut catalog = self.builtins.clone();
        if let Some(remote) = &self.remote {
            remote.register_into(&mut catalog).await;
        }

        if let Some(provider) = provider
            && !self.subagents.is_empty()
        {
            let spec = ChildModelSpec {
                factory: Arc::clone(&self.factory),
                provider: provider.provider.clone(),
                model: provider.model.clone(),
                credentials: provider.credentials.clone(),
            };
            let delegate = self.subagents.iter().cloned().fold(
                DelegateTool::new(spec, Arc::new(catalog.clone()), Arc::clone(&self.executor))
                    .with_max_iterations(self.settings.max_iterations),
                DelegateTool::with_agent,
            );
            catalog.register(delegate);
        }
        catalog
    }

    /// Tools the selector would bind for a query.
    pub async fn preview_tools(&self, query: &str) -> Selection {
        let catalog = self.catalog(None).await;
        select_tools(query, &catalog, self.settings.max_tools)
    }

    /// Run one user turn, streaming over `channel`.
    ///
    /// The returned error has already been reported to the client.
    pub async fn handle_user_turn(
        &self,
        conversation_id: &ConversationId,
        query: UserQuery,
        provider: &ProviderConfig,
        channel: Arc<dyn DuplexChannel>,
    ) -> Result<TurnOutcome> {
        let slot = self.conversation_lock(conversation_id);
        let _guard = slot.lock.lock().await;

        let turn_id = TurnId::new();
        tracing::info!(
            conversation_id = %conversation_id,
            turn_id = %turn_id,
            model = %provider.model,
            message_len = query.text.len(),
            images = query.images.len(),
            "Turn started"
        );

        let bridge = StreamingBridge::new(Arc::clone(&channel), conversation_id.clone());
        bridge.listen_for_stop();

        let result = self
            .run_turn(conversation_id, turn_id, query, provider, &bridge, channel)
            .await;
        bridge.release();

        match result {
            Ok(outcome) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    turn_id = %turn_id,
                    iterations = outcome.iterations,
                    stopped = outcome.stopped(),
                    total_tokens = outcome.usage.total_tokens,
                    cost = outcome.usage.cost,
                    checkpoint = %outcome.turn.checkpoint,
                    "Turn completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                bridge.emit_error(&e);
                Err(e)
            }
        }
    }

    async fn run_turn(
        &self,
        conversation_id: &ConversationId,
        turn_id: TurnId,
        query: UserQuery,
        provider: &ProviderConfig,
        bridge: &StreamingBridge,
        channel: Arc<dyn DuplexChannel>,
    ) -> Result<TurnOutcome> {
        let usage = UsageAccumulator::shared();
        let memory = self.memory.load_context(conversation_id).await?;
        tracing::debug!(
            conversation_id = %conversation_id,
            checkpoint = %memory.checkpoint,
            history = memory.history.len(),
            summary_len = memory.summary.len(),
            "Context: memory loaded"
        );

        let documents = self.retrieve(&query, bridge).await;

        let eligible = match query.tools {
            ToolEligibility::Always => true,
            ToolEligibility::Never => false,
            ToolEligibility::Auto => classify_tool_eligibility(&query.text),
        };
        let tools = if eligible {
            let catalog = self.catalog(Some(provider)).await;
            let selection = select_tools(&query.text, &catalog, self.settings.max_tools);
            if let SelectionPath::DomainSpecific { domain, .. } = &selection.path {
                tracing::debug!(domain, "Tool selection narrowed to one domain");
            }
            selection.tools
        } else {
            ToolRegistry::new()
        };
        let tool_names: Vec<String> = tools.names().into_iter().map(String::from).collect();
        tracing::debug!(eligible, tools = ?tool_names, "Tools bound");

        let mut options = provider.options().with_usage(Arc::clone(&usage));
        if !tools.is_empty() {
            options = options.with_tools(tools.to_llm_definitions());
        }
        let model = self
            .factory
            .create_model(
                provider.provider.as_deref(),
                &provider.model,
                &provider.credentials,
                options,
            )
            .await?;

        let assembled = assemble(
            model.provider(),
            &self.settings.persona,
            &memory,
            &query,
            documents.as_deref(),
        );

        let ctx = ToolContext::new(conversation_id.clone(), turn_id)
            .with_cancellation(bridge.cancellation())
            .with_channel(channel)
            .with_usage(Arc::clone(&usage));
        let graph = OrchestrationGraph::new(model.clone(), Arc::new(tools), Arc::clone(&self.executor))
            .with_max_iterations(self.settings.max_iterations);
        let events = graph.run(assembled.messages, assembled.system, ctx);

        let timeout = self.settings.turn_timeout;
        let outcome = tokio::time::timeout(timeout, bridge.forward(events))
            .await
            .map_err(|_| AgentError::Timeout(timeout))??;

        let exchange = Exchange {
            turn_id: Some(turn_id),
            user: query.text,
            assistant: outcome.text.clone(),
            model: model.model().to_string(),
            provider: model.provider().to_string(),
            citations: outcome.citations.clone(),
            tool_calls: outcome.tool_calls.clone(),
            stopped: outcome.stopped,
        };
        let mut turn = self
            .memory
            .record_turn(conversation_id, exchange, UsageRecord::default())
            .await?;

        let totals = usage.snapshot();
        self.memory.store().update_usage(turn.id, &totals).await?;
        turn.usage = totals.clone();

        bridge.emit_done(&outcome, &totals, &turn.checkpoint);

        Ok(TurnOutcome {
            turn,
            usage: totals,
            iterations: outcome.iterations,
            tools: tool_names,
        })
    }

    async fn retrieve(&self, query: &UserQuery, bridge: &StreamingBridge) -> Option<String> {
        if query.attachments.is_empty() {
            return None;
        }
        if query.has_images() {
            tracing::debug!("Retrieval skipped for image turn");
            return None;
        }
        let retriever = self.retriever.as_ref()?;

        match retriever.augment(&query.attachments, &query.text).await {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval failed, continuing without documents");
                bridge.emit_progress(RETRIEVAL_FALLBACK_NOTICE);
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`ConversationEngine`].
pub struct EngineBuilder {
    factory: Option<Arc<ProviderFactory>>,
    memory: Option<Arc<MemoryManager>>,
    builtins: ToolRegistry,
    remote: Option<Arc<RemoteToolLoader>>,
    executor: Option<Arc<ToolExecutor>>,
    retriever: Option<Retriever>,
    subagents: Vec<SubAgent>,
    settings: EngineSettings,
}

impl EngineBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            factory: None,
            memory: None,
            builtins: ToolRegistry::new(),
            remote: None,
            executor: None,
            retriever: None,
            subagents: Vec::new(),
            settings: EngineSettings::default(),
        }
    }

    /// Set the provider factory.
    pub fn with_factory(mut self, factory: Arc<ProviderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the memory manager.
    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Set the built-in tools.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.builtins = tools;
        self
    }

    /// Merge remote catalog tools into every turn's catalog.
    pub fn with_remote_tools(mut self, loader: Arc<RemoteToolLoader>) -> Self {
        self.remote = Some(loader);
        self
    }

    /// Set the tool executor.
    pub fn with_executor(mut self, executor: Arc<ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Enable retrieval augmentation for turns with attachments.
    pub fn with_retriever(mut self, retriever: Retriever) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Register a sub-agent reachable through the `delegate` tool.
    pub fn with_subagent(mut self, agent: SubAgent) -> Self {
        self.subagents.push(agent);
        self
    }

    /// Set engine settings.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<ConversationEngine> {
        let factory = self
            .factory
            .ok_or_else(|| AgentError::Config("provider factory is required".to_string()))?;
        let memory = self
            .memory
            .ok_or_else(|| AgentError::Config("memory manager is required".to_string()))?;
        if self.settings.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".to_string()));
        }

        Ok(ConversationEngine {
            factory,
            memory,
            builtins: self.builtins,
            remote: self.remote,
            executor: self.executor.unwrap_or_default(),
            retriever: self.retriever,
            subagents: self.subagents,
            settings: self.settings,
            locks: Mutex::new(HashMap::new()),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

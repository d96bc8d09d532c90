//! Builds a [`ConversationEngine`] from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};

use colloquy_agent::{
    ConversationEngine, EngineSettings, ImageGenConfig, InMemoryStore, MemoryManager,
    MemorySettings, Persona, ProviderConfig, RemoteToolLoader, RetryPolicy, SearchProvider,
    ToolExecutor, WebSearchConfig, builtin_registry,
};
use colloquy_cache::CacheConfig;
use colloquy_config::{Backend, ColloquyConfig, LlmConfig, MemoryConfig, ToolsConfig};
use colloquy_llm::{Credentials, HttpBackendBuilder, ModelOptions, Provider, ProviderFactory};
use colloquy_mcp::{McpClient, McpServerConfig};

/// Command-line overrides for the chat model.
#[derive(Debug, Clone, Default)]
pub struct ModelOverrides {
    /// Backend id, e.g. `anthropic`.
    pub backend: Option<String>,
    /// Model name.
    pub model: Option<String>,
}

/// A ready-to-use engine.
pub struct Runtime {
    pub engine: ConversationEngine,
    pub provider: ProviderConfig,
}

/// Engine without a chat model, for offline inspection.
pub async fn build_engine(config: &ColloquyConfig) -> Result<ConversationEngine> {
    let factory = Arc::new(provider_factory(config));
    let memory = Arc::new(MemoryManager::new(
        Arc::new(InMemoryStore::new()),
        memory_settings(&config.memory_or_default()),
    ));
    engine(config, factory, memory).await
}

/// Engine plus the resolved chat model.
pub async fn build(config: &ColloquyConfig, overrides: &ModelOverrides) -> Result<Runtime> {
    let provider = provider_config(&config.llm_or_default(), overrides)?;
    let factory = Arc::new(provider_factory(config));

    let memory_config = config.memory_or_default();
    let mut memory = MemoryManager::new(Arc::new(InMemoryStore::new()), memory_settings(&memory_config));
    match summarizer(&factory, &memory_config, &provider).await {
        Ok(model) => memory = memory.with_summarizer(model),
        Err(e) => {
            tracing::warn!(error = %e, "Summary model unavailable, using truncation summaries");
        }
    }

    let engine = engine(config, factory, Arc::new(memory)).await?;
    Ok(Runtime { engine, provider })
}

async fn engine(
    config: &ColloquyConfig,
    factory: Arc<ProviderFactory>,
    memory: Arc<MemoryManager>,
) -> Result<ConversationEngine> {
    let tools = config.tools_or_default();
    let orchestration = config.orchestration_or_default();

    let mut builder = ConversationEngine::builder()
        .with_factory(factory)
        .with_memory(memory)
        .with_tools(builtin_registry(web_search_config(&tools), image_config(&tools))?)
        .with_executor(Arc::new(ToolExecutor::new().with_remote_policy(RetryPolicy {
            timeout: tools.remote_timeout(),
            max_attempts: tools.remote_max_attempts,
            initial_backoff: tools.remote_backoff(),
            ..Default::default()
        })))
        .with_settings(EngineSettings {
            max_tools: tools.max_tools,
            max_iterations: orchestration.max_iterations,
            turn_timeout: orchestration.turn_timeout(),
            persona: Persona {
                persona: orchestration.persona.clone(),
                instructions: orchestration.instructions.clone(),
            },
        });

    if let Some(loader) = remote_tools(config, &tools) {
        builder = builder.with_remote_tools(Arc::new(loader));
    }

    Ok(builder.build()?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Model Resolution
// ─────────────────────────────────────────────────────────────────────────────

fn provider_factory(config: &ColloquyConfig) -> ProviderFactory {
    let llm = config.llm_or_default();
    let cache = config.cache_or_default();

    let mut builder = HttpBackendBuilder::default();
    if let Some(secs) = llm.timeout_secs {
        builder.timeout = Duration::from_secs(secs);
    }
    if let Some(max) = llm.retry_max {
        builder.max_retries = max;
    }
    if let Some(ms) = llm.retry_backoff_ms {
        builder.retry_backoff = Duration::from_millis(ms);
    }

    ProviderFactory::with_builder(
        Arc::new(builder),
        CacheConfig::new()
            .with_max_entries(cache.max_entries)
            .with_ttl(Duration::from_secs(cache.model_ttl_secs)),
    )
}

/// Resolve the chat model: CLI flags over config over defaults.
pub fn provider_config(llm: &LlmConfig, overrides: &ModelOverrides) -> Result<ProviderConfig> {
    let mut llm = llm.clone();
    if let Some(id) = &overrides.backend {
        llm.backend = Some(parse_backend(id)?);
    }
    if let Some(model) = &overrides.model {
        llm.model = Some(model.clone());
    }

    let model = llm
        .model
        .clone()
        .unwrap_or_else(|| default_model(llm.backend.unwrap_or(Backend::Anthropic)).to_string());
    let provider = Provider::resolve(llm.backend.map(|b| b.id()), &model);

    let mut credentials = match llm.resolve_api_key()? {
        Some(key) => Credentials::api_key(key),
        None => Credentials::from_env(provider),
    };
    if let Some(url) = &llm.base_url {
        credentials = credentials.with_base_url(url.clone());
    }

    Ok(ProviderConfig {
        provider: Some(provider.name().to_string()),
        model,
        credentials,
        max_tokens: llm.max_tokens,
        temperature: llm.temperature,
    })
}

async fn summarizer(
    factory: &ProviderFactory,
    memory: &MemoryConfig,
    chat: &ProviderConfig,
) -> Result<colloquy_llm::InvocableModel> {
    let (provider, credentials) = match memory.summary_backend {
        Some(backend) => {
            let provider = Provider::resolve(Some(backend.id()), "");
            (Some(backend.id().to_string()), Credentials::from_env(provider))
        }
        None => (chat.provider.clone(), chat.credentials.clone()),
    };
    let model = memory.summary_model.clone().unwrap_or_else(|| chat.model.clone());

    let model = factory
        .create_model(
            provider.as_deref(),
            &model,
            &credentials,
            ModelOptions::new().with_max_tokens(memory.summary_max_tokens * 2),
        )
        .await
        .context("failed to create summary model")?;
    Ok(model)
}

fn parse_backend(s: &str) -> Result<Backend> {
    match s.to_lowercase().as_str() {
        "anthropic" => Ok(Backend::Anthropic),
        "openai" => Ok(Backend::Openai),
        "groq" => Ok(Backend::Groq),
        "ollama" => Ok(Backend::Ollama),
        other => Err(anyhow::anyhow!(
            "Unknown backend '{}'. Valid: anthropic, openai, groq, ollama",
            other
        )),
    }
}

fn default_model(backend: Backend) -> &'static str {
    match backend {
        Backend::Anthropic => "claude-sonnet-4-20250514",
        Backend::Openai => "gpt-4o",
        Backend::Groq => "llama-3.1-70b-versatile",
        Backend::Ollama => "llama3.2",
    }
}

fn memory_settings(config: &MemoryConfig) -> MemorySettings {
    MemorySettings {
        token_limit: config.token_limit,
        summary_min_tokens: config.summary_min_tokens,
        summary_max_tokens: config.summary_max_tokens,
        fallback_exchanges: config.fallback_exchanges,
        excerpt_chars: config.excerpt_chars,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────────────────────────────────────

fn web_search_config(tools: &ToolsConfig) -> WebSearchConfig {
    WebSearchConfig {
        provider: SearchProvider::from_name(&tools.web.provider, tools.web.api_key.clone()),
        max_results: tools.web.max_results,
        timeout: Duration::from_secs(tools.web.timeout_secs),
        base_url: None,
    }
}

/// Image generation is only offered when an OpenAI key is available.
fn image_config(tools: &ToolsConfig) -> Option<ImageGenConfig> {
    let api_key = tools
        .image
        .api_key
        .clone()
        .or_else(|| std::env::var(Backend::Openai.env_var()).ok())
        .filter(|key| !key.trim().is_empty())?;

    let mut config = ImageGenConfig::new(api_key);
    config.model = tools.image.model.clone();
    config.size = tools.image.size.clone();
    Some(config)
}

fn remote_tools(config: &ColloquyConfig, tools: &ToolsConfig) -> Option<RemoteToolLoader> {
    let servers = config.enabled_mcp_servers();
    if servers.is_empty() {
        return None;
    }

    let cache = config.cache_or_default();
    let mut loader = RemoteToolLoader::new(
        CacheConfig::new()
            .with_max_entries(cache.max_entries)
            .with_ttl(Duration::from_secs(cache.catalog_ttl_secs)),
    );

    for server in servers {
        let timeout = server
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| tools.remote_timeout());
        let client_config = McpServerConfig::new(&server.name, &server.url)
            .with_headers(server.header_tuples())
            .with_timeout(timeout);

        match McpClient::new(client_config) {
            Ok(client) => {
                tracing::debug!(server = %server.name, url = %server.url, "Remote tool server configured");
                loader = loader.with_catalog(Arc::new(client));
            }
            Err(e) => {
                tracing::warn!(server = %server.name, error = %e, "Skipping remote tool server");
            }
        }
    }

    (!loader.is_empty()).then_some(loader)
}

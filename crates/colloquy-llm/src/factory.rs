//! Provider adapter factory.
//!
//! [`ProviderFactory::create_model`] turns a provider id, model name and
//! credentials into an [`InvocableModel`]: a backend plus the tools, limits
//! and usage hook bound for one turn. Toolless adapters are cached process-wide
//! for a few minutes, keyed by provider, model and credential fingerprint.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use colloquy_cache::{CacheConfig, TtlCache};
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};

use crate::anthropic::{AnthropicBackend, AnthropicConfig};
use crate::backend::{ResponseStream, SharedBackend, StreamEvent};
use crate::error::{LlmError, Result};
use crate::openai::{OpenAiBackend, OpenAiConfig};
use crate::provider::Provider;
use crate::types::{
    CompletionRequest, CompletionResponse, Message, SystemPrompt, ToolChoice, ToolDefinition,
    Usage,
};
use crate::usage::UsageAccumulator;

/// Default completion budget.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

/// Credentials for one provider.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// API key; optional only for local providers.
    pub api_key: Option<String>,
    /// Endpoint override.
    pub base_url: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Credentials {
    /// Credentials holding an API key.
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            base_url: None,
        }
    }

    /// No credentials (local providers).
    pub fn none() -> Self {
        Self::default()
    }

    /// Read the provider's API key from its conventional environment variable.
    pub fn from_env(provider: Provider) -> Self {
        Self {
            api_key: provider
                .api_key_env()
                .and_then(|var| std::env::var(var).ok())
                .filter(|key| !key.trim().is_empty()),
            base_url: None,
        }
    }

    /// Set an endpoint override.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn has_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Short stable fingerprint, so cached adapters are never shared across keys.
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.api_key.as_deref().unwrap_or_default());
        hasher.update([0u8]);
        hasher.update(self.base_url.as_deref().unwrap_or_default());
        hex::encode(&hasher.finalize()[..6])
    }
}

/// Per-call options for [`ProviderFactory::create_model`].
#[derive(Clone, Default)]
pub struct ModelOptions {
    /// Tools to bind. `None` yields a cacheable toolless adapter.
    pub tools: Option<Vec<ToolDefinition>>,
    /// Usage hook fed after every completion.
    pub usage: Option<Arc<UsageAccumulator>>,
    /// Completion budget; defaults to [`DEFAULT_MAX_TOKENS`].
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl ModelOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind tools.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Record usage into `usage`.
    pub fn with_usage(mut self, usage: Arc<UsageAccumulator>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Set the completion budget.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Construction
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the transport-level backend for a provider.
pub trait BackendBuilder: Send + Sync {
    /// Construct a backend. Credentials have already been validated.
    fn build(&self, provider: Provider, credentials: &Credentials) -> Result<SharedBackend>;
}

/// Builds the HTTP adapters.
#[derive(Debug, Clone)]
pub struct HttpBackendBuilder {
    /// Request timeout.
    pub timeout: Duration,
    /// Retries for transient errors.
    pub max_retries: u32,
    /// Initial retry backoff.
    pub retry_backoff: Duration,
}

impl Default for HttpBackendBuilder {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl BackendBuilder for HttpBackendBuilder {
    fn build(&self, provider: Provider, credentials: &Credentials) -> Result<SharedBackend> {
        let api_key = credentials.api_key.clone().unwrap_or_default();

        let backend: SharedBackend = match provider {
            Provider::Anthropic => {
                let mut config = AnthropicConfig::new(api_key)
                    .with_timeout(self.timeout)
                    .with_max_retries(self.max_retries)
                    .with_retry_backoff(self.retry_backoff);
                if let Some(url) = &credentials.base_url {
                    config = config.with_base_url(url.clone());
                }
                Arc::new(AnthropicBackend::new(config)?)
            }
            Provider::OpenAi | Provider::Groq | Provider::Ollama => {
                let mut config = match provider {
                    Provider::Groq => OpenAiConfig::groq(api_key),
                    Provider::Ollama => {
                        let mut config = OpenAiConfig::ollama();
                        config.api_key = credentials.api_key.clone();
                        config
                    }
                    _ => OpenAiConfig::openai(api_key),
                };
                config = config
                    .with_max_retries(self.max_retries)
                    .with_retry_backoff(self.retry_backoff)
                    .with_single_system_message(provider.requires_single_system_message());
                if provider != Provider::Ollama {
                    config = config.with_timeout(self.timeout);
                }
                if let Some(url) = &credentials.base_url {
                    config = config.with_base_url(url.clone());
                }
                Arc::new(OpenAiBackend::new(config)?)
            }
        };
        Ok(backend)
    }
}

/// Returns the same backend for every provider. For tests and embedding.
#[derive(Clone)]
pub struct FixedBackendBuilder {
    backend: SharedBackend,
}

impl FixedBackendBuilder {
    /// Always build `backend`.
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }
}

impl BackendBuilder for FixedBackendBuilder {
    fn build(&self, _provider: Provider, _credentials: &Credentials) -> Result<SharedBackend> {
        Ok(self.backend.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Creates [`InvocableModel`]s and caches toolless adapters.
#[derive(Clone)]
pub struct ProviderFactory {
    builder: Arc<dyn BackendBuilder>,
    simple_models: TtlCache<SharedBackend>,
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ProviderFactory {
    /// Factory building real HTTP adapters.
    pub fn new(cache: CacheConfig) -> Self {
        Self::with_builder(Arc::new(HttpBackendBuilder::default()), cache)
    }

    /// Factory with a custom backend builder.
    pub fn with_builder(builder: Arc<dyn BackendBuilder>, cache: CacheConfig) -> Self {
        Self {
            builder,
            simple_models: TtlCache::named("simple_models", cache),
        }
    }

    /// Create an invocable model.
    ///
    /// Fails with [`LlmError::Config`] before any network activity when a
    /// credential-requiring provider has no API key.
    pub async fn create_model(
        &self,
        provider_id: Option<&str>,
        model: &str,
        credentials: &Credentials,
        options: ModelOptions,
    ) -> Result<InvocableModel> {
        let provider = Provider::resolve(provider_id, model);

        if provider.requires_api_key() && !credentials.has_key() {
            return Err(LlmError::config(format!(
                "{} requires an API key (set {})",
                provider,
                provider.api_key_env().unwrap_or("api_key")
            )));
        }

        let backend = match &options.tools {
            Some(tools) if !tools.is_empty() => self.builder.build(provider, credentials)?,
            _ => {
                let key = format!(
                    "{}:{}:toolless:{}",
                    provider,
                    model,
                    credentials.fingerprint()
                );
                self.simple_models
                    .get_or_try_insert_with(&key, || async {
                        self.builder.build(provider, credentials)
                    })
                    .await?
            }
        };

        tracing::debug!(
            provider = %provider,
            model,
            tools = options.tools.as_ref().map(Vec::len).unwrap_or(0),
            "Created model"
        );

        Ok(InvocableModel {
            backend,
            provider,
            model: model.to_string(),
            tools: options.tools.unwrap_or_default(),
            usage: options.usage,
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: options.temperature,
        })
    }

    /// Number of cached toolless adapters.
    pub async fn cached_models(&self) -> usize {
        self.simple_models.len().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Invocable Model
// ─────────────────────────────────────────────────────────────────────────────

/// A backend bound to one model, its tools and a usage hook.
#[derive(Clone)]
pub struct InvocableModel {
    backend: SharedBackend,
    provider: Provider,
    model: String,
    tools: Vec<ToolDefinition>,
    usage: Option<Arc<UsageAccumulator>>,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl std::fmt::Debug for InvocableModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocableModel")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .finish()
    }
}

impl InvocableModel {
    /// Resolved provider.
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Bound tool definitions.
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Underlying backend.
    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Build the request sent for `messages`.
    pub fn request(&self, messages: Vec<Message>, system: Option<SystemPrompt>) -> CompletionRequest {
        let mut request = CompletionRequest::new(&self.model, messages, self.max_tokens)
            .with_system_prompt(system);
        if !self.tools.is_empty() {
            request = request
                .with_tools(self.tools.clone())
                .with_tool_choice(ToolChoice::Auto);
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    /// Run one completion and record its usage.
    pub async fn invoke(
        &self,
        messages: Vec<Message>,
        system: Option<SystemPrompt>,
    ) -> Result<CompletionResponse> {
        let response = self.backend.complete(self.request(messages, system)).await?;
        if let Some(usage) = &self.usage {
            usage.record_usage(&self.model, &response.usage);
        }
        Ok(response)
    }

    /// Stream one completion. Usage is recorded when the stream ends or is dropped.
    pub async fn stream(
        &self,
        messages: Vec<Message>,
        system: Option<SystemPrompt>,
    ) -> Result<ResponseStream> {
        let request = self.request(messages, system).with_streaming();
        let inner = self.backend.complete_stream(request).await?;
        Ok(Box::pin(UsageRecordingStream {
            inner,
            model: self.model.clone(),
            usage: Usage::default(),
            sink: self.usage.clone(),
            seen: false,
        }))
    }
}

/// Observes usage events and reports them once to the accumulator.
struct UsageRecordingStream {
    inner: ResponseStream,
    model: String,
    usage: Usage,
    sink: Option<Arc<UsageAccumulator>>,
    seen: bool,
}

impl UsageRecordingStream {
    fn flush(&mut self) {
        if let Some(sink) = self.sink.take() {
            if self.seen {
                sink.record_usage(&self.model, &self.usage);
            }
        }
    }
}

impl Stream for UsageRecordingStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(StreamEvent::MessageStart { usage, .. })))
            | Poll::Ready(Some(Ok(StreamEvent::MessageDelta { usage, .. }))) => {
                let usage = *usage;
                self.usage.add(&usage);
                self.seen = true;
            }
            Poll::Ready(Some(Ok(StreamEvent::MessageStop))) | Poll::Ready(None) => {
                self.flush();
            }
            _ => {}
        }
        polled
    }
}

impl Drop for UsageRecordingStream {
    fn drop(&mut self) {
        // Cancelled streams still bill the tokens seen so far
        self.flush();
    }
}

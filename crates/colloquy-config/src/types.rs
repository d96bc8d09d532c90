//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [llm]                    # default chat model
//! [memory]                 # rolling summary limits + summarizer model
//! [tools]                  # selection size, remote call limits, built-in tools
//! [[mcp.servers]]          # remote tool catalogs
//! [orchestration]          # loop limits, persona
//! [cache]                  # process-wide cache TTLs
//! [logging]
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged. Use the `*_or_default` accessors to
/// read a section with its defaults filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColloquyConfig {
    /// Default chat model (`[llm]`).
    pub llm: Option<LlmConfig>,

    /// Conversation memory settings.
    pub memory: Option<MemoryConfig>,

    /// Tool selection and execution settings.
    pub tools: Option<ToolsConfig>,

    /// Remote MCP tool servers.
    pub mcp: Option<McpConfig>,

    /// Orchestration loop settings.
    pub orchestration: Option<OrchestrationConfig>,

    /// Process-wide cache settings.
    pub cache: Option<CacheSection>,

    /// Logging settings.
    pub logging: Option<LoggingConfig>,
}

impl ColloquyConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced wholesale; MCP servers are merged by name.
    pub fn merge(&mut self, other: ColloquyConfig) {
        if other.llm.is_some() {
            self.llm = other.llm;
        }

        if other.memory.is_some() {
            self.memory = other.memory;
        }

        if other.tools.is_some() {
            self.tools = other.tools;
        }

        if let Some(mcp) = other.mcp {
            match self.mcp.as_mut() {
                Some(existing) => {
                    existing.enabled = mcp.enabled;
                    for server in mcp.servers {
                        existing.servers.retain(|s| s.name != server.name);
                        existing.servers.push(server);
                    }
                }
                None => self.mcp = Some(mcp),
            }
        }

        if other.orchestration.is_some() {
            self.orchestration = other.orchestration;
        }

        if other.cache.is_some() {
            self.cache = other.cache;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// The `[llm]` section, or defaults.
    pub fn llm_or_default(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }

    /// The `[memory]` section, or defaults.
    pub fn memory_or_default(&self) -> MemoryConfig {
        self.memory.clone().unwrap_or_default()
    }

    /// The `[tools]` section, or defaults.
    pub fn tools_or_default(&self) -> ToolsConfig {
        self.tools.clone().unwrap_or_default()
    }

    /// The `[orchestration]` section, or defaults.
    pub fn orchestration_or_default(&self) -> OrchestrationConfig {
        self.orchestration.clone().unwrap_or_default()
    }

    /// The `[cache]` section, or defaults.
    pub fn cache_or_default(&self) -> CacheSection {
        self.cache.clone().unwrap_or_default()
    }

    /// Enabled MCP servers, or none when MCP is disabled.
    pub fn enabled_mcp_servers(&self) -> Vec<&McpServerEntry> {
        match &self.mcp {
            Some(mcp) if mcp.enabled => mcp.servers.iter().filter(|s| s.enabled).collect(),
            _ => Vec::new(),
        }
    }

    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        let memory = self.memory_or_default();
        if memory.token_limit == 0 {
            return Err(invalid("memory.token_limit", "must be greater than zero"));
        }
        if memory.summary_min_tokens > memory.summary_max_tokens {
            return Err(invalid(
                "memory.summary_min_tokens",
                "must not exceed summary_max_tokens",
            ));
        }

        let tools = self.tools_or_default();
        if tools.max_tools == 0 {
            return Err(invalid("tools.max_tools", "must be greater than zero"));
        }
        if tools.remote_max_attempts == 0 {
            return Err(invalid(
                "tools.remote_max_attempts",
                "must be at least one attempt",
            ));
        }

        if self.orchestration_or_default().max_iterations == 0 {
            return Err(invalid(
                "orchestration.max_iterations",
                "must be greater than zero",
            ));
        }

        if let Some(mcp) = &self.mcp {
            for server in &mcp.servers {
                if server.url.trim().is_empty() {
                    return Err(invalid(
                        &format!("mcp.servers.{}.url", server.name),
                        "must not be empty",
                    ));
                }
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::ConfigError {
    crate::ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LLM Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the chat model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Backend provider. Inferred from the model name when absent.
    pub backend: Option<Backend>,
    /// Model identifier.
    pub model: Option<String>,
    /// Custom API base URL (for proxies, custom endpoints).
    pub base_url: Option<String>,
    /// API key (prefer an env var; warns if set here).
    pub api_key: Option<String>,
    /// Maximum retry attempts for failed requests.
    pub retry_max: Option<u32>,
    /// Backoff delay between retries in milliseconds.
    pub retry_backoff_ms: Option<u64>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Maximum tokens to generate per response.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl LlmConfig {
    /// Returns true if an API key is stored directly in the config file.
    pub fn has_plaintext_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Resolve the API key: config file first, then the backend's env var.
    ///
    /// Returns `Ok(None)` for backends that run without credentials.
    pub fn resolve_api_key(&self) -> crate::Result<Option<String>> {
        if let Some(key) = &self.api_key {
            return Ok(Some(key.clone()));
        }

        let Some(backend) = self.backend else {
            return Ok(None);
        };

        match std::env::var(backend.env_var()) {
            Ok(key) if !key.is_empty() => Ok(Some(key)),
            _ if !backend.requires_api_key() => Ok(None),
            _ => Err(crate::ConfigError::ApiKeyNotFound {
                backend: backend.to_string(),
                env_var: backend.env_var().to_string(),
            }),
        }
    }
}

/// Supported LLM backend providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Anthropic,
    Openai,
    Groq,
    Ollama,
}

impl Backend {
    /// Environment variable name for this backend's API key.
    pub fn env_var(&self) -> &'static str {
        match self {
            Backend::Anthropic => "ANTHROPIC_API_KEY",
            Backend::Openai => "OPENAI_API_KEY",
            Backend::Groq => "GROQ_API_KEY",
            Backend::Ollama => "OLLAMA_API_KEY",
        }
    }

    /// Whether a credential is mandatory.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Backend::Ollama)
    }

    /// Lowercase identifier, as written in TOML.
    pub fn id(&self) -> &'static str {
        match self {
            Backend::Anthropic => "anthropic",
            Backend::Openai => "openai",
            Backend::Groq => "groq",
            Backend::Ollama => "ollama",
        }
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Backend::Anthropic => "Anthropic",
            Backend::Openai => "OpenAI",
            Backend::Groq => "Groq",
            Backend::Ollama => "Ollama",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Rolling summary configuration.
///
/// ```toml
/// [memory]
/// token_limit = 10000
/// summary_model = "gpt-4o-mini"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Estimated token count of buffered exchanges that triggers summarization.
    pub token_limit: usize,
    /// Backend for the summarizer. Defaults to the chat backend.
    pub summary_backend: Option<Backend>,
    /// Cheap model used for summarization. Defaults to the chat model.
    pub summary_model: Option<String>,
    /// Lower bound of the requested summary length, in tokens.
    pub summary_min_tokens: u32,
    /// Upper bound of the requested summary length, in tokens.
    pub summary_max_tokens: u32,
    /// Exchanges kept by the truncation fallback.
    pub fallback_exchanges: usize,
    /// Characters kept per message by the truncation fallback.
    pub excerpt_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            token_limit: 10_000,
            summary_backend: None,
            summary_model: None,
            summary_min_tokens: 400,
            summary_max_tokens: 800,
            fallback_exchanges: 3,
            excerpt_chars: 400,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tools Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tool selection and execution configuration.
///
/// ```toml
/// [tools]
/// max_tools = 10
/// remote_timeout_secs = 300
/// remote_max_attempts = 3
///
/// [tools.web]
/// provider = "brave"
///
/// [tools.image]
/// model = "dall-e-3"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Maximum number of tools bound to one model invocation.
    pub max_tools: usize,
    /// Timeout for a single remote tool attempt, in seconds.
    pub remote_timeout_secs: u64,
    /// Attempts per remote tool call (first try included).
    pub remote_max_attempts: u32,
    /// Initial backoff between remote attempts, in milliseconds. Doubles each retry.
    pub remote_backoff_ms: u64,
    /// Web search tool configuration.
    pub web: WebToolConfig,
    /// Image generation tool configuration.
    pub image: ImageToolConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_tools: 10,
            remote_timeout_secs: 300,
            remote_max_attempts: 3,
            remote_backoff_ms: 1000,
            web: WebToolConfig::default(),
            image: ImageToolConfig::default(),
        }
    }
}

impl ToolsConfig {
    /// Remote attempt timeout as a [`Duration`].
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    /// Initial remote backoff as a [`Duration`].
    pub fn remote_backoff(&self) -> Duration {
        Duration::from_millis(self.remote_backoff_ms)
    }
}

/// Web search tool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebToolConfig {
    /// Search provider: `brave`, `serper`, `tavily` or `duckduckgo`.
    pub provider: String,
    /// API key for the provider (falls back to `<PROVIDER>_API_KEY`).
    pub api_key: Option<String>,
    /// Maximum results per search.
    pub max_results: usize,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for WebToolConfig {
    fn default() -> Self {
        Self {
            provider: "duckduckgo".to_string(),
            api_key: None,
            max_results: 5,
            timeout_secs: 30,
        }
    }
}

/// Image generation tool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageToolConfig {
    /// Image model.
    pub model: String,
    /// Output size, e.g. `1024x1024`.
    pub size: String,
    /// API key (falls back to `OPENAI_API_KEY`).
    pub api_key: Option<String>,
}

impl Default for ImageToolConfig {
    fn default() -> Self {
        Self {
            model: "dall-e-3".to_string(),
            size: "1024x1024".to_string(),
            api_key: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// MCP (Model Context Protocol) configuration.
///
/// ```toml
/// [mcp]
/// enabled = true
///
/// [[mcp.servers]]
/// name = "slack"
/// url = "https://mcp.example.com/slack"
/// headers = [["Authorization", "Bearer xoxb-..."]]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Whether MCP is enabled globally.
    pub enabled: bool,
    /// Configured MCP servers.
    pub servers: Vec<McpServerEntry>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: Vec::new(),
        }
    }
}

/// Configuration for a single remote MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerEntry {
    /// Unique name for this server; also used for domain matching.
    pub name: String,
    /// JSON-RPC endpoint.
    pub url: String,
    /// HTTP headers to send (as [key, value] pairs).
    #[serde(default)]
    pub headers: Vec<[String; 2]>,
    /// Request timeout in seconds for catalog calls. Defaults to 30.
    pub timeout_secs: Option<u64>,
    /// Whether this server is enabled. Defaults to true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl McpServerEntry {
    /// Create a new enabled server entry.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: Vec::new(),
            timeout_secs: None,
            enabled: true,
        }
    }

    /// Add an HTTP header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push([key.into(), value.into()]);
        self
    }

    /// Headers as tuples.
    pub fn header_tuples(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|[k, v]| (k.clone(), v.clone()))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestration Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Orchestration loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Maximum agent → tools cycles per turn.
    pub max_iterations: u32,
    /// Overall deadline for one turn, in seconds.
    pub turn_timeout_secs: u64,
    /// Agent persona prepended to the system context.
    pub persona: Option<String>,
    /// Additional custom instructions.
    pub instructions: Option<String>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            turn_timeout_secs: 300,
            persona: None,
            instructions: None,
        }
    }
}

impl OrchestrationConfig {
    /// Turn deadline as a [`Duration`].
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// TTL for tool-less model adapters, in seconds.
    pub model_ttl_secs: u64,
    /// TTL for remote tool catalogs, in seconds.
    pub catalog_ttl_secs: u64,
    /// Maximum entries per cache.
    pub max_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            model_ttl_secs: 300,
            catalog_ttl_secs: 300,
            max_entries: 64,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console filter directive, e.g. `info` or `colloquy_agent=debug`.
    pub level: Option<String>,
    /// Whether to write JSON logs to the rolling log file.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            file: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_config() {
        let config = ColloquyConfig::from_toml("").unwrap();
        assert!(config.llm.is_none());
        assert_eq!(config.memory_or_default().token_limit, 10_000);
        assert_eq!(config.tools_or_default().max_tools, 10);
        assert_eq!(config.orchestration_or_default().max_iterations, 10);
        assert_eq!(config.cache_or_default().model_ttl_secs, 300);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[llm]
backend = "anthropic"
model = "claude-sonnet-4-20250514"
max_tokens = 2048

[memory]
token_limit = 5000
summary_model = "claude-3-haiku-20240307"

[tools]
max_tools = 8
remote_max_attempts = 5

[tools.web]
provider = "brave"

[[mcp.servers]]
name = "slack"
url = "https://mcp.example.com/slack"
headers = [["Authorization", "Bearer t"]]

[[mcp.servers]]
name = "github"
url = "https://mcp.example.com/github"
enabled = false

[orchestration]
max_iterations = 4
persona = "You are a research assistant."
"#;
        let config = ColloquyConfig::from_toml(toml).unwrap();

        let llm = config.llm.as_ref().unwrap();
        assert_eq!(llm.backend, Some(Backend::Anthropic));
        assert_eq!(llm.max_tokens, Some(2048));

        let memory = config.memory_or_default();
        assert_eq!(memory.token_limit, 5000);
        assert_eq!(memory.summary_max_tokens, 800);

        let tools = config.tools_or_default();
        assert_eq!(tools.max_tools, 8);
        assert_eq!(tools.remote_max_attempts, 5);
        assert_eq!(tools.remote_timeout_secs, 300);
        assert_eq!(tools.web.provider, "brave");

        let servers = config.enabled_mcp_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "slack");
        assert_eq!(
            servers[0].header_tuples(),
            vec![("Authorization".to_string(), "Bearer t".to_string())]
        );

        let orch = config.orchestration_or_default();
        assert_eq!(orch.max_iterations, 4);
        assert_eq!(orch.turn_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip_preserves_sections() {
        let mut config = ColloquyConfig::new();
        config.llm = Some(LlmConfig {
            backend: Some(Backend::Groq),
            model: Some("llama-3.1-70b-versatile".to_string()),
            ..Default::default()
        });
        config.orchestration = Some(OrchestrationConfig::default());

        let parsed = ColloquyConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_merge_overrides_and_merges_servers() {
        let mut base = ColloquyConfig::from_toml(
            r#"
[llm]
backend = "openai"
model = "gpt-4o"

[[mcp.servers]]
name = "slack"
url = "https://old.example.com"

[[mcp.servers]]
name = "github"
url = "https://gh.example.com"
"#,
        )
        .unwrap();

        let overlay = ColloquyConfig::from_toml(
            r#"
[llm]
backend = "anthropic"
model = "claude-3-5-haiku-latest"

[[mcp.servers]]
name = "slack"
url = "https://new.example.com"
"#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.llm.as_ref().unwrap().backend, Some(Backend::Anthropic));
        let servers = &base.mcp.as_ref().unwrap().servers;
        assert_eq!(servers.len(), 2);
        let slack = servers.iter().find(|s| s.name == "slack").unwrap();
        assert_eq!(slack.url, "https://new.example.com");
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = ColloquyConfig::from_toml("[tools]\nmax_tools = 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(crate::ConfigError::Invalid { .. })
        ));

        let config = ColloquyConfig::from_toml("[memory]\ntoken_limit = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config =
            ColloquyConfig::from_toml("[orchestration]\nmax_iterations = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mcp_disabled_globally() {
        let config = ColloquyConfig::from_toml(
            r#"
[mcp]
enabled = false

[[mcp.servers]]
name = "slack"
url = "https://mcp.example.com"
"#,
        )
        .unwrap();
        assert!(config.enabled_mcp_servers().is_empty());
    }

    #[test]
    fn test_backend_metadata() {
        assert_eq!(Backend::Anthropic.env_var(), "ANTHROPIC_API_KEY");
        assert!(Backend::Groq.requires_api_key());
        assert!(!Backend::Ollama.requires_api_key());
        assert_eq!(Backend::Openai.to_string(), "OpenAI");
        assert_eq!(Backend::Ollama.id(), "ollama");
    }

    #[test]
    fn test_resolve_api_key_prefers_config() {
        let llm = LlmConfig {
            backend: Some(Backend::Openai),
            api_key: Some("sk-config".to_string()),
            ..Default::default()
        };
        assert_eq!(llm.resolve_api_key().unwrap().as_deref(), Some("sk-config"));
    }

    #[test]
    #[serial]
    fn test_resolve_api_key_env_and_missing() {
        let llm = LlmConfig {
            backend: Some(Backend::Groq),
            ..Default::default()
        };

        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { std::env::set_var("GROQ_API_KEY", "gsk-env") };
        assert_eq!(llm.resolve_api_key().unwrap().as_deref(), Some("gsk-env"));

        unsafe { std::env::remove_var("GROQ_API_KEY") };
        assert!(matches!(
            llm.resolve_api_key(),
            Err(crate::ConfigError::ApiKeyNotFound { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_resolve_api_key_local_backend() {
        let llm = LlmConfig {
            backend: Some(Backend::Ollama),
            ..Default::default()
        };
        unsafe { std::env::remove_var("OLLAMA_API_KEY") };
        assert_eq!(llm.resolve_api_key().unwrap(), None);
    }
}

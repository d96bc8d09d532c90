//! Provider classification.
//!
//! An explicit provider id always wins. Without one, the provider is inferred
//! from substrings of the model name. Anything unrecognized falls back to
//! [`Provider::DEFAULT`] so a stale config value never stops a turn.

use std::fmt;

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Anthropic Messages API.
    Anthropic,
    /// OpenAI chat completions.
    OpenAi,
    /// Groq cloud inference (OpenAI-compatible).
    Groq,
    /// Local Ollama instance (OpenAI-compatible, no credential).
    Ollama,
}

/// Model-name fragments checked in order; first hit wins.
const MODEL_HINTS: &[(&str, Provider)] = &[
    ("claude", Provider::Anthropic),
    ("gpt", Provider::OpenAi),
    ("o1", Provider::OpenAi),
    ("o3", Provider::OpenAi),
    ("dall-e", Provider::OpenAi),
    ("llama", Provider::Groq),
    ("mixtral", Provider::Groq),
    ("gemma", Provider::Groq),
];

impl Provider {
    /// Fallback for unrecognized ids and model names.
    pub const DEFAULT: Provider = Provider::OpenAi;

    /// All providers.
    pub const ALL: [Provider; 4] = [
        Provider::Anthropic,
        Provider::OpenAi,
        Provider::Groq,
        Provider::Ollama,
    ];

    /// Get the string name for this provider.
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Groq => "groq",
            Provider::Ollama => "ollama",
        }
    }

    /// Parse a provider from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Provider::Anthropic),
            "openai" | "gpt" => Some(Provider::OpenAi),
            "groq" => Some(Provider::Groq),
            "ollama" | "local" => Some(Provider::Ollama),
            _ => None,
        }
    }

    /// Infer a provider from a model name, if any hint matches.
    pub fn infer_from_model(model: &str) -> Option<Self> {
        let model = model.to_lowercase();
        MODEL_HINTS
            .iter()
            .find(|(hint, _)| model.contains(hint))
            .map(|(_, provider)| *provider)
    }

    /// Resolve the provider for a call.
    ///
    /// Order: explicit id, then model-name inference, then [`Provider::DEFAULT`].
    pub fn resolve(explicit: Option<&str>, model: &str) -> Self {
        if let Some(id) = explicit.filter(|id| !id.trim().is_empty()) {
            match Self::from_name(id) {
                Some(provider) => return provider,
                None => {
                    tracing::warn!(provider = id, model, "Unknown provider id, inferring from model");
                }
            }
        }

        Self::infer_from_model(model).unwrap_or_else(|| {
            tracing::warn!(
                model,
                default = Self::DEFAULT.name(),
                "Could not infer provider from model, using default"
            );
            Self::DEFAULT
        })
    }

    /// Check if this provider requires an API key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Provider::Ollama)
    }

    /// Whether all system content must be merged into one system message.
    pub fn requires_single_system_message(&self) -> bool {
        matches!(self, Provider::Groq | Provider::Ollama)
    }

    /// Environment variable holding this provider's API key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Groq => Some("GROQ_API_KEY"),
            Provider::Ollama => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

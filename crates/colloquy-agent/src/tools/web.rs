//! Web search tool.
//!
//! Queries one of several search APIs and returns the hits both as JSON for
//! the model and as citations for the client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::tool::{ParamExt, Tool, ToolContext, ToolResult};
use crate::types::Citation;

/// Web search provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum SearchProvider {
    /// Brave Search API
    Brave { api_key: String },
    /// Serper (Google Search API)
    Serper { api_key: String },
    /// Tavily Search API
    Tavily { api_key: String },
    /// DuckDuckGo (no API key needed, but limited)
    DuckDuckGo,
}

impl SearchProvider {
    /// Build from a provider name and optional key.
    ///
    /// Keyed providers without a key fall back to DuckDuckGo.
    pub fn from_name(name: &str, api_key: Option<String>) -> Self {
        match (name.to_lowercase().as_str(), api_key) {
            ("brave", Some(api_key)) => Self::Brave { api_key },
            ("serper", Some(api_key)) => Self::Serper { api_key },
            ("tavily", Some(api_key)) => Self::Tavily { api_key },
            ("duckduckgo", _) => Self::DuckDuckGo,
            (other, _) => {
                tracing::warn!(provider = other, "Search provider unavailable, using DuckDuckGo");
                Self::DuckDuckGo
            }
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::Brave { .. } => "https://api.search.brave.com",
            Self::Serper { .. } => "https://google.serper.dev",
            Self::Tavily { .. } => "https://api.tavily.com",
            Self::DuckDuckGo => "https://api.duckduckgo.com",
        }
    }
}

/// Configuration for web search.
#[derive(Debug, Clone)]
pub struct WebSearchConfig {
    /// Search provider configuration.
    pub provider: SearchProvider,
    /// Maximum number of results to return.
    pub max_results: usize,
    /// Request timeout.
    pub timeout: Duration,
    /// Override for the provider's API host.
    pub base_url: Option<String>,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: SearchProvider::DuckDuckGo,
            max_results: 5,
            timeout: Duration::from_secs(30),
            base_url: None,
        }
    }
}

/// A single search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

impl From<&SearchResult> for Citation {
    fn from(result: &SearchResult) -> Self {
        let citation = Citation::new(&result.title, &result.url);
        if result.snippet.is_empty() {
            citation
        } else {
            citation.with_snippet(&result.snippet)
        }
    }
}

/// Tool for searching the web.
#[derive(Debug, Clone)]
pub struct WebSearchTool {
    client: Client,
    config: WebSearchConfig,
}

impl WebSearchTool {
    /// Create a web search tool with custom configuration.
    pub fn with_config(config: WebSearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Create a web search tool with DuckDuckGo.
    pub fn duckduckgo() -> Result<Self> {
        Self::with_config(WebSearchConfig::default())
    }

    /// Create a web search tool with Brave Search.
    pub fn brave(api_key: impl Into<String>) -> Result<Self> {
        Self::with_config(WebSearchConfig {
            provider: SearchProvider::Brave {
                api_key: api_key.into(),
            },
            ..Default::default()
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &WebSearchConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or_else(|| self.config.provider.default_base_url());
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    async fn send_json(&self, request: reqwest::RequestBuilder, provider: &str) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| AgentError::tool(format!("{} search failed: {}", provider, e)))?;

        if !response.status().is_success() {
            return Err(AgentError::tool(format!(
                "{} search error: {}",
                provider,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::tool(format!("Failed to parse response: {}", e)))
    }

    async fn search_brave(&self, query: &str, api_key: &str) -> Result<Vec<SearchResult>> {
        let url = format!(
            "{}?q={}&count={}",
            self.endpoint("/res/v1/web/search"),
            urlencoding::encode(query),
            self.config.max_results
        );
        let request = self
            .client
            .get(&url)
            .header("X-Subscription-Token", api_key)
            .header("Accept", "application/json");
        let data = self.send_json(request, "Brave").await?;

        Ok(parse_results(&data["web"]["results"], "url", "description"))
    }

    async fn search_serper(&self, query: &str, api_key: &str) -> Result<Vec<SearchResult>> {
        let request = self
            .client
            .post(self.endpoint("/search"))
            .header("X-API-KEY", api_key)
            .json(&json!({
                "q": query,
                "num": self.config.max_results
            }));
        let data = self.send_json(request, "Serper").await?;

        Ok(parse_results(&data["organic"], "link", "snippet"))
    }

    async fn search_tavily(&self, query: &str, api_key: &str) -> Result<Vec<SearchResult>> {
        let request = self.client.post(self.endpoint("/search")).json(&json!({
            "api_key": api_key,
            "query": query,
            "max_results": self.config.max_results
        }));
        let data = self.send_json(request, "Tavily").await?;

        Ok(parse_results(&data["results"], "url", "content"))
    }

    async fn search_duckduckgo(&self, query: &str) -> Result<Vec<SearchResult>> {
        // Instant answer API: limited but keyless
        let url = format!(
            "{}/?q={}&format=json&no_html=1&skip_disambig=1",
            self.endpoint(""),
            urlencoding::encode(query)
        );
        let data = self.send_json(self.client.get(&url), "DuckDuckGo").await?;

        let mut results = Vec::new();
        if let Some(abstract_text) = data["AbstractText"].as_str()
            && !abstract_text.is_empty()
        {
            results.push(SearchResult {
                title: data["Heading"].as_str().unwrap_or("Result").to_string(),
                url: data["AbstractURL"].as_str().unwrap_or("").to_string(),
                snippet: abstract_text.to_string(),
            });
        }

        if let Some(topics) = data["RelatedTopics"].as_array() {
            let room = self.config.max_results.saturating_sub(results.len());
            for topic in topics.iter().take(room) {
                if let (Some(text), Some(url)) = (topic["Text"].as_str(), topic["FirstURL"].as_str()) {
                    results.push(SearchResult {
                        title: text.chars().take(50).collect::<String>() + "...",
                        url: url.to_string(),
                        snippet: text.to_string(),
                    });
                }
            }
        }

        Ok(results)
    }
}

fn parse_results(items: &Value, url_key: &str, snippet_key: &str) -> Vec<SearchResult> {
    items
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|r| {
                    Some(SearchResult {
                        title: r["title"].as_str()?.to_string(),
                        url: r[url_key].as_str()?.to_string(),
                        snippet: r[snippet_key].as_str().unwrap_or("").to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns relevant results with titles, URLs, and snippets."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult> {
        if ctx.is_cancelled() {
            return Ok(ToolResult::error("Operation cancelled"));
        }

        let query = params.required_str("query", "Provide the text to search for")?;
        ctx.progress(format!("Searching the web for \"{}\"", query));

        let results = match &self.config.provider {
            SearchProvider::Brave { api_key } => self.search_brave(query, api_key).await,
            SearchProvider::Serper { api_key } => self.search_serper(query, api_key).await,
            SearchProvider::Tavily { api_key } => self.search_tavily(query, api_key).await,
            SearchProvider::DuckDuckGo => self.search_duckduckgo(query).await,
        };

        match results {
            Ok(results) if results.is_empty() => Ok(ToolResult::text("No results found")),
            Ok(results) => {
                let citations = results.iter().map(Citation::from).collect();
                Ok(ToolResult::json(json!({
                    "query": query,
                    "count": results.len(),
                    "results": results
                }))
                .with_citations(citations))
            }
            Err(e) => Ok(ToolResult::error(format!("Search failed: {}", e))),
        }
    }
}

//! Image generation tool backed by the OpenAI images API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::tool::{ParamExt, ParameterValidationError, Tool, ToolContext, ToolResult};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const SUPPORTED_SIZES: &[&str] = &["256x256", "512x512", "1024x1024", "1024x1792", "1792x1024"];

/// Configuration for image generation.
#[derive(Debug, Clone)]
pub struct ImageGenConfig {
    /// Image model.
    pub model: String,
    /// Default output size.
    pub size: String,
    /// API key.
    pub api_key: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Override for the API host.
    pub base_url: Option<String>,
}

impl ImageGenConfig {
    /// Configuration with defaults for everything but the key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            model: "dall-e-3".to_string(),
            size: "1024x1024".to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(120),
            base_url: None,
        }
    }
}

/// Estimate tokens for a generated image from its dimensions.
///
/// Counts 512px tiles the way vision inputs are billed: 85 base plus 170 per tile.
pub fn estimate_image_tokens(size: &str) -> u64 {
    let Some((w, h)) = size.split_once('x') else {
        return 85;
    };
    let (Ok(w), Ok(h)) = (w.trim().parse::<u64>(), h.trim().parse::<u64>()) else {
        return 85;
    };
    85 + 170 * w.div_ceil(512) * h.div_ceil(512)
}

/// Tool for generating images from a prompt.
#[derive(Debug, Clone)]
pub struct ImageGenTool {
    client: Client,
    config: ImageGenConfig,
}

impl ImageGenTool {
    /// Create the tool.
    pub fn new(config: ImageGenConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/v1/images/generations", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl Tool for ImageGenTool {
    fn name(&self) -> &str {
        "generate_image"
    }

    fn description(&self) -> &str {
        "Generate an image from a text description. Returns a URL to the image."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Detailed description of the image"
                },
                "size": {
                    "type": "string",
                    "enum": SUPPORTED_SIZES,
                    "description": "Image dimensions"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult> {
        if ctx.is_cancelled() {
            return Ok(ToolResult::error("Operation cancelled"));
        }

        let prompt = params.required_str("prompt", "Describe the image to generate")?;
        let size = params.optional_str("size").unwrap_or(&self.config.size);
        if !SUPPORTED_SIZES.contains(&size) {
            return Err(ParameterValidationError::invalid_value(
                "size",
                size,
                format!("must be one of {}", SUPPORTED_SIZES.join(", ")),
            )
            .into());
        }

        ctx.progress("Generating image...");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "prompt": prompt,
                "n": 1,
                "size": size,
            }))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::error(format!("Image request failed: {}", e))),
        };
        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => return Ok(ToolResult::error(format!("Failed to parse response: {}", e))),
        };
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Ok(ToolResult::error(format!(
                "Image generation failed ({}): {}",
                status.as_u16(),
                message
            )));
        }

        let image = &body["data"][0];
        let Some(url) = image["url"].as_str() else {
            return Ok(ToolResult::error("Image generation returned no image URL"));
        };

        let tokens = body["usage"]["output_tokens"]
            .as_u64()
            .unwrap_or_else(|| estimate_image_tokens(size));
        if let Some(usage) = ctx.usage() {
            usage.record_image(&self.config.model, tokens);
        }
        tracing::debug!(model = %self.config.model, size, tokens, "Generated image");

        let mut result = json!({ "url": url, "size": size });
        if let Some(revised) = image["revised_prompt"].as_str() {
            result["revised_prompt"] = json!(revised);
        }
        Ok(ToolResult::json(result))
    }
}

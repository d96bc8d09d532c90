//! Built-in tools for the agent.
//!
//! - Web search with citations
//! - Image generation
//! - Current date and time
//! - Sub-agent delegation (supervisor mode)

mod delegate;
mod image;
mod time;
mod web;

use crate::error::Result;
use crate::tool::ToolRegistry;

// Web tools
pub use web::{SearchProvider, SearchResult, WebSearchConfig, WebSearchTool};

// Image tool
pub use image::{ImageGenConfig, ImageGenTool, estimate_image_tokens};

// Time tool
pub use time::CurrentTimeTool;

// Delegate tool
pub use delegate::{ChildModelSpec, DEFAULT_MAX_DEPTH, DelegateTool, SubAgent};

/// Registry of the always-available built-in tools.
///
/// Image generation is only registered when it has credentials.
pub fn builtin_registry(web: WebSearchConfig, image: Option<ImageGenConfig>) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(WebSearchTool::with_config(web)?);
    if let Some(image) = image {
        registry.register(ImageGenTool::new(image)?);
    }
    registry.register(CurrentTimeTool::new());
    Ok(registry)
}

//! Configuration system for the Colloquy conversation engine.
//!
//! Provides TOML-based configuration with:
//! - A default LLM section (`[llm]`) plus a dedicated summarizer model (`[memory]`)
//! - Tool selection and remote-tool execution limits (`[tools]`)
//! - Remote MCP tool servers (`[[mcp.servers]]`)
//! - Orchestration loop limits (`[orchestration]`) and cache TTLs (`[cache]`)
//! - Config file layering (user config dir + project-local overrides)
//! - API key resolution (config file → environment variable)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigLayer, ConfigSource, LoadedConfig, load_config, load_config_file,
    load_config_with_options, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;

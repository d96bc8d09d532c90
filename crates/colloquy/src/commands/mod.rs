//! CLI command handlers.

use colloquy_config::LoadedConfig;

pub mod ask;
pub mod config;
pub mod tools;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Resolved configuration and where it came from.
    pub loaded: LoadedConfig,
}

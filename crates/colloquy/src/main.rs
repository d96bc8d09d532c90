//! Colloquy - streaming conversation engine with tools and rolling memory
//!
//! Main entry point for the Colloquy CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod runtime;
mod terminal;

use commands::{ask, config, tools};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Colloquy - streaming conversation engine with tools and rolling memory
#[derive(Parser)]
#[command(name = "colloquy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Directory searched for a project colloquy.toml (default: current directory)
    #[arg(long, global = true, env = "COLLOQUY_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a one-shot question and stream the answer
    Ask(ask::AskArgs),

    /// Show which tools would be bound for a query
    Tools(tools::ToolsArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = colloquy_config::load_config(cli.project_dir.as_deref())?;
    let logging = loaded.config.logging.clone().unwrap_or_default();

    // Console (human-readable) plus rotating JSON file
    let console_filter = match (&logging.level, cli.verbose) {
        (_, true) => {
            "colloquy=debug,colloquy_agent=debug,colloquy_llm=debug,colloquy_mcp=debug,colloquy_config=debug,info"
                .to_string()
        }
        (Some(level), false) => level.clone(),
        (None, false) => "colloquy=info,colloquy_agent=warn,colloquy_llm=warn,colloquy_mcp=warn,warn".to_string(),
    };

    let log_dir = dirs::data_dir()
        .map(|d| d.join("colloquy").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let (file_writer, _guard) = if logging.file {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "colloquy.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (Some(non_blocking), Some(guard))
    } else {
        (None, None)
    };

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(console_filter)),
        )
        .with(file_writer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "colloquy=trace,colloquy_agent=trace,colloquy_llm=trace,colloquy_mcp=trace,colloquy_cache=debug,colloquy_config=trace,info",
                ))
        }))
        .init();

    for warning in &loaded.warnings {
        tracing::warn!(warning = %warning, "Config warning");
    }

    // Create context for commands
    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        loaded,
    };

    // Dispatch to command handlers
    match cli.command {
        Commands::Ask(args) => ask::run(args, &ctx).await,
        Commands::Tools(args) => tools::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}

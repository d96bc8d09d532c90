//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use console::Style;
use serde_json::json;

use colloquy_config::{Backend, ColloquyConfig};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./colloquy.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show configuration file path
    Path,

    /// Check the resolved configuration for errors
    Validate,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Init { local } => cmd_init(local),
        ConfigCommand::Path => cmd_path(),
        ConfigCommand::Validate => cmd_validate(ctx),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.loaded;
    let config = &loaded.config;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "sources": loaded.loaded_from(),
                "warnings": loaded.warnings,
                "config": config,
            }))?
        );
        return Ok(());
    }

    let dim = Style::new().dim();
    println!("# Colloquy Configuration\n");

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &sources {
            println!("  {}", source.display());
        }
        println!();
    }

    let llm = config.llm_or_default();
    let backend = llm.backend;
    println!("Chat model:");
    println!(
        "  {} / {}  {}",
        backend.map_or("auto", |b| b.id()),
        llm.model.as_deref().unwrap_or("(default)"),
        dim.apply_to(key_status_for(backend, llm.api_key.is_some()))
    );
    println!();

    let servers = config.enabled_mcp_servers();
    if !servers.is_empty() {
        println!("Remote tool servers:");
        for server in servers {
            println!("  {:<12} {}", server.name, server.url);
        }
        println!();
    }

    if !loaded.warnings.is_empty() {
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  ⚠ {}", w);
        }
        println!();
    }

    if ctx.verbose {
        println!("---\nRaw config:\n");
        println!("{}", config.to_toml()?);
    }

    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    println!("Config file search order (later overrides earlier):\n");

    for source in &ctx.loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {:<8} {}", status, source.layer, source.path.display());
    }

    println!();
    println!("API keys: config file, then the backend's environment variable.");
    Ok(())
}

const TEMPLATE: &str = r#"# Colloquy Configuration

# Chat model
[llm]
backend = "anthropic"
model = "claude-sonnet-4-20250514"
# base_url = "http://localhost:11434/v1"

# Rolling memory
[memory]
token_limit = 10000
# summary_model = "claude-3-5-haiku-20241022"

# Tool selection and remote tool retries
[tools]
max_tools = 10
remote_timeout_secs = 300
remote_max_attempts = 3

[tools.web]
provider = "duckduckgo"

# Agent loop
[orchestration]
max_iterations = 10
turn_timeout_secs = 300
# persona = "You are a concise assistant."

# Remote tool servers (uncomment to use)
# [[mcp.servers]]
# name = "slack"
# url = "https://mcp.example.com/slack"
# headers = [["Authorization", "Bearer ..."]]
"#;

fn cmd_init(local: bool) -> Result<()> {
    let path = if local {
        PathBuf::from("colloquy.toml")
    } else {
        let path = colloquy_config::user_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        path
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }

    std::fs::write(&path, TEMPLATE)?;
    println!("Created {}", path.display());
    Ok(())
}

fn cmd_path() -> Result<()> {
    match colloquy_config::user_config_path() {
        Some(path) => println!("{}", path.display()),
        None => eprintln!("Could not determine config directory"),
    }
    Ok(())
}

fn cmd_validate(ctx: &Context) -> Result<()> {
    let config: &ColloquyConfig = &ctx.loaded.config;
    config.validate()?;
    config.llm_or_default().resolve_api_key()?;

    let green = Style::new().green();
    println!("{} Configuration is valid", green.apply_to("✓"));
    Ok(())
}

fn key_status_for(backend: Option<Backend>, in_config: bool) -> &'static str {
    if in_config {
        return "(config key)";
    }
    match backend {
        Some(backend) if !backend.requires_api_key() => "(no key needed)",
        Some(backend) if std::env::var(backend.env_var()).is_ok() => "(env var ✓)",
        Some(_) => "(no key)",
        None => "(key resolved from model)",
    }
}

//! Ask command - one-shot question to the engine.

use std::sync::Arc;

use anyhow::Result;
use clap::{Args, ValueEnum};
use console::Style;
use serde_json::json;

use colloquy_agent::{ConversationId, DuplexChannel, ToolEligibility, UserQuery};

use super::Context;
use crate::runtime::{self, ModelOverrides};
use crate::terminal::TerminalChannel;

/// Tool binding override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ToolsMode {
    /// Decide from the question
    Auto,
    /// Always bind tools
    Always,
    /// Never bind tools
    Never,
}

impl From<ToolsMode> for ToolEligibility {
    fn from(mode: ToolsMode) -> Self {
        match mode {
            ToolsMode::Auto => ToolEligibility::Auto,
            ToolsMode::Always => ToolEligibility::Always,
            ToolsMode::Never => ToolEligibility::Never,
        }
    }
}

/// Arguments for the ask command.
#[derive(Args, Debug)]
pub struct AskArgs {
    /// The question or prompt to send
    #[arg(required = true)]
    pub prompt: String,

    /// Conversation id (a new one is generated when absent)
    #[arg(short, long)]
    pub conversation: Option<String>,

    /// Backend override (anthropic, openai, groq, ollama)
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Model override
    #[arg(short, long)]
    pub model: Option<String>,

    /// Tool binding
    #[arg(long, value_enum, default_value_t = ToolsMode::Auto)]
    pub tools: ToolsMode,

    /// Image URL to attach (repeatable)
    #[arg(long = "image")]
    pub images: Vec<String>,
}

/// Run the ask command.
pub async fn run(args: AskArgs, ctx: &Context) -> Result<()> {
    let overrides = ModelOverrides {
        backend: args.backend.clone(),
        model: args.model.clone(),
    };
    let runtime = runtime::build(&ctx.loaded.config, &overrides).await?;
    let dim = Style::new().dim();

    let conversation_id = args
        .conversation
        .as_deref()
        .map(ConversationId::from)
        .unwrap_or_default();

    if ctx.verbose && !ctx.json_output {
        eprintln!("{}", dim.apply_to(format!("Model: {}", runtime.provider.model)));
        eprintln!("{}", dim.apply_to(format!("Conversation: {}", conversation_id)));
        eprintln!();
    }

    let mut query = UserQuery::text(&args.prompt).with_tools(args.tools.into());
    for url in &args.images {
        query = query.with_image_url(url);
    }

    let channel = Arc::new(TerminalChannel::new(ctx.json_output));
    let turn = runtime.engine.handle_user_turn(
        &conversation_id,
        query,
        &runtime.provider,
        Arc::clone(&channel) as Arc<dyn DuplexChannel>,
    );
    tokio::pin!(turn);

    // Ctrl-C stops generation; the partial answer is still recorded
    let result = tokio::select! {
        result = &mut turn => result,
        _ = tokio::signal::ctrl_c() => {
            channel.force_stop(conversation_id.as_str());
            turn.await
        }
    };
    let outcome = result?;

    if ctx.json_output {
        println!(
            "{}",
            json!({
                "conversation_id": conversation_id,
                "text": outcome.text(),
                "stopped": outcome.stopped(),
                "iterations": outcome.iterations,
                "tools": outcome.tools,
                "usage": outcome.usage,
            })
        );
    } else if ctx.verbose {
        eprintln!();
        eprintln!(
            "{}",
            dim.apply_to(format!(
                "Tokens: {} prompt / {} completion / {} total, cost ${:.4}, {} iteration(s)",
                outcome.usage.prompt_tokens,
                outcome.usage.completion_tokens,
                outcome.usage.total_tokens,
                outcome.usage.cost,
                outcome.iterations,
            ))
        );
    }

    Ok(())
}

//! Tools command - preview tool selection for a query.

use anyhow::Result;
use clap::Args;
use console::Style;
use serde_json::json;

use colloquy_agent::{SelectionPath, classify_tool_eligibility};

use super::Context;
use crate::runtime;

/// Arguments for the tools command.
#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// Query to select tools for
    #[arg(required = true)]
    pub query: String,
}

/// Run the tools command.
pub async fn run(args: ToolsArgs, ctx: &Context) -> Result<()> {
    let engine = runtime::build_engine(&ctx.loaded.config).await?;
    let eligible = classify_tool_eligibility(&args.query);
    let selection = engine.preview_tools(&args.query).await;

    let path = match &selection.path {
        SelectionPath::DomainSpecific { domain, confidence } => {
            format!("domain '{}' ({:?} confidence)", domain, confidence)
        }
        SelectionPath::General { domains } if domains.is_empty() => "general".to_string(),
        SelectionPath::General { domains } => format!("general ({})", domains.join(", ")),
    };

    if ctx.json_output {
        let tools: Vec<_> = selection
            .tools
            .tools()
            .iter()
            .map(|t| json!({ "name": t.name(), "description": t.description() }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "query": args.query,
                "eligible": eligible,
                "path": path,
                "tools": tools,
            }))?
        );
        return Ok(());
    }

    let bold = Style::new().bold();
    let dim = Style::new().dim();

    println!("{}", bold.apply_to("Tool Selection"));
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  Eligible: {}", if eligible { "yes" } else { "no (tools not bound by default)" });
    println!("  Path:     {}", path);
    println!();

    if selection.tools.is_empty() {
        println!("{}", dim.apply_to("  No tools available"));
        return Ok(());
    }

    for (i, tool) in selection.tools.tools().iter().enumerate() {
        println!("  {:>2}. {}", i + 1, tool.name());
        if ctx.verbose {
            println!("      {}", dim.apply_to(tool.description()));
        }
    }

    Ok(())
}

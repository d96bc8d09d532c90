//! Orchestration graph: the agent/tools loop.
//!
//! ```text
//!          ┌──────────────────────────────┐
//!          ▼                              │
//!   ┌─────────────┐  tool calls   ┌──────────────┐
//!   │    agent    │──────────────▶│    tools     │
//!   └─────────────┘               └──────────────┘
//!          │ no tool calls
//!          ▼
//!         end
//! ```
//!
//! The `agent` node streams one model completion. If it requested tools, the
//! `tools` node executes them in order, appends the results, and control
//! returns to `agent`. A supervisor is the same graph with a `delegate` tool
//! whose executor runs a child graph.

use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;

use colloquy_llm::{InvocableModel, Message, StreamAccumulator, SystemPrompt, ToolResultBlock};

use crate::error::{AgentError, Result};
use crate::executor::ToolExecutor;
use crate::tool::{ToolContext, ToolRegistry};
use crate::types::{Citation, ToolCall, ToolResultRecord};

/// Default cap on agent iterations per run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Incremental output of a graph run, in generation order.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// A piece of assistant text.
    Token(String),
    /// A tool call is about to run.
    ToolStart(ToolCall),
    /// A tool call finished.
    ToolEnd(ToolResultRecord),
    /// The agent produced its final answer.
    Done {
        /// All assistant text of the run.
        text: String,
        /// Agent iterations used.
        iterations: u32,
    },
}

/// Stream of graph events. Ends after `Done` or the first error.
pub type GraphStream = BoxStream<'static, Result<GraphEvent>>;

/// Collected result of a run driven to completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphRun {
    /// All assistant text.
    pub text: String,
    /// Agent iterations used.
    pub iterations: u32,
    /// Every tool result, in execution order.
    pub tool_results: Vec<ToolResultRecord>,
}

impl GraphRun {
    /// Citations from all tool results.
    pub fn citations(&self) -> Vec<Citation> {
        self.tool_results
            .iter()
            .flat_map(|r| r.citations.iter().cloned())
            .collect()
    }
}

/// One configured agent/tools loop.
#[derive(Clone)]
pub struct OrchestrationGraph {
    model: InvocableModel,
    tools: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    max_iterations: u32,
}

impl std::fmt::Debug for OrchestrationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationGraph")
            .field("model", &self.model.model())
            .field("tools", &self.tools.names())
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

impl OrchestrationGraph {
    /// Create a graph over a model and the tools bound to it.
    pub fn new(model: InvocableModel, tools: Arc<ToolRegistry>, executor: Arc<ToolExecutor>) -> Self {
        Self {
            model,
            tools,
            executor,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Cap agent iterations.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    /// Model the agent node invokes.
    pub fn model(&self) -> &InvocableModel {
        &self.model
    }

    /// Tools the tools node can execute.
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Run the loop, streaming events.
    ///
    /// Exceeding the iteration cap is an error: [`AgentError::MaxIterations`].
    pub fn run(&self, messages: Vec<Message>, system: Option<SystemPrompt>, ctx: ToolContext) -> GraphStream {
        let graph = self.clone();

        Box::pin(async_stream::stream! {
            let mut messages = messages;
            let mut text = String::new();

            for iteration in 1..=graph.max_iterations {
                if ctx.is_cancelled() {
                    yield Err(AgentError::Cancelled);
                    return;
                }

                tracing::debug!(
                    conversation_id = %ctx.conversation_id,
                    iteration,
                    depth = ctx.depth,
                    messages = messages.len(),
                    "Agent: invoking model"
                );

                // agent node
                let mut llm_stream = match graph.model.stream(messages.clone(), system.clone()).await {
                    Ok(s) => s,
                    Err(e) => {
                        yield Err(e.into());
                        return;
                    }
                };

                let mut accumulator = StreamAccumulator::new();
                let mut iteration_text = false;
                while let Some(event) = llm_stream.next().await {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            yield Err(e.into());
                            return;
                        }
                    };
                    if let Err(e) = accumulator.push(&event) {
                        yield Err(e.into());
                        return;
                    }
                    if let Some(delta) = event.text_delta().filter(|d| !d.is_empty()) {
                        if !iteration_text && !text.is_empty() {
                            text.push_str("\n\n");
                            yield Ok(GraphEvent::Token("\n\n".to_string()));
                        }
                        iteration_text = true;
                        text.push_str(delta);
                        yield Ok(GraphEvent::Token(delta.to_string()));
                    }
                }
                drop(llm_stream);

                let response = match accumulator.finish() {
                    Ok(response) => response,
                    Err(e) => {
                        yield Err(e.into());
                        return;
                    }
                };

                let calls: Vec<ToolCall> = response.tool_uses().into_iter().map(ToolCall::from).collect();
                if calls.is_empty() {
                    tracing::debug!(iteration, text_len = text.len(), "Agent: final response");
                    yield Ok(GraphEvent::Done { text, iterations: iteration });
                    return;
                }

                // tools node
                messages.push(Message::assistant_blocks(response.content.clone()));
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    yield Ok(GraphEvent::ToolStart(call.clone()));
                    let record = graph.executor.execute_call(&call, &graph.tools, &ctx).await;
                    results.push(if record.success {
                        ToolResultBlock::success(&record.tool_call_id, &record.content)
                    } else {
                        ToolResultBlock::error(&record.tool_call_id, &record.content)
                    });
                    yield Ok(GraphEvent::ToolEnd(record));
                }
                messages.push(Message::tool_results(results));
            }

            tracing::warn!(
                conversation_id = %ctx.conversation_id,
                max_iterations = graph.max_iterations,
                "Agent: iteration cap reached"
            );
            yield Err(AgentError::MaxIterations(graph.max_iterations));
        })
    }

    /// Run the loop and collect the result.
    pub async fn run_to_completion(
        &self,
        messages: Vec<Message>,
        system: Option<SystemPrompt>,
        ctx: ToolContext,
    ) -> Result<GraphRun> {
        let mut events = self.run(messages, system, ctx);
        let mut run = GraphRun::default();
        while let Some(event) = events.next().await {
            match event? {
                GraphEvent::Token(_) | GraphEvent::ToolStart(_) => {}
                GraphEvent::ToolEnd(record) => run.tool_results.push(record),
                GraphEvent::Done { text, iterations } => {
                    run.text = text;
                    run.iterations = iterations;
                    return Ok(run);
                }
            }
        }
        Err(AgentError::internal("graph ended without a final response"))
    }
}

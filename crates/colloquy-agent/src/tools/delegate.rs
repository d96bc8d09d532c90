//! Delegate tool for sub-agent invocation.
//!
//! A supervisor is an ordinary orchestration graph that has this tool bound.
//! Calling it runs a child graph for a named sub-agent with its own prompt
//! and a constrained tool set, and returns the child's final answer.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use colloquy_llm::{Credentials, Message, ModelOptions, ProviderFactory, SystemPrompt};

use crate::error::Result;
use crate::executor::ToolExecutor;
use crate::graph::{DEFAULT_MAX_ITERATIONS, OrchestrationGraph};
use crate::tool::{ParamExt, Tool, ToolContext, ToolRegistry, ToolResult, ToolSource};

/// Nesting depth past which delegation is refused.
pub const DEFAULT_MAX_DEPTH: u32 = 2;

/// A named sub-agent.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAgent {
    /// Name the supervisor refers to.
    pub name: String,
    /// What the agent is good at, shown to the supervisor.
    pub description: String,
    /// System prompt for the child graph.
    pub system_prompt: String,
    /// Names of pool tools the agent may use.
    pub tools: Vec<String>,
}

impl SubAgent {
    /// Create a sub-agent without tools.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
        }
    }

    /// Grant the agent access to pool tools by name.
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }
}

/// How child models are created.
#[derive(Clone)]
pub struct ChildModelSpec {
    /// Factory shared with the parent turn.
    pub factory: Arc<ProviderFactory>,
    /// Provider id, resolved from the model name when absent.
    pub provider: Option<String>,
    /// Model name.
    pub model: String,
    /// Credentials for the provider.
    pub credentials: Credentials,
}

/// Tool for delegating tasks to sub-agents.
///
/// # Example Usage
///
/// ```json
/// {
///   "agent": "researcher",
///   "task": "Find recent papers on retrieval augmentation",
///   "context": "The user is building a support bot"
/// }
/// ```
pub struct DelegateTool {
    agents: Vec<SubAgent>,
    spec: ChildModelSpec,
    pool: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    max_depth: u32,
    max_iterations: u32,
    description: String,
}

impl std::fmt::Debug for DelegateTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateTool")
            .field("agents", &self.agent_names())
            .field("model", &self.spec.model)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl DelegateTool {
    /// Create a delegate tool over a pool of tools sub-agents may draw from.
    pub fn new(spec: ChildModelSpec, pool: Arc<ToolRegistry>, executor: Arc<ToolExecutor>) -> Self {
        let mut tool = Self {
            agents: Vec::new(),
            spec,
            pool,
            executor,
            max_depth: DEFAULT_MAX_DEPTH,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            description: String::new(),
        };
        tool.refresh_description();
        tool
    }

    /// Register a sub-agent.
    pub fn with_agent(mut self, agent: SubAgent) -> Self {
        self.agents.retain(|a| a.name != agent.name);
        self.agents.push(agent);
        self.refresh_description();
        self
    }

    /// Override the nesting limit.
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    /// Override the child loop's iteration cap.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Names of registered sub-agents.
    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name.as_str()).collect()
    }

    fn refresh_description(&mut self) {
        let mut description = String::from(
            "Delegate a task to a specialized sub-agent and return its answer. \
             Sub-agents have their own instructions and a limited tool set.",
        );
        if !self.agents.is_empty() {
            description.push_str(" Available agents:");
            for agent in &self.agents {
                description.push_str(&format!("\n- {}: {}", agent.name, agent.description));
            }
        }
        self.description = description;
    }

    fn format_available_agents(&self) -> String {
        if self.agents.is_empty() {
            "none configured".to_string()
        } else {
            self.agent_names().join(", ")
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Name of the sub-agent to delegate to",
                    "enum": self.agent_names()
                },
                "task": {
                    "type": "string",
                    "description": "Task description for the sub-agent to execute"
                },
                "context": {
                    "type": "string",
                    "description": "Additional context from the current conversation"
                }
            },
            "required": ["agent", "task"]
        })
    }

    fn source(&self) -> ToolSource {
        ToolSource::Agent
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult> {
        if ctx.is_cancelled() {
            return Ok(ToolResult::error("Operation cancelled"));
        }

        let agent_name = params.required_str("agent", "Name one of the available agents")?;
        let task = params.required_str("task", "Describe what the agent should do")?;
        let context = params.optional_str("context");

        let Some(agent) = self.agents.iter().find(|a| a.name == agent_name) else {
            return Ok(ToolResult::error(format!(
                "Unknown agent '{}'. Available agents: {}",
                agent_name,
                self.format_available_agents()
            )));
        };

        if ctx.depth >= self.max_depth {
            return Ok(ToolResult::error(format!(
                "Delegation depth limit ({}) reached; answer directly instead",
                self.max_depth
            )));
        }

        let names: Vec<&str> = agent.tools.iter().map(String::as_str).collect();
        let tools = self.pool.filtered_by_names(&names);

        let mut options = ModelOptions::new();
        if !tools.is_empty() {
            options = options.with_tools(tools.to_llm_definitions());
        }
        if let Some(usage) = ctx.usage() {
            options = options.with_usage(Arc::clone(usage));
        }
        let model = self
            .spec
            .factory
            .create_model(
                self.spec.provider.as_deref(),
                &self.spec.model,
                &self.spec.credentials,
                options,
            )
            .await?;

        tracing::info!(
            agent = %agent.name,
            depth = ctx.depth + 1,
            tools = tools.len(),
            "Delegating to sub-agent"
        );
        ctx.progress(format!("Asking the {} agent", agent.name));

        let prompt = match context {
            Some(context) if !context.trim().is_empty() => {
                format!("{}\n\nContext:\n{}", task, context)
            }
            _ => task.to_string(),
        };

        let graph = OrchestrationGraph::new(model, Arc::new(tools), Arc::clone(&self.executor))
            .with_max_iterations(self.max_iterations);
        let run = graph
            .run_to_completion(
                vec![Message::user(prompt)],
                Some(SystemPrompt::text(agent.system_prompt.clone())),
                ctx.child(),
            )
            .await;

        match run {
            Ok(run) => {
                tracing::debug!(agent = %agent.name, iterations = run.iterations, "Sub-agent finished");
                let citations = run.citations();
                Ok(ToolResult::text(run.text).with_citations(citations))
            }
            Err(e) if e.is_permanent() => Err(e),
            Err(e) => Ok(ToolResult::error(format!("Agent '{}' failed: {}", agent.name, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::MockTool;
    use colloquy_cache::CacheConfig;
    use colloquy_llm::{FixedBackendBuilder, MockBackend, MockResponse, UsageAccumulator};

    fn spec(backend: Arc<MockBackend>) -> ChildModelSpec {
        ChildModelSpec {
            factory: Arc::new(ProviderFactory::with_builder(
                Arc::new(FixedBackendBuilder::new(backend)),
                CacheConfig::default(),
            )),
            provider: Some("anthropic".into()),
            model: "claude-sonnet".into(),
            credentials: Credentials::api_key("k"),
        }
    }

    fn pool() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool::new("lookup").with_response(ToolResult::text("42")));
        registry.register(MockTool::new("unrelated"));
        Arc::new(registry)
    }

    fn researcher() -> SubAgent {
        SubAgent::new("researcher", "Finds facts", "You research things.").with_tools(["lookup"])
    }

    #[test]
    fn test_description_lists_agents() {
        let backend = Arc::new(MockBackend::new(vec![]));
        let tool = DelegateTool::new(spec(backend), pool(), Arc::new(ToolExecutor::new()))
            .with_agent(researcher());
        assert!(tool.description().contains("- researcher: Finds facts"));
        assert_eq!(tool.parameters()["properties"]["agent"]["enum"], json!(["researcher"]));
        assert_eq!(tool.source(), ToolSource::Agent);
    }

    #[tokio::test]
    async fn test_child_graph_runs_with_constrained_tools() {
        let backend = Arc::new(MockBackend::scripted(vec![
            MockResponse::Success(MockBackend::tool_call_response("c1", "lookup", json!({}))),
            MockResponse::Success(MockBackend::text_response("The answer is 42.")),
        ]));
        let tool = DelegateTool::new(spec(Arc::clone(&backend)), pool(), Arc::new(ToolExecutor::new()))
            .with_agent(researcher());
        let usage = UsageAccumulator::shared();
        let ctx = ToolContext::default().with_usage(Arc::clone(&usage));

        let result = tool
            .execute(json!({"agent": "researcher", "task": "What is the answer?"}), &ctx)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.to_llm_content(), "The answer is 42.");
        assert_eq!(usage.invocations(), 2);

        let requests = backend.requests();
        let bound: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(bound, vec!["lookup"]);
        assert_eq!(requests[0].system.as_ref().unwrap().to_text(), "You research things.");
    }

    #[tokio::test]
    async fn test_unknown_agent_lists_available() {
        let backend = Arc::new(MockBackend::new(vec![]));
        let tool = DelegateTool::new(spec(backend), pool(), Arc::new(ToolExecutor::new()))
            .with_agent(researcher());
        let result = tool
            .execute(json!({"agent": "writer", "task": "x"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.to_llm_content().contains("Available agents: researcher"));
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let backend = Arc::new(MockBackend::new(vec![]));
        let tool = DelegateTool::new(spec(Arc::clone(&backend)), pool(), Arc::new(ToolExecutor::new()))
            .with_agent(researcher())
            .with_max_depth(1);
        let ctx = ToolContext::default().child();

        let result = tool
            .execute(json!({"agent": "researcher", "task": "x"}), &ctx)
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.to_llm_content().contains("depth limit"));
        assert_eq!(backend.request_count(), 0);
    }
}

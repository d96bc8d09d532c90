//! Tool selection and execution through the engine.

mod common;

use anyhow::Result;
use serde_json::json;

use colloquy_agent::{
    CurrentTimeTool, SubAgent, ToolEligibility, ToolRegistry, UserQuery, events,
};
use colloquy_llm::{MockBackend, MockResponse};

use common::{TestCatalog, TestEngine, fast_executor, github_catalog, remote_tools, slack_catalog};

fn time_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(CurrentTimeTool::new());
    tools
}

fn bound_tools(t: &TestEngine, request: usize) -> Vec<String> {
    t.backend.requests()[request]
        .tools
        .iter()
        .map(|d| d.name.clone())
        .collect()
}

#[tokio::test]
async fn test_date_question_runs_time_tool_once() -> Result<()> {
    let backend = MockBackend::scripted(vec![
        MockResponse::Success(MockBackend::tool_call_response("call_1", "get_current_time", json!({}))),
        MockResponse::Success(MockBackend::text_response("Today is the date reported by the clock.")),
    ]);
    let t = TestEngine::start_with(backend, Default::default(), |b| b.with_tools(time_tools()));

    let query = UserQuery::text("What's today's date?").with_tools(ToolEligibility::Always);
    let outcome = t.turn("conv-b", query).await?;

    assert_eq!(outcome.text(), "Today is the date reported by the clock.");
    assert_eq!(outcome.iterations, 2);
    assert_eq!(bound_tools(&t, 0), vec!["get_current_time"]);

    let names = t.channel.event_names();
    let position = |event: &str| names.iter().position(|n| n == event).unwrap();
    assert_eq!(names.iter().filter(|n| *n == events::TOOL_START).count(), 1);
    assert_eq!(names.iter().filter(|n| *n == events::TOOL_END).count(), 1);
    assert!(position(events::TOOL_START) < position(events::TOOL_END));
    assert!(position(events::TOOL_END) < position(events::LLM_RESPONSE_DONE));

    let end = &t.channel.emitted_named(events::TOOL_END)[0];
    assert_eq!(end["success"], true);
    let stamp = end["content"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());

    assert_eq!(outcome.turn.tool_calls.len(), 1);
    assert_eq!(outcome.turn.tool_calls[0].name, "get_current_time");
    Ok(())
}

#[tokio::test]
async fn test_unknown_tool_call_does_not_fail_turn() -> Result<()> {
    let backend = MockBackend::scripted(vec![
        MockResponse::Success(MockBackend::tool_call_response("call_1", "send_fax", json!({"to": "123"}))),
        MockResponse::Success(MockBackend::text_response("I can't send faxes.")),
    ]);
    let t = TestEngine::start_with(backend, Default::default(), |b| b.with_tools(time_tools()));

    let query = UserQuery::text("Fax this to my lawyer").with_tools(ToolEligibility::Always);
    let outcome = t.turn("conv-p4", query).await?;

    assert_eq!(outcome.text(), "I can't send faxes.");
    let end = &t.channel.emitted_named(events::TOOL_END)[0];
    assert_eq!(end["success"], false);
    let content = end["content"].as_str().unwrap();
    assert!(content.contains("send_fax"));
    assert!(content.contains("get_current_time"));
    assert!(t.channel.emitted_named(events::CONVERSATION_ERROR).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_slack_request_binds_only_slack_tools() -> Result<()> {
    let t = TestEngine::start_with(
        MockBackend::with_text("Which message should I send?"),
        Default::default(),
        |b| {
            b.with_tools(time_tools())
                .with_remote_tools(remote_tools(vec![slack_catalog(), github_catalog()]))
        },
    );

    let outcome = t.turn("conv-d", UserQuery::text("send a slack message to #general")).await?;

    assert!(!outcome.tools.is_empty());
    assert!(outcome.tools.iter().all(|name| name.contains("slack")));
    assert_eq!(outcome.tools[0], "send_slack_message");
    assert!(outcome.tools[..2].contains(&"list_slack_channels".to_string()));
    assert_eq!(bound_tools(&t, 0), outcome.tools);
    Ok(())
}

#[tokio::test]
async fn test_failing_remote_tool_exhausts_retries() -> Result<()> {
    let github = TestCatalog::failing("github", vec!["create_github_issue", "list_github_pull_requests"]);
    let backend = MockBackend::scripted(vec![
        MockResponse::Success(MockBackend::tool_call_response(
            "call_1",
            "create_github_issue",
            json!({"title": "Login fails"}),
        )),
        MockResponse::Success(MockBackend::text_response("GitHub is unreachable right now.")),
    ]);
    let t = TestEngine::start_with(backend, Default::default(), |b| {
        b.with_remote_tools(remote_tools(vec![github.clone()]))
            .with_executor(fast_executor(3))
    });

    let query = UserQuery::text("create a github issue for the login bug");
    let outcome = t.turn("conv-p5", query).await?;

    assert_eq!(github.calls(), 3);
    assert_eq!(outcome.text(), "GitHub is unreachable right now.");

    let ends = t.channel.emitted_named(events::TOOL_END);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0]["success"], false);
    assert!(ends[0]["content"].as_str().unwrap().contains("failed after 3 attempts"));
    Ok(())
}

#[tokio::test]
async fn test_supervisor_delegates_to_subagent() -> Result<()> {
    let backend = MockBackend::scripted(vec![
        // Supervisor
        MockResponse::Success(MockBackend::tool_call_response(
            "call_1",
            "delegate",
            json!({"agent": "timekeeper", "task": "What time is it?"}),
        )),
        // Sub-agent
        MockResponse::Success(MockBackend::tool_call_response("call_2", "get_current_time", json!({}))),
        MockResponse::Success(MockBackend::text_response("It is noon.")),
        // Supervisor again
        MockResponse::Success(MockBackend::text_response("The timekeeper says it is noon.")),
    ]);
    let t = TestEngine::start_with(backend, Default::default(), |b| {
        b.with_tools(time_tools()).with_subagent(
            SubAgent::new("timekeeper", "Knows the time", "You report the time.")
                .with_tools(["get_current_time"]),
        )
    });

    let query = UserQuery::text("Ask the timekeeper").with_tools(ToolEligibility::Always);
    let outcome = t.turn("conv-sup", query).await?;

    assert_eq!(outcome.text(), "The timekeeper says it is noon.");
    assert_eq!(t.backend.request_count(), 4);
    assert!(bound_tools(&t, 0).contains(&"delegate".to_string()));
    assert_eq!(bound_tools(&t, 1), vec!["get_current_time"]);

    // Only the supervisor's tool calls reach the client
    let starts = t.channel.emitted_named(events::TOOL_START);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0]["tool"], "delegate");
    let end = &t.channel.emitted_named(events::TOOL_END)[0];
    assert_eq!(end["content"], "It is noon.");

    // Child invocations are billed to the turn
    assert_eq!(outcome.usage.total_tokens, 2 * 20 + 2 * 30);
    Ok(())
}

//! Async MCP client over HTTP.
//!
//! Each JSON-RPC message is POSTed to the server endpoint. The handshake
//! (`initialize` followed by `notifications/initialized`) runs lazily on the
//! first call that needs it and is shared by every later caller.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OnceCell;
use url::Url;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, ToolInfo,
};

/// Header carrying the server-assigned session.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on tools/list pages, in case a server keeps returning cursors.
const MAX_LIST_PAGES: usize = 32;

/// Configuration for one remote MCP server.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Unique name for this server.
    pub name: String,
    /// Endpoint URL.
    pub url: String,
    /// Extra headers sent with every request (e.g. Authorization).
    pub headers: Vec<(String, String)>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl McpServerConfig {
    /// Create a config for the given endpoint.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add several headers.
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Client for a single MCP server.
pub struct McpClient {
    config: McpServerConfig,
    endpoint: Url,
    http: reqwest::Client,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
    init: OnceCell<InitializeResult>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.config.name)
            .field("endpoint", &self.endpoint.as_str())
            .field("initialized", &self.init.initialized())
            .finish()
    }
}

impl McpClient {
    /// Build a client. No network traffic happens until the first call.
    pub fn new(config: McpServerConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.url)
            .map_err(|e| McpError::transport(format!("invalid URL '{}': {}", config.url, e)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(McpError::transport(format!(
                "unsupported URL scheme '{}'",
                endpoint.scheme()
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| McpError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            endpoint,
            http,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
            init: OnceCell::new(),
        })
    }

    /// Server name from the config.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The client configuration.
    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    /// Whether the handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    /// Server info, once initialized.
    pub fn server_info(&self) -> Option<&Implementation> {
        self.init.get().map(|r| &r.server_info)
    }

    /// Run the handshake if it has not run yet.
    pub async fn initialize(&self) -> Result<&InitializeResult> {
        self.init.get_or_try_init(|| self.handshake()).await
    }

    async fn handshake(&self) -> Result<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self.send_request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        tracing::info!(
            server = %self.config.name,
            remote = %init.server_info.name,
            version = %init.server_info.version,
            protocol = %init.protocol_version,
            tools = init.capabilities.has_tools(),
            "MCP server initialized"
        );

        // Some servers answer the notification with an error status; the
        // session is usable regardless.
        if let Err(e) = self
            .send_notification("notifications/initialized", None)
            .await
        {
            tracing::warn!(server = %self.config.name, error = %e, "initialized notification rejected");
        }

        Ok(init)
    }

    /// List every tool the server exposes, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        self.initialize().await?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result = self.send_request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(result)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!(
            server = %self.config.name,
            tool_count = tools.len(),
            "listed MCP tools"
        );

        Ok(tools)
    }

    /// Call a tool on the server.
    ///
    /// A tool that reports `isError` still yields `Ok`; the flag travels with
    /// the result.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.initialize().await?;

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .send_request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        let call_result: CallToolResult = serde_json::from_value(result)?;

        if call_result.is_error() {
            tracing::warn!(server = %self.config.name, tool = %name, "tool call returned error");
        } else {
            tracing::debug!(server = %self.config.name, tool = %name, "tool call succeeded");
        }

        Ok(call_result)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wire
    // ─────────────────────────────────────────────────────────────────────────

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::call(id, method, params);
        let body = serde_json::to_value(&request)?;

        tracing::trace!(server = %self.config.name, id, method, "sending MCP request");

        let response = self.post(&body).await?;
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let text = response.text().await?;

        let rpc = if is_sse {
            response_from_event_stream(&text, id)?
        } else {
            let rpc: JsonRpcResponse = serde_json::from_str(&text)?;
            if !rpc.answers(id) {
                return Err(McpError::protocol(format!(
                    "response id {:?} does not match request id {}",
                    rpc.id, id
                )));
            }
            rpc
        };

        rpc.into_result()
            .map_err(|e| McpError::server_error(e.code, e.message, e.data))
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let body = serde_json::to_value(JsonRpcRequest::notification(method, params))?;
        self.post(&body).await?;
        Ok(())
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);

        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.set_session(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = McpError::from_status(status.as_u16(), truncate(&body, 512));
            if err.is_auth() {
                tracing::warn!(server = %self.config.name, status = status.as_u16(), "MCP server rejected credentials");
            }
            return Err(err);
        }

        Ok(response)
    }

    fn session(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_session(&self, session: String) {
        *self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
    }
}

/// Pick the response frame for `id` out of an event-stream body.
///
/// Servers may interleave notifications ahead of the response; frames that
/// do not parse as a response for this id are skipped.
fn response_from_event_stream(body: &str, id: u64) -> Result<JsonRpcResponse> {
    let mut data = String::new();
    let mut frames = Vec::new();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !data.is_empty() {
                frames.push(std::mem::take(&mut data));
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if !data.is_empty() {
        frames.push(data);
    }

    frames
        .iter()
        .filter_map(|frame| serde_json::from_str::<JsonRpcResponse>(frame).ok())
        .find(|rpc| rpc.answers(id))
        .ok_or_else(|| McpError::protocol(format!("no response for request {} in event stream", id)))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn init_body(id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock", "version": "0.1.0"}
            }
        })
    }

    async fn mount_handshake(server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "session-1")
                    .set_body_json(init_body(1)),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(server)
            .await;
    }

    #[test]
    fn test_server_config_builder() {
        let config = McpServerConfig::new("remote", "https://mcp.example.com/api")
            .with_header("Authorization", "Bearer token123")
            .with_timeout(Duration::from_secs(60));

        assert_eq!(config.name, "remote");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(
            config.headers,
            vec![("Authorization".to_string(), "Bearer token123".to_string())]
        );
    }

    #[test]
    fn test_new_rejects_bad_urls() {
        assert!(McpClient::new(McpServerConfig::new("x", "not a url")).is_err());
        assert!(McpClient::new(McpServerConfig::new("x", "ftp://host/mcp")).is_err());

        let client = McpClient::new(McpServerConfig::new("x", "http://localhost:8080/mcp")).unwrap();
        assert!(!client.is_initialized());
        assert!(client.server_info().is_none());
    }

    #[test]
    fn test_event_stream_picks_matching_frame() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\
                    \n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\
                    \n";
        let rpc = response_from_event_stream(body, 7).unwrap();
        assert_eq!(rpc.result.unwrap()["ok"], true);

        assert!(matches!(
            response_from_event_stream(body, 8),
            Err(McpError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_lazy_handshake_and_list_tools() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .and(header(SESSION_HEADER, "session-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {"tools": [
                    {"name": "send_slack_message", "description": "Send a message"},
                    {"name": "list_slack_channels"}
                ]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = McpClient::new(McpServerConfig::new("slack", server.uri())).unwrap();
        let tools = client.list_tools().await.unwrap();

        assert!(client.is_initialized());
        assert_eq!(client.server_info().unwrap().name, "mock");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "send_slack_message");
    }

    #[tokio::test]
    async fn test_call_tool_over_event_stream() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        let sse = "event: message\n\
                   data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"sent\"}]}}\n\n";
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "tools/call",
                "params": {"name": "send_slack_message"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let client = McpClient::new(McpServerConfig::new("slack", server.uri())).unwrap();
        let result = client
            .call_tool("send_slack_message", Some(json!({"channel": "#general"})))
            .await
            .unwrap();

        assert!(!result.is_error());
        assert_eq!(result.text(), "sent");
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
            .mount(&server)
            .await;

        let client = McpClient::new(
            McpServerConfig::new("github", server.uri()).with_header("Authorization", "Bearer stale"),
        )
        .unwrap();
        let err = client.list_tools().await.unwrap_err();

        assert!(err.is_auth());
        assert!(!err.is_retryable());
        assert!(!client.is_initialized());
    }

    #[tokio::test]
    async fn test_server_error_surfaces() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "error": {"code": -32602, "message": "Unknown tool: nope"}
            })))
            .mount(&server)
            .await;

        let client = McpClient::new(McpServerConfig::new("s", server.uri())).unwrap();
        let err = client.call_tool("nope", None).await.unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32602, .. }));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}

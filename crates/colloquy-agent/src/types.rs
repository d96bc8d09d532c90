//! Core types for the agent crate.
//!
//! - [`ConversationId`], [`TurnId`]: identifiers
//! - [`Checkpoint`]: content-derived memory epoch marker
//! - [`TurnRecord`]: one persisted exchange
//! - [`UserQuery`]: what the client sent for a turn

use chrono::{DateTime, Utc};
use colloquy_llm::{ImageSource, UsageRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// ID Types
// ─────────────────────────────────────────────────────────────────────────────

/// Identifier of a conversation. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Create a new random conversation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a persisted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(Uuid);

impl TurnId {
    /// Create a new random turn ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Checkpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Fingerprint of one rolling-summary state.
///
/// The first epoch of a conversation is keyed by a hash of the conversation
/// id; every later epoch by a hash of the epoch it replaced and the summary
/// text that opened it, so a repeated summary still opens a fresh epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(String);

impl Checkpoint {
    /// Checkpoint of a conversation that has no summary yet.
    pub fn initial(conversation_id: &ConversationId) -> Self {
        Self(sha256_hex(&[conversation_id.as_str().as_bytes()]))
    }

    /// Checkpoint of the epoch that follows `previous`, opened by `summary`.
    pub fn from_summary(
        conversation_id: &ConversationId,
        previous: &Checkpoint,
        summary: &str,
    ) -> Self {
        Self(sha256_hex(&[
            conversation_id.as_str().as_bytes(),
            b"\0",
            previous.as_str().as_bytes(),
            b"\0",
            summary.as_bytes(),
        ]))
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough for logs
        f.write_str(self.0.get(..12).unwrap_or(&self.0))
    }
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Call/Result Types
// ─────────────────────────────────────────────────────────────────────────────

/// A source reference produced by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Title of the source.
    pub title: String,
    /// Link to the source.
    pub url: String,
    /// Short excerpt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Citation {
    /// Create a citation.
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: None,
        }
    }

    /// Attach a snippet.
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call ID.
    pub id: String,
    /// Name of the tool being called.
    pub name: String,
    /// Arguments passed to the tool (JSON).
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Create a tool call.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

impl From<colloquy_llm::ToolUseBlock> for ToolCall {
    fn from(block: colloquy_llm::ToolUseBlock) -> Self {
        Self {
            id: block.id,
            name: block.name,
            arguments: block.input,
        }
    }
}

/// Outcome of one executed tool call, as fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    /// ID of the tool call this is a result for.
    pub tool_call_id: String,
    /// Name the model asked for.
    pub tool_name: String,
    /// Whether the tool execution succeeded.
    pub success: bool,
    /// Plain-text output.
    pub content: String,
    /// Sources the tool reported.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn Record
// ─────────────────────────────────────────────────────────────────────────────

/// One persisted exchange: the system/summary message active for the turn,
/// the user message and the assistant's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Unique identifier for this turn.
    pub id: TurnId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Memory epoch the turn was produced in.
    pub checkpoint: Checkpoint,
    /// Set once a later summary folded this turn's epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<Checkpoint>,
    /// Rolling summary active when the turn was produced (may be empty).
    pub system: String,
    /// User message text.
    pub user: String,
    /// Assistant response text.
    pub assistant: String,
    /// Responding model.
    pub model: String,
    /// Responding provider id.
    pub provider: String,
    /// Token usage and cost.
    #[serde(default)]
    pub usage: UsageRecord,
    /// Sources cited by tools during the turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    /// Tool calls made during the turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Whether the user stopped generation.
    #[serde(default)]
    pub stopped: bool,
    /// When the turn was persisted.
    pub created_at: DateTime<Utc>,
}

impl TurnRecord {
    /// Text of the exchange, as counted against the memory budget.
    pub fn exchange_text(&self) -> String {
        format!("Human: {}\nAI: {}", self.user, self.assistant)
    }
}

/// A completed exchange handed to the memory manager for persistence.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    /// Identifier to persist the turn under, generated when absent.
    pub turn_id: Option<TurnId>,
    /// User message text.
    pub user: String,
    /// Assistant response text.
    pub assistant: String,
    /// Responding model.
    pub model: String,
    /// Responding provider id.
    pub provider: String,
    /// Sources cited during the turn.
    pub citations: Vec<Citation>,
    /// Tool calls made during the turn.
    pub tool_calls: Vec<ToolCall>,
    /// Whether the user stopped generation.
    pub stopped: bool,
}

impl Exchange {
    /// Create an exchange from the two message texts.
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
            ..Default::default()
        }
    }

    /// Text of the exchange, as counted against the memory budget.
    pub fn text(&self) -> String {
        format!("Human: {}\nAI: {}", self.user, self.assistant)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// User Query
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the model gets tools bound for a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEligibility {
    /// Decide from the query text.
    #[default]
    Auto,
    /// Always bind tools.
    Always,
    /// Never bind tools.
    Never,
}

/// The client's input for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserQuery {
    /// Message text.
    pub text: String,
    /// Attached images.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageSource>,
    /// Document namespaces to search for context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Tool binding override.
    #[serde(default)]
    pub tools: ToolEligibility,
}

impl UserQuery {
    /// Create a text-only query.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Attach an image by URL.
    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.images.push(ImageSource::Url { url: url.into() });
        self
    }

    /// Attach a base64 image.
    pub fn with_image_base64(
        mut self,
        media_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        self.images.push(ImageSource::Base64 {
            media_type: media_type.into(),
            data: data.into(),
        });
        self
    }

    /// Attach a document namespace.
    pub fn with_attachment(mut self, namespace: impl Into<String>) -> Self {
        self.attachments.push(namespace.into());
        self
    }

    /// Override tool eligibility.
    pub fn with_tools(mut self, eligibility: ToolEligibility) -> Self {
        self.tools = eligibility;
        self
    }

    /// Whether the query carries images.
    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

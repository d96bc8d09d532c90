//! Checkpointed conversation memory.
//!
//! Each conversation has one rolling summary of everything older than the
//! current memory epoch, and an epoch of verbatim turns. Every turn stores
//! the checkpoint that was active when it was produced.
//!
//! ```text
//!  EMPTY ──first turn──▶ ACCUMULATING ──buffer ≥ limit──▶ SUMMARIZING
//!                            ▲                                 │
//!                            └──────── new checkpoint ─────────┘
//! ```
//!
//! When the epoch's exchanges reach the token limit, the older exchanges are
//! folded into a new summary (by a model when one is configured, otherwise
//! by a deterministic excerpt), a new checkpoint is derived from that
//! summary, and the triggering turn opens the new epoch.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use colloquy_llm::{InvocableModel, Message, SystemPrompt, UsageRecord};

use crate::context::estimate_tokens;
use crate::error::{AgentError, Result};
use crate::store::ConversationStore;
use crate::types::{Checkpoint, ConversationId, Exchange, TurnRecord};

/// System prompt for summary generation.
const SUMMARY_PROMPT: &str = "\
You maintain the long-term memory of a chat conversation. Merge the previous \
summary (if any) and the new exchanges into one updated summary. Focus on:
- Facts the user shared about themselves and their goals
- Key topics discussed and decisions made
- Open questions or pending items

Write plain prose in the third person. Do not address the user.";

/// Tunables for the memory manager.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySettings {
    /// Epoch size, in estimated tokens, that triggers summarization.
    pub token_limit: usize,
    /// Lower bound of the summary length asked of the model.
    pub summary_min_tokens: u32,
    /// Upper bound of the summary length asked of the model.
    pub summary_max_tokens: u32,
    /// Exchanges kept by the fallback summary.
    pub fallback_exchanges: usize,
    /// Characters kept per message in the fallback summary.
    pub excerpt_chars: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            token_limit: 10_000,
            summary_min_tokens: 400,
            summary_max_tokens: 800,
            fallback_exchanges: 3,
            excerpt_chars: 400,
        }
    }
}

/// Where a conversation is in its memory lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    /// No turns yet.
    Empty,
    /// Buffering turns under the current checkpoint.
    Accumulating,
    /// Generating a new summary.
    Summarizing,
}

/// History reconstructed for the next model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    /// Checkpoint of the active epoch.
    pub checkpoint: Checkpoint,
    /// Rolling summary of older epochs (may be empty).
    pub summary: String,
    /// Human/assistant messages of the active epoch, oldest first.
    pub history: Vec<Message>,
}

impl ConversationContext {
    /// Context of a conversation with no turns.
    pub fn empty(conversation_id: &ConversationId) -> Self {
        Self {
            checkpoint: Checkpoint::initial(conversation_id),
            summary: String::new(),
            history: Vec::new(),
        }
    }
}

/// Manages rolling summaries and checkpoints on top of a store.
pub struct MemoryManager {
    store: Arc<dyn ConversationStore>,
    summarizer: Option<InvocableModel>,
    settings: MemorySettings,
    summarizing: Mutex<HashSet<ConversationId>>,
}

impl MemoryManager {
    /// Create a manager that summarizes with the deterministic fallback only.
    pub fn new(store: Arc<dyn ConversationStore>, settings: MemorySettings) -> Self {
        Self {
            store,
            summarizer: None,
            settings,
            summarizing: Mutex::new(HashSet::new()),
        }
    }

    /// Generate summaries with this model.
    pub fn with_summarizer(mut self, model: InvocableModel) -> Self {
        self.summarizer = Some(model);
        self
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Active settings.
    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    /// Current lifecycle state of a conversation.
    pub async fn state(&self, conversation_id: &ConversationId) -> Result<MemoryState> {
        if self.summarizing.lock().contains(conversation_id) {
            return Ok(MemoryState::Summarizing);
        }
        Ok(match self.store.find_latest_checkpoint(conversation_id).await? {
            None => MemoryState::Empty,
            Some(_) => MemoryState::Accumulating,
        })
    }

    /// Rebuild the context for the next model call.
    ///
    /// Reads only; calling it twice without a new turn in between yields the
    /// same result.
    pub async fn load_context(&self, conversation_id: &ConversationId) -> Result<ConversationContext> {
        let Some(checkpoint) = self.store.find_latest_checkpoint(conversation_id).await? else {
            return Ok(ConversationContext::empty(conversation_id));
        };

        let summary = self
            .store
            .find_summary(conversation_id, &checkpoint)
            .await?
            .unwrap_or_default();
        let turns = self
            .store
            .find_turns_by_checkpoint(conversation_id, &checkpoint)
            .await?;

        let history = turns
            .iter()
            .flat_map(|t| [Message::user(t.user.clone()), Message::assistant(t.assistant.clone())])
            .collect();

        Ok(ConversationContext {
            checkpoint,
            summary,
            history,
        })
    }

    /// Persist a completed exchange, summarizing first if the epoch is full.
    ///
    /// Summarization failures never fail the turn; the fallback summary is
    /// used instead.
    pub async fn record_turn(
        &self,
        conversation_id: &ConversationId,
        exchange: Exchange,
        usage: UsageRecord,
    ) -> Result<TurnRecord> {
        let (checkpoint, summary) = match self.store.find_latest_checkpoint(conversation_id).await? {
            Some(checkpoint) => {
                let summary = self
                    .store
                    .find_summary(conversation_id, &checkpoint)
                    .await?
                    .unwrap_or_default();
                (checkpoint, summary)
            }
            None => {
                // Empty summary keeps checkpoint continuity from the first turn
                let checkpoint = Checkpoint::initial(conversation_id);
                self.store.save_summary(conversation_id, &checkpoint, "").await?;
                tracing::info!(
                    conversation_id = %conversation_id,
                    checkpoint = %checkpoint,
                    "Memory: initial checkpoint"
                );
                (checkpoint, String::new())
            }
        };

        let epoch = self
            .store
            .find_turns_by_checkpoint(conversation_id, &checkpoint)
            .await?;
        let buffered: usize = epoch
            .iter()
            .map(|t| estimate_tokens(&t.exchange_text()))
            .sum::<usize>()
            + estimate_tokens(&exchange.text());

        let (checkpoint, summary) = if buffered < self.settings.token_limit || epoch.is_empty() {
            tracing::debug!(
                conversation_id = %conversation_id,
                buffered_tokens = buffered,
                limit = self.settings.token_limit,
                "Memory: accumulating"
            );
            (checkpoint, summary)
        } else {
            self.roll_over(conversation_id, &checkpoint, &summary, &epoch, buffered)
                .await?
        };

        let record = TurnRecord {
            id: exchange.turn_id.unwrap_or_default(),
            conversation_id: conversation_id.clone(),
            checkpoint,
            superseded_by: None,
            system: summary,
            user: exchange.user,
            assistant: exchange.assistant,
            model: exchange.model,
            provider: exchange.provider,
            usage,
            citations: exchange.citations,
            tool_calls: exchange.tool_calls,
            stopped: exchange.stopped,
            created_at: Utc::now(),
        };
        self.store.create_turn(record.clone()).await?;
        Ok(record)
    }

    async fn roll_over(
        &self,
        conversation_id: &ConversationId,
        old: &Checkpoint,
        previous_summary: &str,
        epoch: &[TurnRecord],
        buffered: usize,
    ) -> Result<(Checkpoint, String)> {
        tracing::info!(
            conversation_id = %conversation_id,
            buffered_tokens = buffered,
            exchanges = epoch.len(),
            "Memory: summarizing epoch"
        );

        self.summarizing.lock().insert(conversation_id.clone());
        let summary = self.summarize(previous_summary, epoch).await;
        self.summarizing.lock().remove(conversation_id);

        let checkpoint = Checkpoint::from_summary(conversation_id, old, &summary);
        let superseded = self
            .store
            .begin_epoch(conversation_id, old, &checkpoint, &summary)
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            old = %old,
            checkpoint = %checkpoint,
            superseded,
            summary_tokens = estimate_tokens(&summary),
            "Memory: new checkpoint"
        );
        Ok((checkpoint, summary))
    }

    /// Summary of the previous summary plus the given exchanges.
    pub async fn summarize(&self, previous_summary: &str, exchanges: &[TurnRecord]) -> String {
        if let Some(model) = &self.summarizer {
            match self.summarize_with_model(model, previous_summary, exchanges).await {
                Ok(summary) => return summary,
                Err(e) => {
                    tracing::warn!(error = %e, "Memory: summary generation failed, using fallback");
                }
            }
        }
        self.fallback_summary(previous_summary, exchanges)
    }

    async fn summarize_with_model(
        &self,
        model: &InvocableModel,
        previous_summary: &str,
        exchanges: &[TurnRecord],
    ) -> Result<String> {
        let transcript = exchanges
            .iter()
            .map(TurnRecord::exchange_text)
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut input = String::new();
        if !previous_summary.trim().is_empty() {
            input.push_str(&format!("Previous summary:\n{}\n\n", previous_summary));
        }
        input.push_str(&format!(
            "New exchanges:\n{}\n\nWrite the updated summary in roughly {} to {} tokens.",
            transcript, self.settings.summary_min_tokens, self.settings.summary_max_tokens
        ));

        let response = model
            .invoke(vec![Message::user(input)], Some(SystemPrompt::text(SUMMARY_PROMPT)))
            .await?;
        let summary = response.text().trim().to_string();
        if summary.is_empty() {
            return Err(AgentError::memory("summarizer returned no text"));
        }
        Ok(summary)
    }

    /// Deterministic summary: the last few exchanges, excerpted.
    pub fn fallback_summary(&self, previous_summary: &str, exchanges: &[TurnRecord]) -> String {
        let mut parts = Vec::new();
        if !previous_summary.trim().is_empty() {
            parts.push(format!(
                "Earlier: {}",
                excerpt(previous_summary, self.settings.excerpt_chars)
            ));
        }

        let skip = exchanges.len().saturating_sub(self.settings.fallback_exchanges);
        for turn in &exchanges[skip..] {
            parts.push(format!(
                "Human: {}\nAI: {}",
                excerpt(&turn.user, self.settings.excerpt_chars),
                excerpt(&turn.assistant, self.settings.excerpt_chars)
            ));
        }
        parts.join("\n\n")
    }
}

/// First `max_chars` characters of `text`, marked when cut.
fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::TurnId;
    use colloquy_llm::{
        Credentials, FixedBackendBuilder, LlmError, MockBackend, MockResponse, ModelOptions,
        ProviderFactory,
    };
    use colloquy_cache::CacheConfig;

    fn manager(limit: usize) -> (Arc<InMemoryStore>, MemoryManager) {
        let store = Arc::new(InMemoryStore::new());
        let settings = MemorySettings {
            token_limit: limit,
            ..Default::default()
        };
        (store.clone(), MemoryManager::new(store, settings))
    }

    async fn summarizer(backend: Arc<MockBackend>) -> InvocableModel {
        let factory = ProviderFactory::with_builder(
            Arc::new(FixedBackendBuilder::new(backend)),
            CacheConfig::default(),
        );
        factory
            .create_model(Some("anthropic"), "claude-haiku", &Credentials::api_key("k"), ModelOptions::new())
            .await
            .unwrap()
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("abcdef", 3), "abc...");
        assert_eq!(excerpt("ééé", 2), "éé...");
    }

    #[tokio::test]
    async fn test_first_turn_creates_initial_checkpoint() {
        let (store, memory) = manager(10_000);
        let conv = ConversationId::from("conv-a");
        assert_eq!(memory.state(&conv).await.unwrap(), MemoryState::Empty);

        let record = memory
            .record_turn(&conv, Exchange::new("Hello", "Hi there!"), UsageRecord::default())
            .await
            .unwrap();

        assert_eq!(record.checkpoint, Checkpoint::initial(&conv));
        assert_eq!(record.system, "");
        assert_eq!(
            store.find_summary(&conv, &record.checkpoint).await.unwrap().as_deref(),
            Some("")
        );
        assert_eq!(memory.state(&conv).await.unwrap(), MemoryState::Accumulating);
    }

    #[tokio::test]
    async fn test_accumulates_under_limit() {
        let (store, memory) = manager(10_000);
        let conv = ConversationId::from("conv-b");
        for i in 0..4 {
            memory
                .record_turn(&conv, Exchange::new(format!("q{}", i), format!("a{}", i)), UsageRecord::default())
                .await
                .unwrap();
        }
        assert_eq!(store.checkpoints(&conv).len(), 1);

        let context = memory.load_context(&conv).await.unwrap();
        assert_eq!(context.history.len(), 8);
        assert_eq!(context.history[0], Message::user("q0"));
        assert_eq!(context.history[7], Message::assistant("a3"));
    }

    #[tokio::test]
    async fn test_rollover_uses_fallback_without_model() {
        let (store, memory) = manager(100);
        let conv = ConversationId::from("conv-c");
        let long = "word ".repeat(60);

        let first = memory
            .record_turn(&conv, Exchange::new("first question", long.clone()), UsageRecord::default())
            .await
            .unwrap();
        let second = memory
            .record_turn(&conv, Exchange::new("second question", long.clone()), UsageRecord::default())
            .await
            .unwrap();

        assert_ne!(first.checkpoint, second.checkpoint);
        assert_eq!(
            second.checkpoint,
            Checkpoint::from_summary(&conv, &first.checkpoint, &second.system)
        );
        assert!(second.system.contains("first question"));

        let old = store.find_turns_by_checkpoint(&conv, &first.checkpoint).await.unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].superseded_by.as_ref(), Some(&second.checkpoint));

        let context = memory.load_context(&conv).await.unwrap();
        assert_eq!(context.checkpoint, second.checkpoint);
        assert_eq!(context.summary, second.system);
        assert_eq!(context.history.len(), 2);
    }

    #[tokio::test]
    async fn test_rollover_with_model_summary() {
        let backend = Arc::new(MockBackend::with_text("The user asked two questions about Rust."));
        let model = summarizer(backend.clone()).await;
        let (_, memory) = manager(100);
        let memory = memory.with_summarizer(model);
        let conv = ConversationId::from("conv-d");
        let long = "word ".repeat(60);

        memory
            .record_turn(&conv, Exchange::new("q1", long.clone()), UsageRecord::default())
            .await
            .unwrap();
        let second = memory
            .record_turn(&conv, Exchange::new("q2", long), UsageRecord::default())
            .await
            .unwrap();

        assert_eq!(second.system, "The user asked two questions about Rust.");
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_summary_still_resets_epoch() {
        let replies = (0..6)
            .map(|_| MockBackend::text_response("User chatted about words."))
            .collect();
        let model = summarizer(Arc::new(MockBackend::new(replies))).await;
        let (store, memory) = manager(100);
        let memory = memory.with_summarizer(model);
        let conv = ConversationId::from("conv-repeat");
        let long = "word ".repeat(60);

        let mut checkpoints = Vec::new();
        for i in 0..6 {
            let record = memory
                .record_turn(&conv, Exchange::new(format!("q{}", i), long.clone()), UsageRecord::default())
                .await
                .unwrap();
            checkpoints.push(record.checkpoint);

            let context = memory.load_context(&conv).await.unwrap();
            assert_eq!(context.history.len(), 2);
        }

        let unique: std::collections::HashSet<_> = checkpoints.iter().collect();
        assert_eq!(unique.len(), 6);
        assert_eq!(store.checkpoints(&conv), checkpoints);
        assert_eq!(
            store.find_latest_checkpoint(&conv).await.unwrap().as_ref(),
            checkpoints.last()
        );
    }

    #[tokio::test]
    async fn test_summary_failure_falls_back() {
        let backend = Arc::new(MockBackend::scripted(vec![MockResponse::Failure(
            LlmError::Server {
                status: 503,
                message: "overloaded".into(),
            },
        )]));
        let model = summarizer(backend).await;
        let (_, memory) = manager(100);
        let memory = memory.with_summarizer(model);
        let conv = ConversationId::from("conv-e");
        let long = "word ".repeat(60);

        memory
            .record_turn(&conv, Exchange::new("q1", long.clone()), UsageRecord::default())
            .await
            .unwrap();
        let second = memory
            .record_turn(&conv, Exchange::new("q2", long), UsageRecord::default())
            .await
            .unwrap();

        assert!(second.system.starts_with("Human: q1"));
    }

    #[tokio::test]
    async fn test_load_context_is_idempotent() {
        let (_, memory) = manager(100);
        let conv = ConversationId::from("conv-f");
        for i in 0..5 {
            memory
                .record_turn(&conv, Exchange::new(format!("q{}", i), "x".repeat(200)), UsageRecord::default())
                .await
                .unwrap();
        }
        let a = memory.load_context(&conv).await.unwrap();
        let b = memory.load_context(&conv).await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fallback_keeps_last_exchanges() {
        let (_, memory) = manager(100);
        let conv = ConversationId::from("conv-g");
        let turns: Vec<TurnRecord> = (0..5)
            .map(|i| TurnRecord {
                id: TurnId::new(),
                conversation_id: conv.clone(),
                checkpoint: Checkpoint::initial(&conv),
                superseded_by: None,
                system: String::new(),
                user: format!("q{}", i),
                assistant: format!("a{}", i),
                model: String::new(),
                provider: String::new(),
                usage: UsageRecord::default(),
                citations: Vec::new(),
                tool_calls: Vec::new(),
                stopped: false,
                created_at: Utc::now(),
            })
            .collect();

        let summary = memory.fallback_summary("older stuff", &turns);
        assert!(summary.starts_with("Earlier: older stuff"));
        assert!(!summary.contains("q1"));
        assert!(summary.contains("q2") && summary.contains("q4"));
    }
}

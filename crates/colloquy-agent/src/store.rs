//! Conversation persistence contract and an in-memory implementation.
//!
//! Turns are append-only. The only updates a store performs are a turn's
//! own usage backfill and the bulk checkpoint reassignment that happens when
//! a new rolling summary opens a memory epoch.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use colloquy_llm::UsageRecord;

use crate::error::{AgentError, Result};
use crate::types::{Checkpoint, ConversationId, TurnId, TurnRecord};

/// Storage for turns, checkpoints and rolling summaries.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a turn.
    async fn create_turn(&self, record: TurnRecord) -> Result<()>;

    /// Checkpoint of the most recent memory epoch, if the conversation has one.
    async fn find_latest_checkpoint(&self, conversation_id: &ConversationId) -> Result<Option<Checkpoint>>;

    /// Turns produced under `checkpoint`, oldest first.
    async fn find_turns_by_checkpoint(
        &self,
        conversation_id: &ConversationId,
        checkpoint: &Checkpoint,
    ) -> Result<Vec<TurnRecord>>;

    /// Replace a turn's usage with the final tally.
    async fn update_usage(&self, turn_id: TurnId, usage: &UsageRecord) -> Result<()>;

    /// Mark every turn of the `old` epoch as superseded by `new`.
    ///
    /// Turns keep their original checkpoint so they stay queryable under it.
    /// Returns the number of turns marked.
    async fn bulk_reassign_checkpoint(
        &self,
        conversation_id: &ConversationId,
        old: &Checkpoint,
        new: &Checkpoint,
    ) -> Result<usize>;

    /// Persist the rolling summary that opens the epoch `checkpoint`.
    async fn save_summary(
        &self,
        conversation_id: &ConversationId,
        checkpoint: &Checkpoint,
        summary: &str,
    ) -> Result<()>;

    /// Summary stored for `checkpoint`.
    async fn find_summary(
        &self,
        conversation_id: &ConversationId,
        checkpoint: &Checkpoint,
    ) -> Result<Option<String>>;

    /// Open a new epoch: persist its summary and supersede the old epoch.
    ///
    /// Stores that can should override this to make both writes atomic
    /// with respect to readers of the same conversation.
    async fn begin_epoch(
        &self,
        conversation_id: &ConversationId,
        old: &Checkpoint,
        new: &Checkpoint,
        summary: &str,
    ) -> Result<usize> {
        self.save_summary(conversation_id, new, summary).await?;
        self.bulk_reassign_checkpoint(conversation_id, old, new).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-Memory Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ConversationData {
    turns: Vec<TurnRecord>,
    /// Epochs in the order they were opened.
    epochs: Vec<(Checkpoint, String)>,
}

impl ConversationData {
    fn upsert_summary(&mut self, checkpoint: &Checkpoint, summary: &str) {
        match self.epochs.iter_mut().find(|(cp, _)| cp == checkpoint) {
            Some(epoch) => epoch.1 = summary.to_string(),
            None => self.epochs.push((checkpoint.clone(), summary.to_string())),
        }
    }

    fn supersede(&mut self, old: &Checkpoint, new: &Checkpoint) -> usize {
        let mut count = 0;
        for turn in self
            .turns
            .iter_mut()
            .filter(|t| &t.checkpoint == old && t.superseded_by.is_none())
        {
            turn.superseded_by = Some(new.clone());
            count += 1;
        }
        count
    }
}

/// Process-local store. Everything is lost on drop.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<ConversationId, ConversationData>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every turn of a conversation, oldest first.
    pub fn turns(&self, conversation_id: &ConversationId) -> Vec<TurnRecord> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|c| c.turns.clone())
            .unwrap_or_default()
    }

    /// Every checkpoint a conversation has had, oldest first.
    pub fn checkpoints(&self, conversation_id: &ConversationId) -> Vec<Checkpoint> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|c| c.epochs.iter().map(|(cp, _)| cp.clone()).collect())
            .unwrap_or_default()
    }

    /// Look up one turn.
    pub fn turn(&self, turn_id: TurnId) -> Option<TurnRecord> {
        self.conversations
            .read()
            .values()
            .flat_map(|c| c.turns.iter())
            .find(|t| t.id == turn_id)
            .cloned()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_turn(&self, record: TurnRecord) -> Result<()> {
        let mut conversations = self.conversations.write();
        let data = conversations.entry(record.conversation_id.clone()).or_default();
        if data.turns.iter().any(|t| t.id == record.id) {
            return Err(AgentError::store(format!("turn {} already exists", record.id)));
        }
        data.turns.push(record);
        Ok(())
    }

    async fn find_latest_checkpoint(&self, conversation_id: &ConversationId) -> Result<Option<Checkpoint>> {
        Ok(self
            .conversations
            .read()
            .get(conversation_id)
            .and_then(|c| c.epochs.last())
            .map(|(cp, _)| cp.clone()))
    }

    async fn find_turns_by_checkpoint(
        &self,
        conversation_id: &ConversationId,
        checkpoint: &Checkpoint,
    ) -> Result<Vec<TurnRecord>> {
        Ok(self
            .conversations
            .read()
            .get(conversation_id)
            .map(|c| {
                c.turns
                    .iter()
                    .filter(|t| &t.checkpoint == checkpoint)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_usage(&self, turn_id: TurnId, usage: &UsageRecord) -> Result<()> {
        let mut conversations = self.conversations.write();
        let turn = conversations
            .values_mut()
            .flat_map(|c| c.turns.iter_mut())
            .find(|t| t.id == turn_id)
            .ok_or_else(|| AgentError::store(format!("turn {} not found", turn_id)))?;
        turn.usage = usage.clone();
        Ok(())
    }

    async fn bulk_reassign_checkpoint(
        &self,
        conversation_id: &ConversationId,
        old: &Checkpoint,
        new: &Checkpoint,
    ) -> Result<usize> {
        Ok(self
            .conversations
            .write()
            .get_mut(conversation_id)
            .map_or(0, |c| c.supersede(old, new)))
    }

    async fn save_summary(
        &self,
        conversation_id: &ConversationId,
        checkpoint: &Checkpoint,
        summary: &str,
    ) -> Result<()> {
        self.conversations
            .write()
            .entry(conversation_id.clone())
            .or_default()
            .upsert_summary(checkpoint, summary);
        Ok(())
    }

    async fn find_summary(
        &self,
        conversation_id: &ConversationId,
        checkpoint: &Checkpoint,
    ) -> Result<Option<String>> {
        Ok(self.conversations.read().get(conversation_id).and_then(|c| {
            c.epochs
                .iter()
                .find(|(cp, _)| cp == checkpoint)
                .map(|(_, summary)| summary.clone())
        }))
    }

    async fn begin_epoch(
        &self,
        conversation_id: &ConversationId,
        old: &Checkpoint,
        new: &Checkpoint,
        summary: &str,
    ) -> Result<usize> {
        let mut conversations = self.conversations.write();
        let data = conversations.entry(conversation_id.clone()).or_default();
        data.upsert_summary(new, summary);
        Ok(data.supersede(old, new))
    }
}

//! Context assembly for model calls.
//!
//! Combines the agent persona, custom instructions, retrieved documents and
//! the rolling summary into the system prompt, and builds the human message
//! for the turn (multi-part when images are attached).

use colloquy_llm::{ContentBlock, Message, Provider, SystemPrompt};

use crate::memory::ConversationContext;
use crate::types::UserQuery;

/// Rough characters per token.
const CHARS_PER_TOKEN: usize = 4;

/// Heading placed before the rolling summary in the system prompt.
pub const SUMMARY_HEADING: &str = "Summary of the earlier conversation:";

/// Estimate token count for a string (rough approximation).
///
/// Uses a simple heuristic of ~4 characters per token, which is
/// reasonable for English text with the Claude/GPT tokenizers.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Estimate tokens for a message, counting text only.
pub fn estimate_message_tokens(message: &Message) -> usize {
    estimate_tokens(&message.content.to_text())
}

/// Agent-level prompt material.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Persona {
    /// Who the assistant is.
    pub persona: Option<String>,
    /// Custom per-agent instructions.
    pub instructions: Option<String>,
}

impl Persona {
    /// Persona with the given description.
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: Some(persona.into()),
            instructions: None,
        }
    }

    /// Add custom instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Whether a persona is configured.
    pub fn is_active(&self) -> bool {
        self.persona.as_deref().is_some_and(|p| !p.trim().is_empty())
    }
}

/// Everything one agent invocation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    /// System prompt, absent when there is nothing to say.
    pub system: Option<SystemPrompt>,
    /// History followed by the new human message.
    pub messages: Vec<Message>,
}

/// Build the model input for a turn.
///
/// `documents` is the retrieval block, if any. It joins the system prompt
/// when a persona is active and is prepended to the query otherwise.
/// Retrieval is the caller's to skip for image turns.
pub fn assemble(
    provider: Provider,
    persona: &Persona,
    memory: &ConversationContext,
    query: &UserQuery,
    documents: Option<&str>,
) -> AssembledContext {
    let persona_active = persona.is_active();

    let mut sections: Vec<String> = Vec::new();
    if let Some(text) = persona.persona.as_deref().filter(|_| persona_active) {
        sections.push(text.to_string());
    }
    if let Some(text) = persona.instructions.as_deref() {
        sections.push(text.to_string());
    }
    if persona_active && let Some(block) = documents {
        sections.push(block.to_string());
    }
    if !memory.summary.trim().is_empty() {
        sections.push(format!("{}\n{}", SUMMARY_HEADING, memory.summary));
    }

    let system = build_system_prompt(provider, sections);
    let inline_documents = documents.filter(|_| !persona_active);

    let mut messages = memory.history.clone();
    messages.push(human_message(query, inline_documents));

    AssembledContext { system, messages }
}

/// Join sections into the provider's preferred system prompt shape.
pub fn build_system_prompt(provider: Provider, sections: Vec<String>) -> Option<SystemPrompt> {
    let sections: Vec<String> = sections
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect();
    if sections.is_empty() {
        return None;
    }
    if provider.requires_single_system_message() {
        Some(SystemPrompt::text(sections.join("\n\n")))
    } else {
        Some(SystemPrompt::blocks(sections))
    }
}

/// The human message for a turn.
pub fn human_message(query: &UserQuery, documents: Option<&str>) -> Message {
    if query.has_images() {
        let mut blocks = vec![ContentBlock::text(query.text.clone())];
        blocks.extend(
            query
                .images
                .iter()
                .cloned()
                .map(|source| ContentBlock::Image { source }),
        );
        return Message::user_blocks(blocks);
    }
    match documents {
        Some(block) => Message::user(format!("{}\n\n{}", block, query.text)),
        None => Message::user(query.text.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationId;
    use colloquy_llm::Content;

    fn memory(summary: &str) -> ConversationContext {
        let mut ctx = ConversationContext::empty(&ConversationId::from("c"));
        ctx.summary = summary.to_string();
        ctx.history = vec![Message::user("earlier"), Message::assistant("reply")];
        ctx
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_message_tokens(&Message::user("abcd")), 1);
    }

    #[test]
    fn test_empty_context_has_no_system() {
        let ctx = assemble(
            Provider::Anthropic,
            &Persona::default(),
            &ConversationContext::empty(&ConversationId::from("c")),
            &UserQuery::text("Hello"),
            None,
        );
        assert!(ctx.system.is_none());
        assert_eq!(ctx.messages, vec![Message::user("Hello")]);
    }

    #[test]
    fn test_sections_split_for_multi_system_providers() {
        let persona = Persona::new("You are a travel agent.").with_instructions("Answer in French.");
        let ctx = assemble(
            Provider::Anthropic,
            &persona,
            &memory("User plans a trip to Lyon."),
            &UserQuery::text("Any tips?"),
            None,
        );
        let system = ctx.system.unwrap();
        let sections = system.sections();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0], "You are a travel agent.");
        assert!(sections[2].starts_with(SUMMARY_HEADING));
        assert_eq!(ctx.messages.len(), 3);
    }

    #[test]
    fn test_sections_merged_for_single_system_providers() {
        let persona = Persona::new("You are a travel agent.");
        let ctx = assemble(
            Provider::Groq,
            &persona,
            &memory("User plans a trip."),
            &UserQuery::text("Any tips?"),
            None,
        );
        match ctx.system.unwrap() {
            SystemPrompt::Text(text) => {
                assert!(text.starts_with("You are a travel agent."));
                assert!(text.contains("User plans a trip."));
            }
            other => panic!("expected merged prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_documents_go_to_query_without_persona() {
        let ctx = assemble(
            Provider::OpenAi,
            &Persona::default(),
            &memory(""),
            &UserQuery::text("What is the refund policy?"),
            Some("DOCS"),
        );
        assert!(ctx.system.is_none());
        let last = ctx.messages.last().unwrap();
        assert_eq!(last.content.to_text(), "DOCS\n\nWhat is the refund policy?");
    }

    #[test]
    fn test_documents_go_to_system_with_persona() {
        let ctx = assemble(
            Provider::OpenAi,
            &Persona::new("You are support."),
            &memory(""),
            &UserQuery::text("What is the refund policy?"),
            Some("DOCS"),
        );
        assert_eq!(ctx.system.unwrap().sections(), vec!["You are support.", "DOCS"]);
        assert_eq!(
            ctx.messages.last().unwrap().content.to_text(),
            "What is the refund policy?"
        );
    }

    #[test]
    fn test_images_make_multipart_message() {
        let query = UserQuery::text("What is in this picture?")
            .with_image_url("https://example.com/cat.png");
        let message = human_message(&query, Some("ignored"));
        assert!(message.has_images());
        match message.content {
            Content::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[0], ContentBlock::text("What is in this picture?"));
            }
            Content::Text(_) => panic!("expected blocks"),
        }
    }
}

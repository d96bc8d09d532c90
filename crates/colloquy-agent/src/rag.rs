//! Retrieval augmentation over attached documents.
//!
//! A [`DocumentIndex`] answers similarity searches scoped to a namespace
//! (one uploaded file, or an agent's preconfigured knowledge base). The
//! [`Retriever`] queries every namespace attached to a turn and formats the
//! best chunks into one delimited block for the prompt.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{AgentError, Result};

/// Opening line of the augmentation block.
pub const DOCUMENT_BLOCK_START: &str = "--- Relevant document content ---";
/// Closing line of the augmentation block.
pub const DOCUMENT_BLOCK_END: &str = "--- End of document content ---";

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedChunk {
    /// Document the chunk came from.
    pub source: String,
    /// Chunk text.
    pub text: String,
    /// Relevance in `0.0..=1.0`.
    pub score: f32,
}

/// Searchable document store.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Best `top_k` chunks in `namespace` for `query`, most relevant first.
    async fn search(&self, namespace: &str, query: &str, top_k: usize) -> Result<Vec<RankedChunk>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyword Index
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_CHUNK_CHARS: usize = 800;

struct IndexedChunk {
    source: String,
    text: String,
    terms: HashSet<String>,
}

/// In-memory index scoring chunks by query-term overlap.
pub struct KeywordIndex {
    namespaces: RwLock<HashMap<String, Vec<IndexedChunk>>>,
    chunk_chars: usize,
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            chunk_chars: DEFAULT_CHUNK_CHARS,
        }
    }

    /// Target chunk size in characters.
    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    /// Split a document into paragraph chunks and add it to `namespace`.
    pub fn add_document(&self, namespace: &str, source: &str, text: &str) -> usize {
        let chunks = chunk_paragraphs(text, self.chunk_chars);
        let added = chunks.len();
        let mut namespaces = self.namespaces.write();
        let entry = namespaces.entry(namespace.to_string()).or_default();
        for chunk in chunks {
            entry.push(IndexedChunk {
                source: source.to_string(),
                terms: terms(&chunk),
                text: chunk,
            });
        }
        added
    }

    /// Whether the namespace has any content.
    pub fn contains_namespace(&self, namespace: &str) -> bool {
        self.namespaces.read().contains_key(namespace)
    }
}

#[async_trait]
impl DocumentIndex for KeywordIndex {
    async fn search(&self, namespace: &str, query: &str, top_k: usize) -> Result<Vec<RankedChunk>> {
        let namespaces = self.namespaces.read();
        let chunks = namespaces
            .get(namespace)
            .ok_or_else(|| AgentError::store(format!("unknown document namespace '{}'", namespace)))?;

        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<RankedChunk> = chunks
            .iter()
            .filter_map(|chunk| {
                let overlap = query_terms.intersection(&chunk.terms).count();
                (overlap > 0).then(|| RankedChunk {
                    source: chunk.source.clone(),
                    text: chunk.text.clone(),
                    score: overlap as f32 / query_terms.len() as f32,
                })
            })
            .collect();

        // Stable sort keeps document order among equal scores
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

fn chunk_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.len() + paragraph.len() + 2 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ─────────────────────────────────────────────────────────────────────────────
// Retriever
// ─────────────────────────────────────────────────────────────────────────────

/// Runs retrieval for a turn's attachments.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<dyn DocumentIndex>,
    top_k: usize,
}

impl Retriever {
    /// Create a retriever returning up to `top_k` chunks per turn.
    pub fn new(index: Arc<dyn DocumentIndex>, top_k: usize) -> Self {
        Self { index, top_k }
    }

    /// Search every namespace and format the best chunks.
    ///
    /// Returns `Ok(None)` when nothing relevant was found. Any search
    /// failure is returned so the caller can fall back to the plain query.
    pub async fn augment(&self, namespaces: &[String], query: &str) -> Result<Option<String>> {
        let mut hits = Vec::new();
        for namespace in namespaces {
            hits.extend(self.index.search(namespace, query, self.top_k).await?);
        }
        if hits.is_empty() {
            return Ok(None);
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(self.top_k);

        tracing::debug!(chunks = hits.len(), namespaces = namespaces.len(), "Retrieval: injecting context");
        Ok(Some(format_document_block(&hits)))
    }
}

/// Render chunks as a delimited block.
pub fn format_document_block(chunks: &[RankedChunk]) -> String {
    let mut out = String::from(DOCUMENT_BLOCK_START);
    for chunk in chunks {
        out.push_str(&format!("\n[{}] ({:.0}%)\n{}\n", chunk.source, chunk.score * 100.0, chunk.text));
    }
    out.push_str(DOCUMENT_BLOCK_END);
    out
}

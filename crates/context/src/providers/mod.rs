//! Context providers
//!
//! The three independent sources a query draws context from:
//! - [`VectorStore`]: nearest document chunks from the indexed corpus
//! - [`ExternalKnowledge`]: live lookups against public knowledge sources
//! - [`MemoryReader`]: recent turns of the session's conversation

mod external;
mod memory;
mod vector;

pub use external::{ArxivSource, ExternalFetcher, GithubSource, KnowledgeSource, MdnSource};
pub use memory::SessionMemory;
pub use vector::QdrantStore;

use crate::query_analyzer::Lookup;
use async_trait::async_trait;
use hal_common::errors::Result;
use hal_common::Turn;
use serde::{Deserialize, Serialize};

/// Where a context item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    Vector,
    External,
    Memory,
}

impl ContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::Vector => "vector",
            ContextSource::External => "external",
            ContextSource::Memory => "memory",
        }
    }
}

/// One piece of context offered to the prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub source: ContextSource,

    pub content: String,

    /// Similarity for vector chunks; rank-derived for external snippets, zero for memory
    pub relevance_score: f32,

    /// Chunk id, URL, or turn timestamp
    pub origin: String,
}

impl ContextItem {
    pub fn vector(content: impl Into<String>, score: f32, origin: impl Into<String>) -> Self {
        Self {
            source: ContextSource::Vector,
            content: content.into(),
            relevance_score: score,
            origin: origin.into(),
        }
    }

    pub fn external(content: impl Into<String>, score: f32, origin: impl Into<String>) -> Self {
        Self {
            source: ContextSource::External,
            content: content.into(),
            relevance_score: score,
            origin: origin.into(),
        }
    }

    pub fn memory(turn: &Turn) -> Self {
        Self {
            source: ContextSource::Memory,
            content: turn.as_context(),
            relevance_score: 0.0,
            origin: turn.timestamp.to_rfc3339(),
        }
    }

    /// Size counted against the context budget
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Nearest-neighbour retrieval over the document corpus
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Top `k` chunks for the query text, best first, in store order
    async fn search(&self, text: &str, k: usize) -> Result<Vec<ContextItem>>;

    /// Number of chunks in the corpus
    async fn count(&self) -> Result<u64>;
}

/// External knowledge fan-out for one query
#[async_trait]
pub trait ExternalKnowledge: Send + Sync {
    /// Run the lookups; an empty slice yields no items
    async fn fetch(&self, lookups: &[Lookup]) -> Result<Vec<ContextItem>>;
}

/// Conversation memory access
#[async_trait]
pub trait MemoryReader: Send + Sync {
    /// Last `n` turns of a session in chronological order
    async fn recent_turns(&self, session_id: &str, n: usize) -> Result<Vec<Turn>>;
}

//! HAL Context Engine
//!
//! Everything a query needs between validation and streaming:
//! - Query analysis (keywords, source selection, sentiment, user facts)
//! - Context providers (vector store, external knowledge, conversation memory)
//! - Context assembly under per-provider timeouts
//! - Prompt building
//! - Streaming generation against an OpenAI-compatible inference server

pub mod assembler;
pub mod generation;
pub mod prompt;
pub mod providers;
pub mod query_analyzer;

pub use assembler::{
    AssembledContext, AssemblerSettings, AssemblyReport, ContextAssembler, ProviderOutcome,
};
pub use generation::{
    FragmentStream, GenerationEngine, OpenAiCompatEngine, ScriptStep, ScriptedEngine,
};
pub use prompt::{GenerationRequest, PromptBuilder, PromptSettings};
pub use providers::{ContextItem, ContextSource, ExternalKnowledge, MemoryReader, VectorStore};
pub use query_analyzer::{ExternalSource, Lookup, QueryAnalysis, QueryAnalyzer, Sentiment};

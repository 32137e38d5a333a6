//! Application state shared by every connection and handler

use crate::coordinator::{GenerationCoordinator, QueryPipeline};
use hal_common::auth::{ConfiguredCredentials, CredentialStore};
use hal_common::config::AppConfig;
use hal_common::embeddings::create_embedder;
use hal_common::errors::Result;
use hal_common::session::SessionLimits;
use hal_common::{SessionStore, TraceCorrelator};
use hal_context::providers::{ExternalFetcher, QdrantStore, SessionMemory};
use hal_context::{
    AssemblerSettings, ContextAssembler, ExternalKnowledge, GenerationEngine, OpenAiCompatEngine,
    PromptBuilder, PromptSettings, QueryAnalyzer, VectorStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

/// Adapters the orchestration core talks to
pub struct Components {
    pub credentials: Arc<dyn CredentialStore>,
    pub vector: Arc<dyn VectorStore>,
    pub external: Arc<dyn ExternalKnowledge>,
    pub engine: Arc<dyn GenerationEngine>,
}

impl Components {
    /// Production adapters built from configuration
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let credentials = ConfiguredCredentials::from_config(&config.auth);
        if credentials.is_empty() {
            warn!("No user accounts configured, every login will be rejected");
        }

        let embedder = create_embedder(&config.embedding)?;

        Ok(Self {
            credentials: Arc::new(credentials),
            vector: Arc::new(QdrantStore::new(&config.vector, embedder)?),
            external: Arc::new(ExternalFetcher::from_config(&config.external)?),
            engine: Arc::new(OpenAiCompatEngine::new(&config.llm)?),
        })
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionStore>,
    pub traces: Arc<TraceCorrelator>,
    pub credentials: Arc<dyn CredentialStore>,
    pub vector: Arc<dyn VectorStore>,
    pub pipeline: Arc<QueryPipeline>,
    /// Live WebSocket connections, awaited on shutdown
    pub connections: TaskTracker,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, components: Components) -> Result<Self> {
        let sessions = Arc::new(SessionStore::new(SessionLimits::from(&config.session)));
        let traces = Arc::new(TraceCorrelator::new());
        let shutdown = CancellationToken::new();

        let assembler = ContextAssembler::new(
            components.vector.clone(),
            components.external,
            Arc::new(SessionMemory::new(sessions.clone())),
            AssemblerSettings::from_config(&config),
        );

        let pipeline = QueryPipeline {
            analyzer: QueryAnalyzer::new()?,
            assembler,
            prompts: PromptBuilder::new(PromptSettings::from(&config.llm)),
            engine: components.engine,
            coordinator: GenerationCoordinator::new(config.stats_interval()),
            sessions: sessions.clone(),
            traces: traces.clone(),
            shutdown: shutdown.clone(),
        };

        Ok(Self {
            config,
            sessions,
            traces,
            credentials: components.credentials,
            vector: components.vector,
            pipeline: Arc::new(pipeline),
            connections: TaskTracker::new(),
            shutdown,
        })
    }

    pub fn from_config(config: Arc<AppConfig>) -> Result<Self> {
        let components = Components::from_config(&config)?;
        Self::new(config, components)
    }
}

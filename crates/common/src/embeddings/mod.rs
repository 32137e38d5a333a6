//! Embedding service abstraction
//!
//! Provides a unified interface for embedding providers:
//! - OpenAI-compatible `/embeddings` endpoints (OpenAI, TEI, vLLM)
//! - A deterministic mock for development and tests

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// OpenAI-compatible embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: Vec<&'a str>,
    model: &'a str,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// Create a new embedder from configuration
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));

        let mut request = self.client.post(&url).json(&OpenAIRequest {
            input: vec![text],
            model: &self.model,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| AppError::EmbeddingError {
            message: format!("Request failed: {}", e),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::EmbeddingError {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: OpenAIResponse = response.json().await.map_err(|e| AppError::EmbeddingError {
            message: format!("Failed to parse response: {}", e),
        })?;

        result
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| AppError::EmbeddingError {
                message: "Empty response".to_string(),
            })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Mock embedder for testing; the same text always yields the same vector
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());
        Ok((0..self.dimension).map(|_| rng.gen::<f32>()).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using mock");
            Ok(Arc::new(MockEmbedder::new(config.dimension)))
        }
    }
}

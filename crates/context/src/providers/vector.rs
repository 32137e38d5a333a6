//! Qdrant-backed vector retrieval over the REST API

use super::{ContextItem, VectorStore};
use async_trait::async_trait;
use hal_common::config::VectorConfig;
use hal_common::errors::{AppError, Result};
use hal_common::Embedder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const PROVIDER: &str = "vector";

pub struct QdrantStore {
    client: reqwest::Client,
    embedder: Arc<dyn Embedder>,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    hnsw_ef: usize,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
    params: SearchParams,
}

#[derive(Serialize)]
struct SearchParams {
    hnsw_ef: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<ChunkPayload>,
}

#[derive(Deserialize, Default)]
struct ChunkPayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    chunk_id: Option<Value>,
}

#[derive(Deserialize)]
struct CollectionResponse {
    result: CollectionInfo,
}

#[derive(Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: Option<u64>,
}

impl QdrantStore {
    pub fn new(config: &VectorConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            embedder,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key: config.api_key.clone(),
            hnsw_ef: config.hnsw_ef,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/collections/{}{}", self.base_url, self.collection, path);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AppError::Provider {
            provider: PROVIDER.to_string(),
            message: format!("qdrant returned {}: {}", status, body),
        })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn search(&self, text: &str, k: usize) -> Result<Vec<ContextItem>> {
        let vector = self.embedder.embed(text).await?;

        let response = self
            .request(reqwest::Method::POST, "/points/search")
            .json(&SearchRequest {
                vector: &vector,
                limit: k,
                with_payload: true,
                params: SearchParams { hnsw_ef: self.hnsw_ef },
            })
            .send()
            .await?;

        let body: SearchResponse = Self::checked(response).await?.json().await?;
        debug!(hits = body.result.len(), "Vector search complete");

        Ok(body
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload.unwrap_or_default();
                let content = payload.content.filter(|c| !c.trim().is_empty())?;
                let origin = match (payload.source, payload.chunk_id) {
                    (Some(source), Some(chunk)) => format!("{}#{}", source, display_id(&chunk)),
                    (Some(source), None) => source,
                    _ => display_id(&point.id),
                };
                Some(ContextItem::vector(content, point.score, origin))
            })
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        let response = self.request(reqwest::Method::GET, "").send().await?;
        let body: CollectionResponse = Self::checked(response).await?.json().await?;
        Ok(body.result.points_count.unwrap_or(0))
    }
}

/// Point ids are integers or UUID strings
fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

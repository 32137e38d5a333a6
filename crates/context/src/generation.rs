//! Streaming text generation
//!
//! Provides:
//! - [`GenerationEngine`], the seam between orchestration and the inference server
//! - An OpenAI-compatible chat completions client (vLLM, TGI, OpenAI) that
//!   parses the SSE body with `eventsource-stream`
//! - A scripted engine for development and tests

use crate::prompt::GenerationRequest;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt};
use hal_common::config::LlmConfig;
use hal_common::errors::{AppError, Result};
use serde::Deserialize;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Ordered answer fragments; the stream ends after the final fragment
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Streaming inference engine
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Start generation; errors before the first fragment are returned here,
    /// errors after it arrive on the stream
    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream>;
}

/// Client for OpenAI-compatible `/v1/chat/completions` streaming
pub struct OpenAiCompatEngine {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatEngine {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl GenerationEngine for OpenAiCompatEngine {
    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| AppError::Generation {
            message: format!("inference request failed: {}", e),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Generation {
                message: format!("inference server returned {}: {}", status, body),
            });
        }

        debug!(model = %request.model, "Generation stream opened");
        Ok(parse_sse(response.bytes_stream()))
    }
}

/// Turn an SSE byte stream into answer fragments
///
/// `data: [DONE]` ends the stream; deltas without content are skipped. The
/// stream ends after the first error it yields.
pub fn parse_sse<S, B, E>(bytes: S) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let fragments = bytes
        .eventsource()
        .take_while(|event| {
            let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
            futures::future::ready(!done)
        })
        .filter_map(|event| async move {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    return Some(Err(AppError::Generation {
                        message: format!("stream interrupted: {}", e),
                    }))
                }
            };

            let chunk: ChunkResponse = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    return Some(Err(AppError::Generation {
                        message: format!("invalid stream chunk: {}", e),
                    }))
                }
            };

            if let Some(error) = chunk.error {
                return Some(Err(AppError::Generation {
                    message: format!("inference server error: {}", error),
                }));
            }

            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .filter(|content| !content.is_empty())
                .map(Ok)
        })
        .scan(false, |failed, fragment: Result<String>| {
            if *failed {
                return futures::future::ready(None);
            }
            *failed = fragment.is_err();
            futures::future::ready(Some(fragment))
        });

    Box::pin(fragments)
}

/// One step of a scripted generation
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Fragment(String),
    /// Pause before the next step
    Delay(Duration),
    /// Fail mid-stream
    Fail(String),
}

/// Deterministic engine replaying a fixed script
///
/// Records the last request and how many fragments the consumer pulled.
pub struct ScriptedEngine {
    steps: Vec<ScriptStep>,
    refuse: Option<String>,
    pulled: Arc<AtomicUsize>,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            refuse: None,
            pulled: Arc::new(AtomicUsize::new(0)),
            last_request: Mutex::new(None),
        }
    }

    /// Emit the given fragments, waiting `delay` before each one
    pub fn answering(fragments: &[&str], delay: Duration) -> Self {
        let steps = fragments
            .iter()
            .flat_map(|f| [ScriptStep::Delay(delay), ScriptStep::Fragment(f.to_string())])
            .collect();
        Self::new(steps)
    }

    /// An engine that rejects every request before streaming
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            refuse: Some(message.into()),
            ..Self::new(Vec::new())
        }
    }

    /// Fragments handed to consumers so far
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    pub async fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().await.clone()
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream> {
        *self.last_request.lock().await = Some(request.clone());

        if let Some(message) = &self.refuse {
            return Err(AppError::Generation {
                message: message.clone(),
            });
        }

        let pulled = self.pulled.clone();
        let fragments = stream::iter(self.steps.clone())
            .then(move |step| {
                let pulled = pulled.clone();
                async move {
                    match step {
                        ScriptStep::Delay(delay) => {
                            tokio::time::sleep(delay).await;
                            None
                        }
                        ScriptStep::Fragment(text) => {
                            pulled.fetch_add(1, Ordering::SeqCst);
                            Some(Ok(text))
                        }
                        ScriptStep::Fail(message) => Some(Err(AppError::Generation { message })),
                    }
                }
            })
            .filter_map(futures::future::ready);

        Ok(Box::pin(fragments))
    }
}

//! Fakes shared by the gateway tests

use crate::state::{AppState, Components};
use async_trait::async_trait;
use hal_common::auth::{hash_password, ConfiguredCredentials, CredentialStore};
use hal_common::config::{AppConfig, AuthConfig, UserCredential};
use hal_common::errors::Result;
use hal_context::{ContextItem, ExternalKnowledge, Lookup, VectorStore};
use std::sync::Arc;
use std::time::Duration;

/// Accepts `alice` / `wonderland`
pub fn credentials() -> Arc<dyn CredentialStore> {
    let auth = AuthConfig {
        users: vec![UserCredential {
            username: "alice".to_string(),
            password_hash: hash_password("wonderland").unwrap(),
        }],
    };
    Arc::new(ConfiguredCredentials::from_config(&auth))
}

/// Default configuration with timeouts short enough for tests
pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.vector.timeout_ms = 500;
    config.external.timeout_ms = 100;
    config.memory.timeout_ms = 100;
    config.generation.stats_interval_ms = 50;
    config.rate_limit.enabled = false;
    config
}

pub fn app(components: Components) -> AppState {
    AppState::new(Arc::new(config()), components).unwrap()
}

/// Vector store returning the same chunks for every query
pub struct FixedVector {
    items: Vec<ContextItem>,
}

impl FixedVector {
    pub fn compilers() -> Self {
        Self {
            items: vec![
                ContextItem::vector(
                    "A compiler translates a high-level language into machine code.",
                    0.92,
                    "compilers.md#0",
                ),
                ContextItem::vector(
                    "Compilation usually runs lexing, parsing, optimisation and code generation.",
                    0.81,
                    "compilers.md#1",
                ),
                ContextItem::vector(
                    "Interpreters execute code without a separate build step.",
                    0.64,
                    "interpreters.md#0",
                ),
            ],
        }
    }
}

#[async_trait]
impl VectorStore for FixedVector {
    async fn search(&self, _text: &str, k: usize) -> Result<Vec<ContextItem>> {
        Ok(self.items.iter().take(k).cloned().collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.items.len() as u64)
    }
}

/// External knowledge that never answers in time
#[derive(Default)]
pub struct SlowExternal;

#[async_trait]
impl ExternalKnowledge for SlowExternal {
    async fn fetch(&self, _lookups: &[Lookup]) -> Result<Vec<ContextItem>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

//! Configuration management for HAL services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml, config/local.toml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Session lifetime and memory bounds
    pub session: SessionConfig,

    /// Credential configuration
    pub auth: AuthConfig,

    /// Vector store configuration
    pub vector: VectorConfig,

    /// Embedding service configuration
    pub embedding: EmbeddingConfig,

    /// External knowledge lookups
    pub external: ExternalConfig,

    /// Conversation memory provider
    pub memory: MemoryConfig,

    /// Context assembly budget
    pub context: ContextConfig,

    /// Inference engine configuration
    pub llm: LlmConfig,

    /// Generation coordinator configuration
    pub generation: GenerationConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// WebSocket endpoint path
    pub ws_path: String,

    /// Bounded channel size between a query task and the socket writer
    pub outbound_buffer: usize,

    /// Shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,

    /// Allowed CORS origins (empty allows any)
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            ws_path: "/ws/hal".to_string(),
            outbound_buffer: 32,
            shutdown_timeout_secs: 30,
            allowed_origins: vec![
                "http://127.0.0.1:1430".to_string(),
                "tauri://localhost".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle for longer than this are destroyed
    pub idle_timeout_secs: u64,

    /// Grace period after a connection drops before its session is destroyed
    pub disconnect_grace_secs: u64,

    /// Maximum number of turns kept in conversation memory
    pub max_turns: usize,

    /// Maximum number of user facts kept per session
    pub max_facts: usize,

    /// Interval of the background reaper
    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            disconnect_grace_secs: 30,
            max_turns: 20,
            max_facts: 16,
            reap_interval_secs: 30,
        }
    }
}

/// A configured user account
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserCredential {
    pub username: String,

    /// Argon2 PHC string
    pub password_hash: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Known accounts
    pub users: Vec<UserCredential>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Vector store base URL
    pub url: String,

    /// API key for the vector store (optional)
    pub api_key: Option<String>,

    /// Collection holding document chunks
    pub collection: String,

    /// Number of nearest chunks to retrieve
    pub top_k: usize,

    /// HNSW search breadth
    pub hnsw_ef: usize,

    /// Retrieval timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            collection: "hal_docs".to_string(),
            top_k: 5,
            hnsw_ef: 50,
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    pub model: String,

    /// Embedding dimension
    pub dimension: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            api_base: Some("http://localhost:8080/v1".to_string()),
            model: "thenlper/gte-large".to_string(),
            dimension: 1024,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExternalConfig {
    /// Enable external knowledge lookups
    pub enabled: bool,

    /// Hard ceiling for the whole external fan-out in milliseconds
    pub timeout_ms: u64,

    /// Maximum snippets taken from each source
    pub per_source_limit: usize,

    /// GitHub REST API base
    pub github_api: String,

    /// arXiv export API base
    pub arxiv_api: String,

    /// MDN search API base
    pub mdn_api: String,

    /// User agent sent to public APIs
    pub user_agent: String,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 3000,
            per_source_limit: 3,
            github_api: "https://api.github.com".to_string(),
            arxiv_api: "https://export.arxiv.org/api".to_string(),
            mdn_api: "https://developer.mozilla.org/api/v1".to_string(),
            user_agent: format!("hal/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of recent turns offered as context
    pub recent_turns: usize,

    /// Memory read timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recent_turns: 5,
            timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Character ceiling of the assembled context
    pub max_chars: usize,

    /// Vector chunks scoring below this are discarded
    pub min_vector_score: f32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: 4096,
            min_vector_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Chat completions endpoint (OpenAI-compatible)
    pub endpoint: String,

    /// Model name
    pub model: String,

    /// API key (optional for local inference servers)
    pub api_key: Option<String>,

    /// Maximum output tokens
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Longest silence allowed between response chunks, in seconds
    pub read_timeout_secs: u64,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/v1/chat/completions".to_string(),
            model: "microsoft/Phi-4-mini-instruct".to_string(),
            api_key: None,
            max_tokens: 1024,
            temperature: 0.5,
            read_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Interval between stats messages while streaming
    pub stats_interval_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logging: bool,

    /// OpenTelemetry OTLP/gRPC endpoint
    pub otel_endpoint: Option<String>,

    /// Metrics port (0 to disable)
    pub metrics_port: u16,

    /// Service name for tracing
    pub service_name: String,

    /// Open spans older than this are evicted
    pub span_ttl_secs: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: true,
            otel_endpoint: None,
            metrics_port: 9090,
            service_name: "hal".to_string(),
            span_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Messages per second (per connection)
    pub messages_per_second: u32,

    /// Burst capacity
    pub burst: u32,

    /// Enable rate limiting
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: 10,
            burst: 20,
            enabled: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8001
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.session.disconnect_grace_secs)
    }

    pub fn vector_timeout(&self) -> Duration {
        Duration::from_millis(self.vector.timeout_ms)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external.timeout_ms)
    }

    pub fn memory_timeout(&self) -> Duration {
        Duration::from_millis(self.memory.timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.generation.stats_interval_ms.max(1))
    }

    pub fn span_ttl(&self) -> Duration {
        Duration::from_secs(self.observability.span_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8001);
        assert_eq!(config.server.ws_path, "/ws/hal");
        assert_eq!(config.vector.collection, "hal_docs");
        assert_eq!(config.context.max_chars, 4096);
    }

    #[test]
    fn test_duration_helpers() {
        let config = AppConfig::default();
        assert_eq!(config.external_timeout(), Duration::from_millis(3000));
        assert_eq!(config.disconnect_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(
                r#"
                [vector]
                top_k = 8

                [[auth.users]]
                username = "alice"
                password_hash = "x"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.vector.top_k, 8);
        assert_eq!(config.vector.collection, "hal_docs");
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.server.port, 8001);
    }
}

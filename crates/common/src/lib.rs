//! HAL Common Library
//!
//! Shared code for the HAL services including:
//! - Wire protocol for the client WebSocket
//! - Session model and concurrent session store
//! - Request trace correlation
//! - Error types and handling
//! - Configuration management
//! - Authentication utilities
//! - Embedding client abstraction
//! - Metrics, logging and OpenTelemetry bootstrap

pub mod auth;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod trace;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, ErrorCode, Result};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{Session, SessionStore, Turn, UserFact};
pub use trace::TraceCorrelator;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

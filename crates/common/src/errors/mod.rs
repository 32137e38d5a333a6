//! Error types for HAL services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for each failure class of the query engine
//! - HTTP status classes that decide the log level
//! - Short user-facing messages for inline `*_response.error` fields
//! - Error codes for client handling

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    EmptyQuery,

    // Authentication errors (2xxx)
    InvalidCredentials,
    UnknownSession,
    NotLoggedIn,

    // State errors (3xxx)
    Busy,
    Cancelled,

    // Protocol errors (4xxx)
    MalformedMessage,
    UnknownMessageType,

    // Rate limiting (6xxx)
    RateLimited,

    // External service errors (8xxx)
    ProviderError,
    ProviderTimeout,
    GenerationError,
    UpstreamError,
    EmbeddingError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::EmptyQuery => 1002,

            ErrorCode::InvalidCredentials => 2001,
            ErrorCode::UnknownSession => 2002,
            ErrorCode::NotLoggedIn => 2003,

            ErrorCode::Busy => 3001,
            ErrorCode::Cancelled => 3002,

            ErrorCode::MalformedMessage => 4001,
            ErrorCode::UnknownMessageType => 4002,

            ErrorCode::RateLimited => 6001,

            ErrorCode::ProviderError => 8001,
            ErrorCode::ProviderTimeout => 8002,
            ErrorCode::GenerationError => 8003,
            ErrorCode::UpstreamError => 8004,
            ErrorCode::EmbeddingError => 8005,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("No question provided")]
    EmptyQuery,

    // Authentication errors
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Unknown or expired session: {id}")]
    UnknownSession { id: String },

    #[error("Not logged in")]
    NotLoggedIn,

    // State errors
    #[error("A query is already in flight for session {session_id}")]
    Busy { session_id: String },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    // Protocol errors
    #[error("Malformed message: {message}")]
    Malformed { message: String },

    #[error("Unknown message type: {message_type}")]
    UnknownMessageType { message_type: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} messages per second")]
    RateLimited { limit: u32 },

    // External service errors
    #[error("Context provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Context provider {provider} timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    #[error("Generation failed: {message}")]
    Generation { message: String },

    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::EmptyQuery => ErrorCode::EmptyQuery,
            AppError::InvalidCredentials => ErrorCode::InvalidCredentials,
            AppError::UnknownSession { .. } => ErrorCode::UnknownSession,
            AppError::NotLoggedIn => ErrorCode::NotLoggedIn,
            AppError::Busy { .. } => ErrorCode::Busy,
            AppError::Cancelled { .. } => ErrorCode::Cancelled,
            AppError::Malformed { .. } => ErrorCode::MalformedMessage,
            AppError::UnknownMessageType { .. } => ErrorCode::UnknownMessageType,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Provider { .. } => ErrorCode::ProviderError,
            AppError::ProviderTimeout { .. } => ErrorCode::ProviderTimeout,
            AppError::Generation { .. } => ErrorCode::GenerationError,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::EmptyQuery
            | AppError::Malformed { .. }
            | AppError::UnknownMessageType { .. } => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::InvalidCredentials
            | AppError::UnknownSession { .. }
            | AppError::NotLoggedIn => StatusCode::UNAUTHORIZED,

            // 409 Conflict
            AppError::Busy { .. } => StatusCode::CONFLICT,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 499-style client cancellation maps onto 408
            AppError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,

            // 500 Internal Server Error
            AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Provider { .. }
            | AppError::Generation { .. }
            | AppError::EmbeddingError { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::ProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Short text safe to show to the connected client.
    ///
    /// Upstream and internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation { message } => message.clone(),
            AppError::EmptyQuery => "No question provided.".to_string(),
            AppError::InvalidCredentials => "Invalid username or password".to_string(),
            AppError::UnknownSession { .. } => "Unknown or expired session".to_string(),
            AppError::NotLoggedIn => "Not logged in".to_string(),
            AppError::Busy { .. } => "A query is already in progress for this session".to_string(),
            AppError::Cancelled { reason } => format!("Query cancelled: {}", reason),
            AppError::Malformed { .. } => "Malformed message".to_string(),
            AppError::UnknownMessageType { message_type } => {
                format!("Unknown message type: {}", message_type)
            }
            AppError::RateLimited { .. } => "Too many messages, slow down".to_string(),
            AppError::Generation { .. } => "Error: answer generation failed".to_string(),
            AppError::Provider { .. }
            | AppError::ProviderTimeout { .. }
            | AppError::EmbeddingError { .. }
            | AppError::HttpClient(_) => "Upstream service unavailable".to_string(),
            AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => "Internal server error".to_string(),
        }
    }

    /// Log this error at a level matching its severity
    pub fn log(&self) {
        let code = self.code();
        if self.is_server_error() {
            tracing::error!(error = %self, code = ?code, "Server error");
        } else {
            tracing::warn!(error = %self, code = ?code, "Client error");
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}

//! Wire protocol spoken over the client WebSocket
//!
//! Every frame is a JSON object with a `type` discriminator and an optional
//! `traceparent`. Decoding is two-step so that an unknown `type` is reported
//! distinctly from a known type with bad fields.

use crate::errors::{AppError, ErrorCode};
use serde::{Deserialize, Serialize};

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Login {
        username: String,
        password: String,
        #[serde(default)]
        traceparent: Option<String>,
    },
    Logout {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        traceparent: Option<String>,
    },
    Query {
        session_id: String,
        query: String,
        #[serde(default)]
        traceparent: Option<String>,
    },
}

impl ClientMessage {
    /// Message types this server understands
    pub const KNOWN_TYPES: &'static [&'static str] = &["login", "logout", "query"];

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Login { .. } => "login",
            ClientMessage::Logout { .. } => "logout",
            ClientMessage::Query { .. } => "query",
        }
    }

    pub fn traceparent(&self) -> Option<&str> {
        match self {
            ClientMessage::Login { traceparent, .. }
            | ClientMessage::Logout { traceparent, .. }
            | ClientMessage::Query { traceparent, .. } => traceparent.as_deref(),
        }
    }
}

/// Decode a text frame into a client message
pub fn decode(text: &str) -> Result<ClientMessage, AppError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| AppError::Malformed {
        message: format!("invalid JSON: {}", e),
    })?;

    let message_type = value
        .as_object()
        .ok_or_else(|| AppError::Malformed {
            message: "message must be a JSON object".to_string(),
        })?
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| AppError::Malformed {
            message: "missing string field `type`".to_string(),
        })?
        .to_string();

    if !ClientMessage::KNOWN_TYPES.contains(&message_type.as_str()) {
        return Err(AppError::UnknownMessageType { message_type });
    }

    serde_json::from_value(value).map_err(|e| AppError::Malformed {
        message: format!("invalid `{}` message: {}", message_type, e),
    })
}

/// Server → client messages
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LoginResponse {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        traceparent: Option<String>,
    },
    LogoutResponse {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        traceparent: Option<String>,
    },
    QueryResponse {
        content: String,
        done: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        traceparent: Option<String>,
    },
    Stats {
        chunk_count: u64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        generation: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        ttfb: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        corpus_chunks: Option<u64>,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        traceparent: Option<String>,
    },
}

impl ServerMessage {
    pub fn login_ok(session_id: String, user_id: String, traceparent: Option<String>) -> Self {
        ServerMessage::LoginResponse {
            session_id: Some(session_id),
            user_id: Some(user_id),
            message: Some("Login successful".to_string()),
            error: None,
            traceparent,
        }
    }

    pub fn login_error(error: &AppError, traceparent: Option<String>) -> Self {
        ServerMessage::LoginResponse {
            session_id: None,
            user_id: None,
            message: None,
            error: Some(error.user_message()),
            traceparent,
        }
    }

    pub fn logout(error: Option<&AppError>, traceparent: Option<String>) -> Self {
        ServerMessage::LogoutResponse {
            error: error.map(AppError::user_message),
            traceparent,
        }
    }

    /// A non-final answer fragment
    pub fn fragment(content: impl Into<String>) -> Self {
        ServerMessage::QueryResponse {
            content: content.into(),
            done: false,
            error: None,
            traceparent: None,
        }
    }

    /// The successful terminal fragment
    pub fn done(traceparent: Option<String>) -> Self {
        ServerMessage::QueryResponse {
            content: String::new(),
            done: true,
            error: None,
            traceparent,
        }
    }

    /// A terminal fragment carrying an error
    pub fn query_error(error: &AppError, traceparent: Option<String>) -> Self {
        let message = error.user_message();
        ServerMessage::QueryResponse {
            content: message.clone(),
            done: true,
            error: Some(message),
            traceparent,
        }
    }

    pub fn error(error: &AppError, traceparent: Option<String>) -> Self {
        ServerMessage::Error {
            code: error.code(),
            message: error.user_message(),
            traceparent,
        }
    }

    /// Whether this message terminates a query stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerMessage::QueryResponse { done: true, .. })
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

//! Health check handlers

use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
    pub open_sessions: usize,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub vector_store: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: hal_common::VERSION.to_string(),
    })
}

/// Readiness probe - the vector store must answer within its timeout
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let start = std::time::Instant::now();

    let count = state.vector.count();
    let vector_check = match tokio::time::timeout(state.config.vector_timeout(), count).await {
        Ok(Ok(_)) => CheckResult {
            status: "up".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            error: None,
        },
        Ok(Err(e)) => CheckResult {
            status: "down".to_string(),
            latency_ms: None,
            error: Some(e.to_string()),
        },
        Err(_) => CheckResult {
            status: "down".to_string(),
            latency_ms: None,
            error: Some("timed out".to_string()),
        },
    };

    let ready = vector_check.status == "up";
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks {
                vector_store: vector_check,
            },
            open_sessions: state.sessions.len(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Components;
    use crate::testing::{self, FixedVector, SlowExternal};
    use hal_context::ScriptedEngine;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ready_reports_vector_store_and_sessions() {
        let app = testing::app(Components {
            credentials: testing::credentials(),
            vector: Arc::new(FixedVector::compilers()),
            external: Arc::new(SlowExternal),
            engine: Arc::new(ScriptedEngine::new(Vec::new())),
        });
        app.sessions.create("alice");

        let (status, Json(body)) = ready(State(app)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "ready");
        assert_eq!(body.checks.vector_store.status, "up");
        assert_eq!(body.open_sessions, 1);
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body.status, "healthy");
    }
}

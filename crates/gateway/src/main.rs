//! HAL Gateway
//!
//! The single entry point for HAL clients.
//! Handles:
//! - WebSocket sessions (login, logout, streaming queries)
//! - Query orchestration across the context providers and the inference engine
//! - Per-connection rate limiting
//! - Observability (logging, metrics, tracing)

mod connection;
mod coordinator;
mod handlers;
mod middleware;
mod reaper;
mod state;
#[cfg(test)]
mod testing;

pub use state::AppState;

use axum::{http::HeaderValue, routing::get, Router};
use hal_common::{config::AppConfig, metrics, telemetry, VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    // Initialize logging and tracing
    let _telemetry = telemetry::init(&config.observability, VERSION)?;
    info!("Starting HAL gateway v{}", VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        metrics::install_exporter(config.observability.metrics_port)?;
    } else {
        metrics::register_metrics();
    }

    let config = Arc::new(config);
    let state = AppState::from_config(config.clone())?;
    let reaper = reaper::spawn(state.clone());

    // Build the router
    let app = create_router(state.clone());

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, ws_path = %config.server.ws_path, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    // Open sockets see the cancelled token and retire their queries
    state.connections.close();
    if tokio::time::timeout(config.shutdown_timeout(), state.connections.wait())
        .await
        .is_err()
    {
        warn!(
            open = state.connections.len(),
            "Shutdown timeout elapsed with connections still open"
        );
    }
    if let Err(e) = reaper.await {
        error!(error = %e, "Reaper task failed");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // Request ID propagation; the outer layer assigns the id before the
    // inner one copies it onto the response
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let cors = cors_layer(&state.config.server.allowed_origins);
    let ws_path = state.config.server.ws_path.clone();

    Router::new()
        .route(&ws_path, get(handlers::ws::ws_handler))
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// CORS policy; an empty origin list allows any origin
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

/// Graceful shutdown signal handler
///
/// Cancels `shutdown` so live connections start retiring their queries.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
    shutdown.cancel();
}

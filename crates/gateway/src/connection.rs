//! Per-connection session and query state machine
//!
//! A connection starts `Unauthenticated`, becomes `Authenticated` on login,
//! moves to `QueryInFlight` while a query runs and back when it retires.
//! Logout resets it from any state. Replies are pushed onto the bounded
//! outbound channel drained by the socket writer.

use crate::coordinator::QueryJob;
use crate::middleware::rate_limit::MessageLimiter;
use crate::AppState;
use futures::{Stream, StreamExt};
use hal_common::auth::LoginRequest;
use hal_common::errors::{AppError, Result};
use hal_common::metrics;
use hal_common::protocol::{self, ClientMessage, ServerMessage};
use hal_common::session::AuthState;
use hal_common::trace::TraceStatus;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How long logout and shutdown wait for a cancelled query to retire
const RETIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// A frame read from the client transport
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated { session_id: String },
    QueryInFlight { session_id: String, query_id: Uuid },
}

impl ConnectionState {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Unauthenticated => None,
            ConnectionState::Authenticated { session_id }
            | ConnectionState::QueryInFlight { session_id, .. } => Some(session_id),
        }
    }
}

pub struct Connection {
    app: AppState,
    phase: ConnectionState,
    outbound: mpsc::Sender<ServerMessage>,
    limiter: MessageLimiter,
    in_flight: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(app: AppState, outbound: mpsc::Sender<ServerMessage>) -> Result<Self> {
        let limiter = MessageLimiter::from_config(&app.config.rate_limit)?;
        Ok(Self {
            app,
            phase: ConnectionState::Unauthenticated,
            outbound,
            limiter,
            in_flight: None,
        })
    }

    /// Drive the connection until the client leaves or the server stops
    pub async fn run<S>(mut self, mut frames: S)
    where
        S: Stream<Item = Inbound> + Unpin,
    {
        let shutdown = self.app.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.drain_for_shutdown().await;
                    break;
                }
                _ = retired(&mut self.in_flight) => self.on_query_retired(),
                frame = frames.next() => match frame {
                    Some(Inbound::Text(text)) => self.handle_text(&text).await,
                    Some(Inbound::Close) | None => break,
                },
            }
        }

        self.on_disconnect();
    }

    /// Handle one text frame from the client
    pub async fn handle_text(&mut self, text: &str) {
        if let Err(e) = self.limiter.check() {
            self.send(ServerMessage::error(&e, None)).await;
            return;
        }

        let message = match protocol::decode(text) {
            Ok(message) => message,
            Err(e) => {
                e.log();
                self.send(ServerMessage::error(&e, None)).await;
                return;
            }
        };

        match message {
            ClientMessage::Login {
                username,
                password,
                traceparent,
            } => self.login(&username, &password, traceparent.as_deref()).await,
            ClientMessage::Logout {
                session_id,
                traceparent,
            } => self.logout(session_id, traceparent.as_deref()).await,
            ClientMessage::Query {
                session_id,
                query,
                traceparent,
            } => self.query(session_id, query, traceparent.as_deref()).await,
        }
    }

    async fn login(&mut self, username: &str, password: &str, traceparent: Option<&str>) {
        let traces = self.app.traces.clone();
        let trace_id = traces.open("login", traceparent);
        traces.annotate(&trace_id, "user.name", username);

        let logged_in = match self.authenticate(username, password).await {
            Ok(user_id) => {
                if let Some(previous) = self.phase.session_id().map(str::to_owned) {
                    self.end_session(&previous).await;
                }

                let session = self.app.sessions.create(&user_id);
                metrics::record_login(true);
                metrics::set_active_sessions(self.app.sessions.len());
                info!(session_id = %session.session_id, user_id = %user_id, "Login succeeded");

                traces.annotate(&trace_id, "login.outcome", "success");
                traces.annotate(&trace_id, "session.id", session.session_id.clone());
                traces.set_status(&trace_id, TraceStatus::Ok);

                self.phase = ConnectionState::Authenticated {
                    session_id: session.session_id.clone(),
                };
                self.send(ServerMessage::login_ok(
                    session.session_id,
                    user_id,
                    Some(trace_id.clone()),
                ))
                .await;
                true
            }
            Err(e) => {
                metrics::record_login(false);
                e.log();
                traces.annotate(&trace_id, "login.outcome", "rejected");
                traces.set_status(&trace_id, TraceStatus::Error(e.user_message()));
                self.send(ServerMessage::login_error(&e, Some(trace_id.clone())))
                    .await;
                false
            }
        };
        traces.close(&trace_id);

        if logged_in {
            if let Some(count) = self.corpus_chunks().await {
                self.send(ServerMessage::Stats {
                    chunk_count: 0,
                    generation: None,
                    ttfb: None,
                    corpus_chunks: Some(count),
                })
                .await;
            }
        }
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        LoginRequest::new(username, password).check()?;
        self.app
            .credentials
            .verify(username, password)
            .await?
            .ok_or(AppError::InvalidCredentials)
    }

    async fn corpus_chunks(&self) -> Option<u64> {
        let count = self.app.vector.count();
        match tokio::time::timeout(self.app.config.vector_timeout(), count).await {
            Ok(Ok(count)) => Some(count),
            Ok(Err(e)) => {
                debug!(error = %e, "Corpus size unavailable");
                None
            }
            Err(_) => {
                debug!("Corpus size lookup timed out");
                None
            }
        }
    }

    async fn logout(&mut self, requested: Option<String>, traceparent: Option<&str>) {
        let traces = self.app.traces.clone();
        let trace_id = traces.open("logout", traceparent);

        let target = self.phase.session_id().map(str::to_owned).or(requested);
        let result = match target {
            Some(session_id) => {
                traces.annotate(&trace_id, "session.id", session_id.clone());
                if self.end_session(&session_id).await {
                    info!(session_id = %session_id, "Logged out");
                    Ok(())
                } else {
                    Err(AppError::UnknownSession { id: session_id })
                }
            }
            None => Err(AppError::NotLoggedIn),
        };
        self.phase = ConnectionState::Unauthenticated;

        match &result {
            Ok(()) => traces.set_status(&trace_id, TraceStatus::Ok),
            Err(e) => {
                e.log();
                traces.set_status(&trace_id, TraceStatus::Error(e.user_message()));
            }
        }
        self.send(ServerMessage::logout(result.as_ref().err(), Some(trace_id.clone())))
            .await;
        traces.close(&trace_id);
    }

    /// Destroy a session and wait for its query to send the terminal fragment
    async fn end_session(&mut self, session_id: &str) -> bool {
        let removed = self.app.sessions.remove(session_id).is_some();
        self.await_retirement().await;
        metrics::set_active_sessions(self.app.sessions.len());
        removed
    }

    async fn query(&mut self, session_id: String, query: String, traceparent: Option<&str>) {
        let received_at = Instant::now();
        let traces = self.app.traces.clone();
        let trace_id = traces.open("query", traceparent);
        traces.annotate(&trace_id, "session.id", session_id.clone());

        if let Err(e) = self.bind_session(&session_id) {
            self.reject_query(&trace_id, e).await;
            return;
        }

        let busy = self
            .app
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.has_query_in_flight());
        if !busy && query.trim().is_empty() {
            traces.annotate(&trace_id, "query.outcome", "empty");
            self.send(ServerMessage::QueryResponse {
                content: AppError::EmptyQuery.user_message(),
                done: true,
                error: None,
                traceparent: Some(trace_id.clone()),
            })
            .await;
            traces.close(&trace_id);
            return;
        }

        match self.app.sessions.begin_query(&session_id) {
            Ok(ticket) => {
                let query_id = ticket.query_id;
                let span = info_span!("query", session_id = %session_id, %query_id);
                self.phase = ConnectionState::QueryInFlight {
                    session_id,
                    query_id,
                };

                let pipeline = self.app.pipeline.clone();
                let outbound = self.outbound.clone();
                let job = QueryJob {
                    ticket,
                    query,
                    trace_id,
                    received_at,
                };
                self.in_flight = Some(tokio::spawn(
                    async move {
                        pipeline.run(job, &outbound).await;
                    }
                    .instrument(span),
                ));
            }
            Err(e @ AppError::Busy { .. }) => {
                metrics::record_busy_rejection();
                warn!(session_id = %session_id, "Query rejected, another one is in flight");
                traces.annotate(&trace_id, "query.outcome", "busy");
                traces.set_status(&trace_id, TraceStatus::Error(e.user_message()));
                self.send(ServerMessage::error(&e, Some(trace_id.clone()))).await;
                traces.close(&trace_id);
            }
            Err(e) => {
                if matches!(e, AppError::UnknownSession { .. }) {
                    self.phase = ConnectionState::Unauthenticated;
                }
                self.reject_query(&trace_id, e).await;
            }
        }
    }

    /// Check that `session_id` belongs to this connection
    ///
    /// A fresh connection may resume a session orphaned by a dropped one.
    fn bind_session(&mut self, session_id: &str) -> Result<()> {
        match self.phase.session_id() {
            Some(own) if own == session_id => Ok(()),
            Some(_) => Err(AppError::UnknownSession {
                id: session_id.to_string(),
            }),
            None => {
                let orphaned = self
                    .app
                    .sessions
                    .get(session_id)
                    .is_some_and(|s| matches!(s.auth_state, AuthState::Detached { .. }));
                if orphaned && self.app.sessions.attach(session_id) {
                    info!(session_id, "Session resumed on a new connection");
                    self.phase = ConnectionState::Authenticated {
                        session_id: session_id.to_string(),
                    };
                    Ok(())
                } else {
                    Err(AppError::UnknownSession {
                        id: session_id.to_string(),
                    })
                }
            }
        }
    }

    async fn reject_query(&self, trace_id: &str, error: AppError) {
        error.log();
        self.app
            .traces
            .set_status(trace_id, TraceStatus::Error(error.user_message()));
        self.send(ServerMessage::query_error(&error, Some(trace_id.to_string())))
            .await;
        self.app.traces.close(trace_id);
    }

    fn on_query_retired(&mut self) {
        self.in_flight = None;
        if let ConnectionState::QueryInFlight { session_id, query_id } = &self.phase {
            debug!(%query_id, "Query retired");
            self.phase = ConnectionState::Authenticated {
                session_id: session_id.clone(),
            };
        }
    }

    async fn await_retirement(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if tokio::time::timeout(RETIRE_TIMEOUT, handle).await.is_err() {
                warn!("Cancelled query did not retire in time");
            }
        }
        self.on_query_retired();
    }

    async fn drain_for_shutdown(&mut self) {
        if let Some(session_id) = self.phase.session_id() {
            self.app.sessions.cancel_query(session_id);
        }
        self.await_retirement().await;
    }

    /// Transport loss: the query dies now, the session after the grace period
    fn on_disconnect(&mut self) {
        if let Some(session_id) = self.phase.session_id() {
            self.app.sessions.detach(session_id);
            info!(session_id, "Connection closed, session detached");
        }
    }

    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("Outbound channel closed, dropping reply");
        }
    }
}

/// Resolves when the in-flight query task ends; pending when idle
async fn retired(in_flight: &mut Option<JoinHandle<()>>) {
    match in_flight {
        Some(handle) => {
            if let Err(e) = handle.await {
                warn!(error = %e, "Query task failed");
            }
        }
        None => std::future::pending().await,
    }
}

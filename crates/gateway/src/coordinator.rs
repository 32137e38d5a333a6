//! Query orchestration and generation streaming
//!
//! Provides:
//! - [`GenerationCoordinator`], which relays engine fragments to the client in
//!   engine order, pausing while the outbound channel is full, and emits
//!   periodic stats on the side
//! - [`QueryPipeline`], which carries one admitted query from analysis to its
//!   single terminal fragment

use futures::StreamExt;
use hal_common::errors::{AppError, Result};
use hal_common::metrics;
use hal_common::protocol::ServerMessage;
use hal_common::session::{FinishOutcome, QueryTicket};
use hal_common::trace::{TraceSpan, TraceStatus};
use hal_common::{SessionStore, TraceCorrelator, Turn};
use hal_context::{
    ContextAssembler, FragmentStream, GenerationEngine, PromptBuilder, QueryAnalyzer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress of one generation stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub fragments: u64,
    /// From query receipt to the first fragment
    pub ttfb: Option<Duration>,
    pub generation: Duration,
}

impl RelayStats {
    pub fn message(&self) -> ServerMessage {
        ServerMessage::Stats {
            chunk_count: self.fragments,
            generation: Some(self.generation.as_secs_f64()),
            ttfb: self.ttfb.map(|d| d.as_secs_f64()),
            corpus_chunks: None,
        }
    }
}

pub struct GenerationCoordinator {
    stats_interval: Duration,
}

impl GenerationCoordinator {
    pub fn new(stats_interval: Duration) -> Self {
        Self {
            stats_interval: stats_interval.max(Duration::from_millis(1)),
        }
    }

    /// Relay fragments until the stream ends, fails, or is cancelled
    ///
    /// Returns the concatenated answer on clean completion. No fragment is
    /// pulled from the engine while the previous one is waiting for room in
    /// `outbound`.
    pub async fn relay(
        &self,
        mut fragments: FragmentStream,
        outbound: &mpsc::Sender<ServerMessage>,
        cancel: &CancellationToken,
        received_at: Instant,
    ) -> (RelayStats, Result<String>) {
        let started = Instant::now();
        let mut stats = RelayStats::default();
        let mut answer = String::new();

        let mut ticker = time::interval_at(started + self.stats_interval, self.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(interrupted()),
                _ = ticker.tick() => {
                    stats.generation = started.elapsed();
                    if let Err(e) = forward(outbound, stats.message(), cancel).await {
                        break Err(e);
                    }
                }
                next = fragments.next() => match next {
                    Some(Ok(fragment)) => {
                        if stats.ttfb.is_none() {
                            stats.ttfb = Some(received_at.elapsed());
                        }
                        stats.fragments += 1;
                        answer.push_str(&fragment);
                        let message = ServerMessage::fragment(fragment);
                        if let Err(e) = forward(outbound, message, cancel).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(std::mem::take(&mut answer)),
                },
            }
        };

        stats.generation = started.elapsed();
        (stats, outcome)
    }
}

/// Send one message, giving up as soon as the query is cancelled
async fn forward(
    outbound: &mpsc::Sender<ServerMessage>,
    message: ServerMessage,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(interrupted()),
        sent = outbound.send(message) => sent.map_err(|_| AppError::Cancelled {
            reason: "connection closed".to_string(),
        }),
    }
}

/// Placeholder; the pipeline replaces it with the actual cause
fn interrupted() -> AppError {
    AppError::Cancelled {
        reason: "interrupted".to_string(),
    }
}

/// One admitted query
#[derive(Debug)]
pub struct QueryJob {
    pub ticket: QueryTicket,
    pub query: String,
    /// Correlation id of the open `query` span
    pub trace_id: String,
    pub received_at: Instant,
}

/// Everything between an admitted query and its terminal fragment
pub struct QueryPipeline {
    pub analyzer: QueryAnalyzer,
    pub assembler: ContextAssembler,
    pub prompts: PromptBuilder,
    pub engine: Arc<dyn GenerationEngine>,
    pub coordinator: GenerationCoordinator,
    pub sessions: Arc<SessionStore>,
    pub traces: Arc<TraceCorrelator>,
    pub shutdown: CancellationToken,
}

impl QueryPipeline {
    /// Run a query to completion and emit exactly one terminal fragment
    ///
    /// The query is retired in the session store before the terminal
    /// fragment is sent, and the span is closed after it. Returns the
    /// closed span.
    pub async fn run(
        &self,
        job: QueryJob,
        outbound: &mpsc::Sender<ServerMessage>,
    ) -> Option<TraceSpan> {
        let QueryJob {
            ticket,
            query,
            trace_id,
            received_at,
        } = job;

        let (stats, outcome) = self.answer(&ticket, &query, &trace_id, outbound, received_at).await;
        let outcome = outcome.map_err(|e| {
            if ticket.cancel.is_cancelled() {
                AppError::Cancelled {
                    reason: self.cancel_reason(&ticket.session_id).to_string(),
                }
            } else {
                e
            }
        });

        let outcome = match outcome {
            Ok(answer) => {
                let facts = self.analyzer.extract_user_facts(&query);
                let turn = Turn::new(query.trim(), answer);
                match self
                    .sessions
                    .finish_query(&ticket.session_id, ticket.query_id, Some(turn), facts)
                {
                    FinishOutcome::Recorded => Ok(()),
                    finished => {
                        debug!(outcome = ?finished, "Session changed before the turn was recorded");
                        Err(AppError::Cancelled {
                            reason: self.cancel_reason(&ticket.session_id).to_string(),
                        })
                    }
                }
            }
            Err(e) => {
                self.sessions
                    .finish_query(&ticket.session_id, ticket.query_id, None, Vec::new());
                Err(e)
            }
        };

        let label = match &outcome {
            Ok(()) => "success",
            Err(AppError::Cancelled { .. }) => "cancelled",
            Err(_) => "error",
        };
        metrics::record_query(
            label,
            received_at.elapsed().as_secs_f64(),
            stats.ttfb.map(|d| d.as_secs_f64()),
            stats.fragments,
        );
        self.traces.annotate(&trace_id, "query.outcome", label);
        self.traces
            .annotate(&trace_id, "query.fragments", stats.fragments.to_string());

        let terminal = match &outcome {
            Ok(()) => {
                info!(
                    fragments = stats.fragments,
                    generation_ms = stats.generation.as_millis() as u64,
                    "Query answered"
                );
                self.traces.set_status(&trace_id, TraceStatus::Ok);
                ServerMessage::done(Some(trace_id.clone()))
            }
            Err(e) => {
                e.log();
                self.traces.annotate(&trace_id, "error", e.to_string());
                self.traces
                    .set_status(&trace_id, TraceStatus::Error(e.user_message()));
                ServerMessage::query_error(e, Some(trace_id.clone()))
            }
        };

        // A slow reader delays the terminal fragment but never loses it; the
        // send only fails once the writer has dropped its receiver.
        let delivered = if stats.fragments > 0 {
            match outbound.send(stats.message()).await {
                Ok(()) => outbound.send(terminal).await.is_ok(),
                Err(_) => false,
            }
        } else {
            outbound.send(terminal).await.is_ok()
        };
        if !delivered {
            debug!("Terminal fragment not delivered, connection is gone");
        }

        self.traces.close(&trace_id)
    }

    async fn answer(
        &self,
        ticket: &QueryTicket,
        query: &str,
        trace_id: &str,
        outbound: &mpsc::Sender<ServerMessage>,
        received_at: Instant,
    ) -> (RelayStats, Result<String>) {
        let analysis = self.analyzer.analyze(query);
        self.traces
            .annotate(trace_id, "query.sentiment", analysis.sentiment.as_str());
        self.traces
            .annotate(trace_id, "query.lookups", analysis.lookups.len().to_string());

        let context = match self
            .assembler
            .assemble(&ticket.session_id, query, &analysis, &ticket.cancel)
            .await
        {
            Ok(context) => context,
            Err(e) => return (RelayStats::default(), Err(e)),
        };
        for (key, value) in context.report.attributes() {
            self.traces.annotate(trace_id, key, value);
        }
        if context.report.all_failed() {
            warn!("Every context provider failed, answering without context");
        }

        let request = self
            .prompts
            .build(query, &context.items, analysis.sentiment, &ticket.user_facts);

        let fragments = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => return (RelayStats::default(), Err(interrupted())),
            started = self.engine.stream(&request) => match started {
                Ok(fragments) => fragments,
                Err(e) => return (RelayStats::default(), Err(e)),
            },
        };

        self.coordinator
            .relay(fragments, outbound, &ticket.cancel, received_at)
            .await
    }

    fn cancel_reason(&self, session_id: &str) -> &'static str {
        if self.shutdown.is_cancelled() {
            "server shutting down"
        } else if !self.sessions.contains(session_id) {
            "session ended"
        } else {
            "connection closed"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Components;
    use crate::testing::{self, FixedVector, SlowExternal};
    use hal_context::{
        ContextItem, PromptSettings, ScriptStep, ScriptedEngine, Sentiment, VectorStore,
    };

    async fn engine_stream(engine: &ScriptedEngine) -> FragmentStream {
        let request =
            PromptBuilder::new(PromptSettings::default()).build("q", &[], Sentiment::Neutral, &[]);
        engine.stream(&request).await.unwrap()
    }

    #[tokio::test]
    async fn test_relay_preserves_order() {
        let engine = ScriptedEngine::answering(&["A ", "compiler ", "translates."], Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(16);
        let coordinator = GenerationCoordinator::new(Duration::from_secs(60));

        let (stats, outcome) = coordinator
            .relay(engine_stream(&engine).await, &tx, &CancellationToken::new(), Instant::now())
            .await;
        drop(tx);

        assert_eq!(outcome.unwrap(), "A compiler translates.");
        assert_eq!(stats.fragments, 3);
        assert!(stats.ttfb.is_some());

        let mut relayed = Vec::new();
        while let Some(message) = rx.recv().await {
            if let ServerMessage::QueryResponse { content, done, .. } = message {
                assert!(!done);
                relayed.push(content);
            }
        }
        assert_eq!(relayed.concat(), "A compiler translates.");
    }

    #[tokio::test]
    async fn test_relay_applies_backpressure() {
        let engine = ScriptedEngine::answering(&["a", "b", "c", "d", "e"], Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(1);
        let coordinator = GenerationCoordinator::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let stream = engine_stream(&engine).await;

        let relay = coordinator.relay(stream, &tx, &cancel, Instant::now());
        tokio::pin!(relay);

        // Nobody reads: one fragment fills the channel, one waits in `send`
        let stalled = tokio::time::timeout(Duration::from_millis(50), &mut relay).await;
        assert!(stalled.is_err());
        assert_eq!(engine.pulled(), 2);

        let (_, outcome) = tokio::join!(relay, async {
            let mut seen = 0;
            while rx.recv().await.is_some() {
                seen += 1;
                if seen == 5 {
                    break;
                }
            }
        })
        .0;
        assert_eq!(outcome.unwrap(), "abcde");
        assert_eq!(engine.pulled(), 5);
    }

    #[tokio::test]
    async fn test_relay_stops_on_cancel() {
        let engine = ScriptedEngine::answering(&["slow", "never"], Duration::from_secs(30));
        let (tx, _rx) = mpsc::channel(16);
        let coordinator = GenerationCoordinator::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (stats, outcome) = coordinator
            .relay(engine_stream(&engine).await, &tx, &cancel, Instant::now())
            .await;
        assert!(matches!(outcome, Err(AppError::Cancelled { .. })));
        assert_eq!(stats.fragments, 0);
        assert_eq!(engine.pulled(), 0);
    }

    #[tokio::test]
    async fn test_relay_reports_engine_error() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::Fragment("partial".into()),
            ScriptStep::Fail("engine crashed".into()),
        ]);
        let (tx, _rx) = mpsc::channel(16);
        let coordinator = GenerationCoordinator::new(Duration::from_secs(60));

        let (stats, outcome) = coordinator
            .relay(engine_stream(&engine).await, &tx, &CancellationToken::new(), Instant::now())
            .await;
        assert!(matches!(outcome, Err(AppError::Generation { .. })));
        assert_eq!(stats.fragments, 1);
    }

    #[tokio::test]
    async fn test_pipeline_records_external_degradation() {
        let engine = Arc::new(ScriptedEngine::answering(
            &["A compiler ", "translates."],
            Duration::ZERO,
        ));
        let app = testing::app(Components {
            credentials: testing::credentials(),
            vector: Arc::new(FixedVector::compilers()),
            external: Arc::new(SlowExternal),
            engine: engine.clone(),
        });
        let session = app.sessions.create("alice");
        let ticket = app.sessions.begin_query(&session.session_id).unwrap();
        let (tx, mut rx) = mpsc::channel(32);
        let job = QueryJob {
            ticket,
            query: "What is the latest research paper on compilers?".to_string(),
            trace_id: app.traces.open("query", None),
            received_at: Instant::now(),
        };

        let span = app.pipeline.run(job, &tx).await.unwrap();
        assert_eq!(span.attributes["context.degraded"], "external");
        assert!(span.attributes["context.external"].starts_with("timeout"));
        assert_eq!(span.attributes["query.outcome"], "success");
        assert_eq!(span.status, TraceStatus::Ok);
        assert!(app.traces.is_empty());

        drop(tx);
        let mut last = None;
        while let Some(message) = rx.recv().await {
            last = Some(message);
        }
        assert!(last.unwrap().is_terminal());

        let turns = app.sessions.recent_turns(&session.session_id, 5).unwrap();
        assert_eq!(turns[0].answer_text, "A compiler translates.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_delivers_terminal_to_slow_reader() {
        let engine = Arc::new(ScriptedEngine::answering(&["a", "b", "c"], Duration::ZERO));
        let app = testing::app(Components {
            credentials: testing::credentials(),
            vector: Arc::new(FixedVector::compilers()),
            external: Arc::new(SlowExternal),
            engine,
        });
        let session = app.sessions.create("alice");
        let ticket = app.sessions.begin_query(&session.session_id).unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let job = QueryJob {
            ticket,
            query: "What does a compiler do?".to_string(),
            trace_id: app.traces.open("query", None),
            received_at: Instant::now(),
        };

        // The client stays connected but reads nothing for 12 seconds
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            let mut seen = Vec::new();
            while let Some(message) = rx.recv().await {
                seen.push(message);
            }
            seen
        });

        let span = app.pipeline.run(job, &tx).await.unwrap();
        drop(tx);
        let seen = reader.await.unwrap();

        assert_eq!(span.attributes["query.outcome"], "success");
        assert_eq!(seen.iter().filter(|m| m.is_terminal()).count(), 1);
        assert!(seen.last().unwrap().is_terminal());
    }

    struct BrokenVector;

    #[async_trait::async_trait]
    impl VectorStore for BrokenVector {
        async fn search(&self, _text: &str, _k: usize) -> Result<Vec<ContextItem>> {
            Err(AppError::Provider {
                provider: "vector".to_string(),
                message: "connection refused".to_string(),
            })
        }

        async fn count(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_pipeline_answers_without_context() {
        let engine = Arc::new(ScriptedEngine::answering(&["I don't know."], Duration::ZERO));
        let app = testing::app(Components {
            credentials: testing::credentials(),
            vector: Arc::new(BrokenVector),
            external: Arc::new(SlowExternal),
            engine: engine.clone(),
        });
        let session = app.sessions.create("alice");
        let ticket = app.sessions.begin_query(&session.session_id).unwrap();
        let (tx, _rx) = mpsc::channel(32);
        let job = QueryJob {
            ticket,
            query: "Tell me about ownership".to_string(),
            trace_id: app.traces.open("query", None),
            received_at: Instant::now(),
        };

        let span = app.pipeline.run(job, &tx).await.unwrap();
        assert_eq!(span.attributes["context.degraded"], "vector");
        assert_eq!(span.attributes["context.external"], "skipped");

        let request = engine.last_request().await.unwrap();
        assert!(request.system_prompt().unwrap().ends_with(hal_context::prompt::NO_CONTEXT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_emits_periodic_stats() {
        let engine = ScriptedEngine::answering(&["a", "b", "c"], Duration::from_millis(400));
        let (tx, mut rx) = mpsc::channel(32);
        let coordinator = GenerationCoordinator::new(Duration::from_millis(500));

        let (stats, outcome) = coordinator
            .relay(engine_stream(&engine).await, &tx, &CancellationToken::new(), Instant::now())
            .await;
        drop(tx);
        assert!(outcome.is_ok());
        assert_eq!(stats.fragments, 3);

        let mut stats_seen = 0;
        while let Some(message) = rx.recv().await {
            if let ServerMessage::Stats { chunk_count, .. } = message {
                assert!(chunk_count <= 3);
                stats_seen += 1;
            }
        }
        assert_eq!(stats_seen, 2);
    }
}

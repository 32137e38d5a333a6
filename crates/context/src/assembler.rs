//! Context Assembler - Fans out to the context providers and merges results
//!
//! Provides:
//! - Concurrent vector, external and memory calls, each under its own timeout
//! - Graceful degradation when a provider fails or times out
//! - Deterministic merge order (vector by score, external, memory)
//! - Character budget enforcement

use crate::providers::{ContextItem, ExternalKnowledge, MemoryReader, VectorStore};
use crate::query_analyzer::QueryAnalysis;
use hal_common::config::AppConfig;
use hal_common::errors::{AppError, Result};
use hal_common::metrics;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Assembler configuration
#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    /// Nearest chunks requested from the vector store
    pub top_k: usize,

    /// Conversation turns offered as memory
    pub recent_turns: usize,

    pub vector_timeout: Duration,
    pub external_timeout: Duration,
    pub memory_timeout: Duration,

    /// Character ceiling of the merged context
    pub max_chars: usize,

    /// Vector chunks scoring below this are discarded
    pub min_vector_score: f32,
}

impl AssemblerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            top_k: config.vector.top_k,
            recent_turns: config.memory.recent_turns,
            vector_timeout: config.vector_timeout(),
            external_timeout: config.external_timeout(),
            memory_timeout: config.memory_timeout(),
            max_chars: config.context.max_chars,
            min_vector_score: config.context.min_vector_score,
        }
    }
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// How one provider call settled
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutcome {
    Succeeded { items: usize },
    /// Not called (nothing to look up)
    Skipped,
    Failed { message: String },
    TimedOut { after: Duration },
}

impl ProviderOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ProviderOutcome::Failed { .. } | ProviderOutcome::TimedOut { .. })
    }

    fn failure_kind(&self) -> Option<&'static str> {
        match self {
            ProviderOutcome::Failed { .. } => Some("error"),
            ProviderOutcome::TimedOut { .. } => Some("timeout"),
            _ => None,
        }
    }

    /// Short form used as a trace attribute value
    pub fn describe(&self) -> String {
        match self {
            ProviderOutcome::Succeeded { items } => format!("ok ({} items)", items),
            ProviderOutcome::Skipped => "skipped".to_string(),
            ProviderOutcome::Failed { message } => format!("error: {}", message),
            ProviderOutcome::TimedOut { after } => format!("timeout after {}ms", after.as_millis()),
        }
    }
}

/// Per-query record of how context was assembled
#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub vector: ProviderOutcome,
    pub external: ProviderOutcome,
    pub memory: ProviderOutcome,

    /// Vector chunks removed by the budget
    pub dropped_vector: usize,

    /// Memory turns removed by the budget
    pub dropped_memory: usize,

    /// Vector chunks discarded as duplicates
    pub duplicates: usize,
}

impl AssemblyReport {
    pub fn external_degraded(&self) -> bool {
        self.external.is_failure()
    }

    /// Every provider that was called failed
    pub fn all_failed(&self) -> bool {
        let called: Vec<&ProviderOutcome> = [&self.vector, &self.external, &self.memory]
            .into_iter()
            .filter(|o| !matches!(o, ProviderOutcome::Skipped))
            .collect();
        !called.is_empty() && called.iter().all(|o| o.is_failure())
    }

    /// Names of providers that failed or timed out
    pub fn degraded_providers(&self) -> Vec<&'static str> {
        [
            ("vector", &self.vector),
            ("external", &self.external),
            ("memory", &self.memory),
        ]
        .into_iter()
        .filter(|(_, o)| o.is_failure())
        .map(|(name, _)| name)
        .collect()
    }

    /// Key/value pairs recorded on the query span
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut attrs = vec![
            ("context.vector", self.vector.describe()),
            ("context.external", self.external.describe()),
            ("context.memory", self.memory.describe()),
        ];
        let degraded = self.degraded_providers();
        if !degraded.is_empty() {
            attrs.push(("context.degraded", degraded.join(",")));
        }
        if self.all_failed() {
            attrs.push(("context.all_failed", "true".to_string()));
        }
        if self.dropped_vector + self.dropped_memory > 0 {
            attrs.push((
                "context.truncated",
                format!("vector={} memory={}", self.dropped_vector, self.dropped_memory),
            ));
        }
        attrs
    }
}

/// Merged context for one query
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub items: Vec<ContextItem>,
    pub report: AssemblyReport,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn char_len(&self) -> usize {
        self.items.iter().map(ContextItem::char_len).sum()
    }
}

pub struct ContextAssembler {
    vector: Arc<dyn VectorStore>,
    external: Arc<dyn ExternalKnowledge>,
    memory: Arc<dyn MemoryReader>,
    settings: AssemblerSettings,
}

impl ContextAssembler {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        external: Arc<dyn ExternalKnowledge>,
        memory: Arc<dyn MemoryReader>,
        settings: AssemblerSettings,
    ) -> Self {
        Self {
            vector,
            external,
            memory,
            settings,
        }
    }

    pub fn settings(&self) -> &AssemblerSettings {
        &self.settings
    }

    /// Gather and merge context for a query
    ///
    /// Waits for all three providers to settle. Provider failures are
    /// recorded in the report and never returned; the only error is
    /// cancellation.
    pub async fn assemble(
        &self,
        session_id: &str,
        query: &str,
        analysis: &QueryAnalysis,
        cancel: &CancellationToken,
    ) -> Result<AssembledContext> {
        let settings = &self.settings;

        let vector = settle("vector", settings.vector_timeout, async {
            self.vector.search(query, settings.top_k).await
        });

        let external = async {
            if analysis.lookups.is_empty() {
                return (Vec::new(), ProviderOutcome::Skipped);
            }
            settle("external", settings.external_timeout, async {
                self.external.fetch(&analysis.lookups).await
            })
            .await
        };

        let memory = async {
            if settings.recent_turns == 0 {
                return (Vec::new(), ProviderOutcome::Skipped);
            }
            let (turns, outcome) = settle("memory", settings.memory_timeout, async {
                self.memory.recent_turns(session_id, settings.recent_turns).await
            })
            .await;
            (turns.iter().map(ContextItem::memory).collect::<Vec<_>>(), outcome)
        };

        let settled = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled {
                    reason: "query cancelled during context assembly".to_string(),
                });
            }
            settled = async { tokio::join!(vector, external, memory) } => settled,
        };
        let (
            (vector_items, vector_outcome),
            (external_items, external_outcome),
            (memory_items, memory_outcome),
        ) = settled;

        if let ProviderOutcome::Failed { message } = &vector_outcome {
            error!(
                session_id,
                error = %message,
                "Vector retrieval failed, answering without corpus context"
            );
        }
        if let ProviderOutcome::TimedOut { after } = &vector_outcome {
            error!(
                session_id,
                timeout_ms = after.as_millis() as u64,
                "Vector retrieval timed out, answering without corpus context"
            );
        }
        if external_outcome.is_failure() {
            warn!(
                session_id,
                outcome = %external_outcome.describe(),
                "External knowledge degraded"
            );
        }
        if memory_outcome.is_failure() {
            warn!(
                session_id,
                outcome = %memory_outcome.describe(),
                "Conversation memory unavailable"
            );
        }

        let merged = merge(
            vector_items,
            external_items,
            memory_items,
            settings.max_chars,
            settings.min_vector_score,
        );

        let report = AssemblyReport {
            vector: vector_outcome,
            external: external_outcome,
            memory: memory_outcome,
            dropped_vector: merged.dropped_vector,
            dropped_memory: merged.dropped_memory,
            duplicates: merged.duplicates,
        };

        debug!(
            session_id,
            items = merged.items.len(),
            degraded = ?report.degraded_providers(),
            "Context assembled"
        );

        Ok(AssembledContext {
            items: merged.items,
            report,
        })
    }
}

/// Run one provider call under its timeout and record the outcome
async fn settle<T, F>(
    provider: &'static str,
    timeout: Duration,
    call: F,
) -> (Vec<T>, ProviderOutcome)
where
    F: Future<Output = Result<Vec<T>>>,
{
    let started = Instant::now();
    let (items, outcome) = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(items)) => {
            let count = items.len();
            (items, ProviderOutcome::Succeeded { items: count })
        }
        Ok(Err(e)) => (
            Vec::new(),
            ProviderOutcome::Failed {
                message: e.to_string(),
            },
        ),
        Err(_) => (Vec::new(), ProviderOutcome::TimedOut { after: timeout }),
    };
    metrics::record_provider(provider, started.elapsed().as_secs_f64(), outcome.failure_kind());
    (items, outcome)
}

/// Result of merging provider outputs
#[derive(Debug, Clone)]
pub struct Merged {
    pub items: Vec<ContextItem>,
    pub dropped_vector: usize,
    pub dropped_memory: usize,
    pub duplicates: usize,
}

/// Merge provider outputs into one ordered sequence within the budget
///
/// Vector chunks come first by descending score (stable, so ties keep store
/// order), then external snippets in fetch order, then memory turns oldest
/// first. Over budget, the lowest-ranked vector chunk goes first, then the
/// oldest memory turn. External snippets are never dropped.
pub fn merge(
    vector: Vec<ContextItem>,
    external: Vec<ContextItem>,
    memory: Vec<ContextItem>,
    max_chars: usize,
    min_vector_score: f32,
) -> Merged {
    let mut vector: Vec<ContextItem> = vector
        .into_iter()
        .filter(|item| item.relevance_score >= min_vector_score)
        .collect();
    vector.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

    let before = vector.len();
    let mut seen = HashSet::new();
    vector.retain(|item| seen.insert(content_digest(&item.content)));
    let duplicates = before - vector.len();

    let mut memory = memory;
    let mut total: usize = vector
        .iter()
        .chain(external.iter())
        .chain(memory.iter())
        .map(ContextItem::char_len)
        .sum();

    let mut dropped_vector = 0;
    let mut dropped_memory = 0;
    while total > max_chars {
        if let Some(item) = vector.pop() {
            total -= item.char_len();
            dropped_vector += 1;
        } else if !memory.is_empty() {
            let item = memory.remove(0);
            total -= item.char_len();
            dropped_memory += 1;
        } else {
            break;
        }
    }

    let mut items = vector;
    items.extend(external);
    items.extend(memory);

    Merged {
        items,
        dropped_vector,
        dropped_memory,
        duplicates,
    }
}

fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.trim().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ContextSource;
    use crate::query_analyzer::{ExternalSource, Lookup};
    use async_trait::async_trait;
    use hal_common::Turn;

    struct FixedVector(Result<Vec<ContextItem>>);

    #[async_trait]
    impl VectorStore for FixedVector {
        async fn search(&self, _text: &str, k: usize) -> Result<Vec<ContextItem>> {
            match &self.0 {
                Ok(items) => Ok(items.iter().take(k).cloned().collect()),
                Err(_) => Err(AppError::Provider {
                    provider: "vector".into(),
                    message: "down".into(),
                }),
            }
        }

        async fn count(&self) -> Result<u64> {
            Ok(0)
        }
    }

    /// Sleeps before answering
    struct SlowExternal(Duration);

    #[async_trait]
    impl ExternalKnowledge for SlowExternal {
        async fn fetch(&self, _lookups: &[Lookup]) -> Result<Vec<ContextItem>> {
            tokio::time::sleep(self.0).await;
            Ok(vec![ContextItem::external("late snippet", 1.0, "https://example.org")])
        }
    }

    struct FixedMemory(Vec<Turn>);

    #[async_trait]
    impl MemoryReader for FixedMemory {
        async fn recent_turns(&self, _session_id: &str, n: usize) -> Result<Vec<Turn>> {
            let skip = self.0.len().saturating_sub(n);
            Ok(self.0[skip..].to_vec())
        }
    }

    fn chunks() -> Vec<ContextItem> {
        vec![
            ContextItem::vector("A compiler translates source code.", 0.7, "c1"),
            ContextItem::vector("Compilers have front ends and back ends.", 0.9, "c2"),
            ContextItem::vector("Linkers combine object files.", 0.7, "c3"),
        ]
    }

    fn analysis_with_lookup() -> QueryAnalysis {
        QueryAnalysis {
            lookups: vec![Lookup { source: ExternalSource::Github, term: "compiler".into() }],
            ..QueryAnalysis::default()
        }
    }

    fn assembler(vector: FixedVector, external: SlowExternal) -> ContextAssembler {
        ContextAssembler::new(
            Arc::new(vector),
            Arc::new(external),
            Arc::new(FixedMemory(vec![Turn::new("q0", "a0"), Turn::new("q1", "a1")])),
            AssemblerSettings::default(),
        )
    }

    #[test]
    fn test_merge_orders_by_score_with_stable_ties() {
        let merged = merge(
            chunks(),
            vec![ContextItem::external("snippet", 1.0, "x")],
            vec![ContextItem::memory(&Turn::new("q", "a"))],
            10_000,
            0.0,
        );
        let origins: Vec<_> = merged.items.iter().map(|i| i.origin.as_str()).collect();
        assert_eq!(&origins[..4], &["c2", "c1", "c3", "x"]);
        assert_eq!(merged.items[4].source, ContextSource::Memory);
    }

    #[test]
    fn test_merge_budget_drops_vector_then_memory_never_external() {
        let external = vec![ContextItem::external("e".repeat(50), 1.0, "ext")];
        let memory = vec![
            ContextItem::memory(&Turn::new("old", "x".repeat(20))),
            ContextItem::memory(&Turn::new("new", "y".repeat(20))),
        ];
        let vector = vec![
            ContextItem::vector("v".repeat(30), 0.9, "high"),
            ContextItem::vector("w".repeat(30), 0.1, "low"),
        ];

        // Room for everything but the low chunk
        let merged = merge(vector.clone(), external.clone(), memory.clone(), 150, 0.0);
        assert_eq!(merged.dropped_vector, 1);
        assert!(merged.items.iter().any(|i| i.origin == "high"));

        // Room for external and one memory turn only
        let merged = merge(vector, external.clone(), memory, 80, 0.0);
        assert_eq!(merged.dropped_vector, 2);
        assert_eq!(merged.dropped_memory, 1);
        assert_eq!(merged.items.len(), 2);
        assert_eq!(merged.items[0].origin, "ext");
        assert!(merged.items[1].content.starts_with("Q: new"));

        // External alone exceeds the budget and is still kept
        let merged = merge(Vec::new(), external, Vec::new(), 10, 0.0);
        assert_eq!(merged.items.len(), 1);
    }

    #[test]
    fn test_merge_dedups_and_filters() {
        let mut vector = chunks();
        vector.push(ContextItem::vector("A compiler translates source code. ", 0.5, "dup"));
        vector.push(ContextItem::vector("barely related", 0.05, "weak"));

        let merged = merge(vector, Vec::new(), Vec::new(), 10_000, 0.1);
        assert_eq!(merged.duplicates, 1);
        assert!(merged.items.iter().all(|i| i.origin != "dup" && i.origin != "weak"));
        assert_eq!(merged.items.len(), 3);
    }

    proptest::proptest! {
        #[test]
        fn prop_merge_keeps_externals_and_order(
            scores in proptest::collection::vec(0.0f32..1.0, 0..12),
            lens in proptest::collection::vec(1usize..80, 12),
            externals in 0usize..3,
            turns in 0usize..4,
            max_chars in 0usize..600,
        ) {
            let vector: Vec<ContextItem> = scores
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let content = format!("{}{}", i, "v".repeat(lens[i]));
                    ContextItem::vector(content, *s, format!("c{}", i))
                })
                .collect();
            let external: Vec<ContextItem> = (0..externals)
                .map(|i| ContextItem::external("e".repeat(40), 1.0, format!("e{}", i)))
                .collect();
            let memory: Vec<ContextItem> = (0..turns)
                .map(|i| ContextItem::memory(&Turn::new(format!("q{}", i), "a")))
                .collect();

            let merged = merge(vector, external, memory, max_chars, 0.0);
            let items = &merged.items;

            // Every external survives, in fetch order
            let ext: Vec<_> = items
                .iter()
                .filter(|i| i.source == ContextSource::External)
                .map(|i| i.origin.clone())
                .collect();
            let expected: Vec<_> = (0..externals).map(|i| format!("e{}", i)).collect();
            proptest::prop_assert_eq!(ext, expected);

            // Vector chunks stay sorted by descending score
            let vs: Vec<f32> = items
                .iter()
                .filter(|i| i.source == ContextSource::Vector)
                .map(|i| i.relevance_score)
                .collect();
            proptest::prop_assert!(vs.windows(2).all(|w| w[0] >= w[1]));

            // Sources appear grouped: vector, external, memory
            let rank = |s: ContextSource| match s {
                ContextSource::Vector => 0,
                ContextSource::External => 1,
                ContextSource::Memory => 2,
            };
            let grouped = items.windows(2).all(|w| rank(w[0].source) <= rank(w[1].source));
            proptest::prop_assert!(grouped);

            // Over budget only when externals alone exceed it
            let total: usize = items.iter().map(ContextItem::char_len).sum();
            let ext_total = 40 * externals;
            proptest::prop_assert!(total <= max_chars.max(ext_total));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_timeout_degrades_gracefully() {
        let assembler = assembler(FixedVector(Ok(chunks())), SlowExternal(Duration::from_secs(60)));
        let ctx = assembler
            .assemble(
                "s1",
                "What is a compiler?",
                &analysis_with_lookup(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(ctx.report.external, ProviderOutcome::TimedOut { .. }));
        assert!(ctx.report.external_degraded());
        assert!(!ctx.report.all_failed());
        assert_eq!(ctx.items.iter().filter(|i| i.source == ContextSource::Vector).count(), 3);
        assert_eq!(ctx.items.iter().filter(|i| i.source == ContextSource::Memory).count(), 2);
        assert!(ctx
            .report
            .attributes()
            .iter()
            .any(|(k, v)| *k == "context.degraded" && v.contains("external")));
    }

    #[tokio::test]
    async fn test_no_lookups_skips_external() {
        let assembler = assembler(FixedVector(Ok(chunks())), SlowExternal(Duration::ZERO));
        let ctx = assembler
            .assemble(
                "s1",
                "What is a compiler?",
                &QueryAnalysis::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(ctx.report.external, ProviderOutcome::Skipped);
        assert!(ctx.report.degraded_providers().is_empty());
    }

    #[tokio::test]
    async fn test_vector_failure_is_not_fatal() {
        let assembler = assembler(
            FixedVector(Err(AppError::Internal { message: String::new() })),
            SlowExternal(Duration::ZERO),
        );
        let ctx = assembler
            .assemble("s1", "q", &analysis_with_lookup(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(ctx.report.vector.is_failure());
        assert_eq!(ctx.items[0].source, ContextSource::External);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_failing_yields_empty_context() {
        struct BrokenMemory;

        #[async_trait]
        impl MemoryReader for BrokenMemory {
            async fn recent_turns(&self, id: &str, _n: usize) -> Result<Vec<Turn>> {
                Err(AppError::UnknownSession { id: id.to_string() })
            }
        }

        let assembler = ContextAssembler::new(
            Arc::new(FixedVector(Err(AppError::Internal { message: String::new() }))),
            Arc::new(SlowExternal(Duration::from_secs(60))),
            Arc::new(BrokenMemory),
            AssemblerSettings::default(),
        );
        let ctx = assembler
            .assemble("s1", "q", &analysis_with_lookup(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(ctx.is_empty());
        assert!(ctx.report.all_failed());
        assert!(ctx
            .report
            .attributes()
            .contains(&("context.all_failed", "true".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_fan_out() {
        let assembler = assembler(FixedVector(Ok(chunks())), SlowExternal(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = assembler
            .assemble("s1", "q", &analysis_with_lookup(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled { .. }));
    }
}

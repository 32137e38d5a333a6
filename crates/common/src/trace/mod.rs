//! Request-scoped trace correlation
//!
//! Provides:
//! - W3C `traceparent` parsing and formatting
//! - [`TraceCorrelator`], a process-wide table of open spans keyed by the
//!   traceparent string echoed to the client
//!
//! Spans are created through the global OpenTelemetry tracer, so they reach
//! the collector whenever an exporter is installed. Without one, ids are
//! still minted locally and the table behaves the same. Lookups of unknown
//! ids are no-ops: tracing never blocks a request.

use crate::metrics;
use dashmap::DashMap;
use opentelemetry::trace::{
    Span, SpanContext, SpanId, Status, TraceContextExt, TraceFlags, TraceId, TraceState, Tracer,
};
use opentelemetry::{global, Context, KeyValue};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Name under which correlator spans are reported
const TRACER_NAME: &str = "hal";

/// Parsed W3C trace-context header (`version-traceid-spanid-flags`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub sampled: bool,
}

impl TraceParent {
    /// Parse a `traceparent` value; malformed or all-zero ids yield `None`
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if !is_hex(version, 2) || version == "ff" {
            return None;
        }
        // Version 00 has exactly four fields
        if version == "00" && parts.next().is_some() {
            return None;
        }
        if !is_hex(trace_id, 32) || !is_hex(span_id, 16) || !is_hex(flags, 2) {
            return None;
        }

        let trace_id = TraceId::from_hex(trace_id).ok()?;
        let span_id = SpanId::from_hex(span_id).ok()?;
        if trace_id == TraceId::INVALID || span_id == SpanId::INVALID {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;

        Some(Self {
            trace_id,
            span_id,
            sampled: flags & 0x01 == 0x01,
        })
    }

    fn flags(&self) -> TraceFlags {
        if self.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        }
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            self.flags().to_u8()
        )
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Final status of a span
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TraceStatus {
    #[default]
    Unset,
    Ok,
    Error(String),
}

/// Server-side view of one request span
#[derive(Debug, Clone)]
pub struct TraceSpan {
    pub name: String,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub attributes: BTreeMap<String, String>,
    pub status: TraceStatus,
    pub opened_at: Instant,
}

struct OpenSpan {
    record: TraceSpan,
    span: global::BoxedSpan,
}

/// Table of open request spans
pub struct TraceCorrelator {
    spans: DashMap<String, OpenSpan>,
}

impl Default for TraceCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceCorrelator {
    pub fn new() -> Self {
        Self {
            spans: DashMap::new(),
        }
    }

    /// Open a span for one request
    ///
    /// When `client_traceparent` is a valid header the span joins the
    /// client's trace; otherwise a new root trace is started. Returns the
    /// traceparent of the new span, which doubles as its correlation id.
    pub fn open(&self, name: &str, client_traceparent: Option<&str>) -> String {
        let parent = client_traceparent.and_then(TraceParent::parse);
        if client_traceparent.is_some() && parent.is_none() {
            debug!(name, "Ignoring malformed traceparent from client");
        }

        let tracer = global::tracer(TRACER_NAME);
        let cx = match parent {
            Some(p) => Context::new().with_remote_span_context(SpanContext::new(
                p.trace_id,
                p.span_id,
                p.flags(),
                true,
                TraceState::default(),
            )),
            None => Context::new(),
        };
        let span = tracer.start_with_context(name.to_string(), &cx);

        let ids = Self::span_ids(span.span_context(), parent);
        let id = ids.to_string();

        let open = OpenSpan {
            record: TraceSpan {
                name: name.to_string(),
                trace_id: ids.trace_id,
                span_id: ids.span_id,
                attributes: BTreeMap::new(),
                status: TraceStatus::Unset,
                opened_at: Instant::now(),
            },
            span,
        };

        self.spans.insert(id.clone(), open);
        metrics::set_open_spans(self.spans.len());
        debug!(trace_id = %ids.trace_id, span = name, "Span opened");
        id
    }

    /// Ids for a new span: the exporter's when it minted real ones,
    /// otherwise fresh random ids inside the parent trace
    fn span_ids(exported: &SpanContext, parent: Option<TraceParent>) -> TraceParent {
        let minted = exported.is_valid()
            && parent.map_or(true, |p| p.span_id != exported.span_id());
        if minted {
            return TraceParent {
                trace_id: exported.trace_id(),
                span_id: exported.span_id(),
                sampled: exported.is_sampled(),
            };
        }

        let mut rng = rand::thread_rng();
        let trace_id = match parent {
            Some(p) => p.trace_id,
            None => TraceId::from_bytes(nonzero_bytes(&mut rng)),
        };
        TraceParent {
            trace_id,
            span_id: SpanId::from_bytes(nonzero_bytes(&mut rng)),
            sampled: parent.map_or(true, |p| p.sampled),
        }
    }

    /// Attach an attribute; unknown ids are ignored
    pub fn annotate(&self, id: &str, key: &str, value: impl Into<String>) {
        if let Some(mut open) = self.spans.get_mut(id) {
            let value = value.into();
            open.span.set_attribute(KeyValue::new(key.to_string(), value.clone()));
            open.record.attributes.insert(key.to_string(), value);
        }
    }

    /// Set the span status; unknown ids are ignored
    pub fn set_status(&self, id: &str, status: TraceStatus) {
        if let Some(mut open) = self.spans.get_mut(id) {
            open.record.status = status;
        }
    }

    /// Snapshot of an open span
    pub fn get(&self, id: &str) -> Option<TraceSpan> {
        self.spans.get(id).map(|open| open.record.clone())
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.spans.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// End and evict a span; returns its final state the first time only
    pub fn close(&self, id: &str) -> Option<TraceSpan> {
        let (_, mut open) = self.spans.remove(id)?;
        metrics::set_open_spans(self.spans.len());

        let status = match &open.record.status {
            TraceStatus::Unset => Status::Unset,
            TraceStatus::Ok => Status::Ok,
            TraceStatus::Error(message) => Status::error(message.clone()),
        };
        open.span.set_status(status);
        open.span.end();

        debug!(
            trace_id = %open.record.trace_id,
            span = %open.record.name,
            elapsed_ms = open.record.opened_at.elapsed().as_millis() as u64,
            "Span closed"
        );
        Some(open.record)
    }

    /// Close spans older than `ttl`; returns how many were evicted
    pub fn evict_stale(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .spans
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.record.opened_at) >= ttl)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            self.annotate(id, "evicted", "true");
            self.set_status(id, TraceStatus::Error("span exceeded its lifetime".to_string()));
            self.close(id);
        }

        if !stale.is_empty() {
            warn!(count = stale.len(), "Evicted spans that were never closed");
        }
        stale.len()
    }
}

fn nonzero_bytes<const N: usize>(rng: &mut impl Rng) -> [u8; N] {
    let mut bytes = [0u8; N];
    loop {
        rng.fill(&mut bytes[..]);
        if bytes.iter().any(|b| *b != 0) {
            return bytes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_traceparent_parse_and_format() {
        let tp = TraceParent::parse(CLIENT).unwrap();
        assert!(tp.sampled);
        assert_eq!(tp.to_string(), CLIENT);

        assert!(TraceParent::parse("garbage").is_none());
        for bad in [
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-x",
        ] {
            assert!(TraceParent::parse(bad).is_none(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_open_joins_client_trace() {
        let correlator = TraceCorrelator::new();
        let id = correlator.open("query", Some(CLIENT));

        let tp = TraceParent::parse(&id).unwrap();
        let client = TraceParent::parse(CLIENT).unwrap();
        assert_eq!(tp.trace_id, client.trace_id);
        assert_ne!(tp.span_id, client.span_id);
        assert!(correlator.is_open(&id));
    }

    #[tokio::test]
    async fn test_open_without_parent_starts_new_trace() {
        let correlator = TraceCorrelator::new();
        let a = correlator.open("login", None);
        let b = correlator.open("login", Some("not-a-traceparent"));
        assert_ne!(
            TraceParent::parse(&a).unwrap().trace_id,
            TraceParent::parse(&b).unwrap().trace_id
        );
        assert_eq!(correlator.len(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let correlator = TraceCorrelator::new();
        let id = correlator.open("query", None);
        correlator.annotate(&id, "outcome", "success");
        correlator.set_status(&id, TraceStatus::Ok);

        let closed = correlator.close(&id).unwrap();
        assert_eq!(closed.attributes.get("outcome").map(String::as_str), Some("success"));
        assert_eq!(closed.status, TraceStatus::Ok);

        assert!(correlator.close(&id).is_none());
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_ignored() {
        let correlator = TraceCorrelator::new();
        correlator.annotate("missing", "k", "v");
        correlator.set_status("missing", TraceStatus::Ok);
        assert!(correlator.close("missing").is_none());
        assert!(correlator.get("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale_spans() {
        let correlator = TraceCorrelator::new();
        let old = correlator.open("query", None);
        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = correlator.open("query", None);

        assert_eq!(correlator.evict_stale(Duration::from_secs(60)), 1);
        assert!(!correlator.is_open(&old));
        assert!(correlator.is_open(&fresh));
    }
}

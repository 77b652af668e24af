//! Span tracer.
//!
//! Spans form a tree per trace. Parentage is carried explicitly through a
//! [`TraceContext`]: a span started from an empty context opens a new trace,
//! otherwise it becomes a child of the context's span.

mod export;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stats;

/// Retained spans before the oldest are evicted.
const MAX_SPANS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Internal,
    Agent,
    Tool,
    Guardrail,
    Handoff,
    Llm,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Guardrail => "guardrail",
            Self::Handoff => "handoff",
            Self::Llm => "llm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
    Canceled,
}

/// A timestamped annotation on a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
}

/// Explicit carrier of the current trace position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl TraceContext {
    /// A context with no trace; the next span opens a new one.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.span_id.is_some()
    }
}

/// Aggregate view over finished spans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_count: usize,
    pub span_count: usize,
    pub error_count: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

pub struct Tracer {
    enabled: AtomicBool,
    spans: RwLock<Vec<Span>>,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide tracer.
pub fn global_tracer() -> &'static Tracer {
    static GLOBAL: OnceLock<Tracer> = OnceLock::new();
    GLOBAL.get_or_init(Tracer::new)
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            spans: RwLock::new(Vec::new()),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Start a span under `parent` and return the child context.
    ///
    /// When tracing is disabled the parent context is returned unchanged and
    /// nothing is recorded.
    pub fn start_span(
        &self,
        parent: &TraceContext,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> TraceContext {
        if !self.is_enabled() {
            return parent.clone();
        }
        let id = crate::new_id();
        let trace_id = parent.trace_id.clone().unwrap_or_else(crate::new_id);
        let span = Span {
            id: id.clone(),
            trace_id: trace_id.clone(),
            parent_id: parent.span_id.clone(),
            name: name.into(),
            kind,
            status: SpanStatus::Ok,
            start_time: crate::now(),
            end_time: None,
            duration_ms: None,
            attributes: Map::new(),
            events: Vec::new(),
        };

        let mut spans = self.write();
        if spans.len() >= MAX_SPANS {
            spans.remove(0);
        }
        spans.push(span);

        TraceContext {
            trace_id: Some(trace_id),
            span_id: Some(id),
        }
    }

    /// Finish the context's span. An error marks it failed and records the
    /// message under the `error` attribute.
    pub fn end_span(&self, ctx: &TraceContext, error: Option<&str>) {
        self.finish(ctx, error.map(|e| (SpanStatus::Error, e)));
    }

    /// Finish the context's span as cancelled.
    pub fn cancel_span(&self, ctx: &TraceContext) {
        self.finish(ctx, Some((SpanStatus::Canceled, "cancelled")));
    }

    fn finish(&self, ctx: &TraceContext, outcome: Option<(SpanStatus, &str)>) {
        self.with_span(ctx, |span| {
            if span.end_time.is_some() {
                return;
            }
            let end = crate::now();
            span.duration_ms = Some((end - span.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0);
            span.end_time = Some(end);
            if let Some((status, message)) = outcome {
                span.status = status;
                span.attributes
                    .insert("error".into(), Value::String(message.to_string()));
            }
        });
    }

    pub fn set_attribute(&self, ctx: &TraceContext, key: impl Into<String>, value: impl Into<Value>) {
        let (key, value) = (key.into(), value.into());
        self.with_span(ctx, |span| {
            span.attributes.insert(key, value);
        });
    }

    pub fn add_event(&self, ctx: &TraceContext, name: impl Into<String>, attributes: Map<String, Value>) {
        let name = name.into();
        self.with_span(ctx, |span| {
            span.events.push(SpanEvent {
                name,
                timestamp: crate::now(),
                attributes,
            });
        });
    }

    fn with_span(&self, ctx: &TraceContext, f: impl FnOnce(&mut Span)) {
        let Some(id) = ctx.span_id.as_deref() else {
            return;
        };
        let mut spans = self.write();
        if let Some(span) = spans.iter_mut().rev().find(|s| s.id == id) {
            f(span);
        }
    }

    /// Snapshot of all retained spans, oldest first.
    pub fn spans(&self) -> Vec<Span> {
        self.read().clone()
    }

    /// Spans belonging to one trace.
    pub fn trace(&self, trace_id: &str) -> Vec<Span> {
        self.read()
            .iter()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Counts plus mean / P95 / P99 of finished span durations.
    pub fn summary(&self) -> TraceSummary {
        let spans = self.read();
        let mut durations: Vec<f64> = spans.iter().filter_map(|s| s.duration_ms).collect();
        durations.sort_by(|a, b| a.total_cmp(b));

        let mut by_kind = BTreeMap::new();
        let mut traces = std::collections::HashSet::new();
        for span in spans.iter() {
            *by_kind.entry(span.kind.as_str().to_string()).or_insert(0) += 1;
            traces.insert(span.trace_id.as_str());
        }

        TraceSummary {
            trace_count: traces.len(),
            span_count: spans.len(),
            error_count: spans.iter().filter(|s| s.status == SpanStatus::Error).count(),
            by_kind,
            mean_ms: stats::mean(&durations),
            p95_ms: stats::percentile(&durations, 0.95),
            p99_ms: stats::percentile(&durations, 0.99),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Span>> {
        self.spans.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Span>> {
        self.spans.write().unwrap_or_else(|e| e.into_inner())
    }
}

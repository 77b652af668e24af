//! Span exporters: JSON, indented text tree, and console via `tracing`.

use std::collections::HashMap;
use std::fmt::Write;

use super::{Span, SpanStatus, Tracer};
use crate::error::Result;

impl Tracer {
    /// All retained spans as a JSON array.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.spans())?)
    }

    /// Indented tree, one block per trace.
    pub fn export_pretty(&self) -> String {
        let spans = self.spans();
        let mut children: HashMap<Option<&str>, Vec<&Span>> = HashMap::new();
        for span in &spans {
            children
                .entry(span.parent_id.as_deref())
                .or_default()
                .push(span);
        }

        let mut out = String::new();
        for root in children.get(&None).cloned().unwrap_or_default() {
            let _ = writeln!(out, "trace {}", root.trace_id);
            render(&mut out, root, &children, 1);
        }
        out
    }

    /// Emit one `tracing` record per span.
    pub fn export_console(&self) {
        for span in self.spans() {
            let duration_ms = span.duration_ms.unwrap_or_default();
            match span.status {
                SpanStatus::Ok => tracing::info!(
                    trace_id = %span.trace_id,
                    span_id = %span.id,
                    kind = span.kind.as_str(),
                    duration_ms,
                    "{}",
                    span.name
                ),
                SpanStatus::Error | SpanStatus::Canceled => tracing::warn!(
                    trace_id = %span.trace_id,
                    span_id = %span.id,
                    kind = span.kind.as_str(),
                    status = ?span.status,
                    duration_ms,
                    "{}",
                    span.name
                ),
            }
        }
    }
}

fn render(out: &mut String, span: &Span, children: &HashMap<Option<&str>, Vec<&Span>>, depth: usize) {
    let marker = match span.status {
        SpanStatus::Ok => "ok",
        SpanStatus::Error => "error",
        SpanStatus::Canceled => "canceled",
    };
    let duration = span
        .duration_ms
        .map(|d| format!("{d:.1}ms"))
        .unwrap_or_else(|| "open".to_string());
    let _ = writeln!(
        out,
        "{}[{}] {} ({}, {})",
        "  ".repeat(depth),
        span.kind.as_str(),
        span.name,
        duration,
        marker
    );
    if let Some(kids) = children.get(&Some(span.id.as_str())) {
        for kid in kids {
            render(out, kid, children, depth + 1);
        }
    }
}

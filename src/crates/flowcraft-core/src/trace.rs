//! Tracer and span abstractions
//!
//! A flow accepts any [`Tracer`] through its forward options. The top-level
//! `forward()` opens one span, passes that span's [`TraceContext`] to every
//! node it invokes, and ends the span exactly once through a [`SpanGuard`],
//! whether the run succeeds, fails, or its future is dropped mid-flight.
//!
//! Two tracers ship with the crate:
//!
//! - [`TracingTracer`] maps spans onto the `tracing` ecosystem
//! - [`InMemoryTracer`] records spans for inspection in tests

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifies a span within a trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a new trace
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
        }
    }

    /// A new span in the same trace, parented on this one
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    fn for_parent(parent: Option<&TraceContext>) -> Self {
        parent.map(TraceContext::child).unwrap_or_else(TraceContext::root)
    }
}

/// An open span
pub trait Span: Send + Sync {
    fn context(&self) -> TraceContext;

    fn set_attribute(&self, key: &str, value: Value);

    fn record_error(&self, message: &str);

    /// Close the span. Callers end each span once.
    fn end(&self);
}

/// Creates spans
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str, parent: Option<&TraceContext>) -> Box<dyn Span>;
}

/// Ends the wrapped span exactly once
///
/// `finish_ok`/`finish_err` consume the guard; dropping it without either
/// still ends the span.
pub struct SpanGuard {
    span: Option<Box<dyn Span>>,
}

impl SpanGuard {
    pub fn new(span: Box<dyn Span>) -> Self {
        Self { span: Some(span) }
    }

    pub fn context(&self) -> Option<TraceContext> {
        self.span.as_ref().map(|span| span.context())
    }

    pub fn set_attribute(&self, key: &str, value: Value) {
        if let Some(span) = &self.span {
            span.set_attribute(key, value);
        }
    }

    pub fn finish_ok(mut self) {
        if let Some(span) = self.span.take() {
            span.end();
        }
    }

    pub fn finish_err(mut self, message: &str) {
        if let Some(span) = self.span.take() {
            span.record_error(message);
            span.end();
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            span.end();
        }
    }
}

/// Tracer backed by `tracing` spans
#[derive(Debug, Clone, Default)]
pub struct TracingTracer;

impl TracingTracer {
    pub fn new() -> Self {
        Self
    }
}

struct TracingSpan {
    context: TraceContext,
    span: Mutex<Option<tracing::Span>>,
}

impl Tracer for TracingTracer {
    fn start_span(&self, name: &str, parent: Option<&TraceContext>) -> Box<dyn Span> {
        let context = TraceContext::for_parent(parent);
        let span = tracing::info_span!(
            "flow_span",
            span_name = %name,
            trace_id = %context.trace_id,
            span_id = %context.span_id,
            parent_span_id = ?context.parent_span_id,
        );
        Box::new(TracingSpan {
            context,
            span: Mutex::new(Some(span)),
        })
    }
}

impl Span for TracingSpan {
    fn context(&self) -> TraceContext {
        self.context.clone()
    }

    fn set_attribute(&self, key: &str, value: Value) {
        if let Some(span) = self.span.lock().as_ref() {
            tracing::debug!(parent: span, attribute = %key, value = %value, "span attribute");
        }
    }

    fn record_error(&self, message: &str) {
        if let Some(span) = self.span.lock().as_ref() {
            tracing::warn!(parent: span, error = %message, "span failed");
        }
    }

    fn end(&self) {
        self.span.lock().take();
    }
}

/// A span captured by [`InMemoryTracer`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpan {
    pub name: String,
    pub context: TraceContext,
    pub attributes: Map<String, Value>,
    pub errors: Vec<String>,
    pub end_count: usize,
}

/// Tracer that keeps every span in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryTracer {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl InMemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every span started so far
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().clone()
    }

    /// Total number of `end()` calls across all spans
    pub fn end_count(&self) -> usize {
        self.spans.lock().iter().map(|span| span.end_count).sum()
    }
}

struct InMemorySpan {
    index: usize,
    context: TraceContext,
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl InMemorySpan {
    fn update(&self, f: impl FnOnce(&mut RecordedSpan)) {
        if let Some(span) = self.spans.lock().get_mut(self.index) {
            f(span);
        }
    }
}

impl Tracer for InMemoryTracer {
    fn start_span(&self, name: &str, parent: Option<&TraceContext>) -> Box<dyn Span> {
        let context = TraceContext::for_parent(parent);
        let mut spans = self.spans.lock();
        spans.push(RecordedSpan {
            name: name.to_string(),
            context: context.clone(),
            attributes: Map::new(),
            errors: Vec::new(),
            end_count: 0,
        });
        Box::new(InMemorySpan {
            index: spans.len() - 1,
            context,
            spans: Arc::clone(&self.spans),
        })
    }
}

impl Span for InMemorySpan {
    fn context(&self) -> TraceContext {
        self.context.clone()
    }

    fn set_attribute(&self, key: &str, value: Value) {
        self.update(|span| {
            span.attributes.insert(key.to_string(), value);
        });
    }

    fn record_error(&self, message: &str) {
        self.update(|span| span.errors.push(message.to_string()));
    }

    fn end(&self) {
        self.update(|span| span.end_count += 1);
    }
}

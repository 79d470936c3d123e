//! Session-scoped span recorder.
//!
//! One recorder belongs to one session run and is passed explicitly to
//! whatever records into it. There is no process-wide registry.

use crate::model::{Span, SpanKind, TelemetrySummary};
use serde_json::Value;

/// Handle to an open span inside one [`SessionRecorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanHandle(usize);

/// Collects the spans of one session.
#[derive(Debug, Default)]
pub struct SessionRecorder {
    session_id: String,
    spans: Vec<Span>,
}

impl SessionRecorder {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            spans: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Open a span.
    pub fn start(&mut self, kind: SpanKind, label: impl Into<String>, iteration: u32) -> SpanHandle {
        self.spans.push(Span::new(kind, label, iteration));
        SpanHandle(self.spans.len() - 1)
    }

    /// Count one attempt on an open span.
    pub fn attempt(&mut self, handle: SpanHandle) {
        if let Some(span) = self.span_mut(handle) {
            span.attempts += 1;
        }
    }

    pub fn set_attempts(&mut self, handle: SpanHandle, attempts: u32) {
        if let Some(span) = self.span_mut(handle) {
            span.attempts = attempts;
        }
    }

    pub fn add_tokens(&mut self, handle: SpanHandle, tokens: u64) {
        if let Some(span) = self.span_mut(handle) {
            span.tokens += tokens;
        }
    }

    pub fn annotate(&mut self, handle: SpanHandle, key: &str, value: impl Into<Value>) {
        if let Some(span) = self.span_mut(handle) {
            span.metadata.insert(key.to_string(), value.into());
        }
    }

    /// Close a span. Closing an already closed span keeps the first result.
    pub fn end(&mut self, handle: SpanHandle, success: bool) {
        if let Some(span) = self.span_mut(handle) {
            if span.is_open() {
                span.end(success);
            }
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Close any span still open (as failed) and summarise.
    pub fn finish(mut self) -> (Vec<Span>, TelemetrySummary) {
        for span in self.spans.iter_mut().filter(|s| s.is_open()) {
            span.end(false);
        }
        let summary = TelemetrySummary::from_spans(&self.spans);
        tracing::debug!(
            session_id = %self.session_id,
            spans = summary.span_count,
            tool_attempts = summary.tool_attempts,
            provider_attempts = summary.provider_attempts,
            "Session telemetry finished"
        );
        (self.spans, summary)
    }

    pub fn summary(&self) -> TelemetrySummary {
        TelemetrySummary::from_spans(&self.spans)
    }

    fn span_mut(&mut self, handle: SpanHandle) -> Option<&mut Span> {
        let span = self.spans.get_mut(handle.0);
        if span.is_none() {
            tracing::debug!(session_id = %self.session_id, index = handle.0, "Unknown span handle");
        }
        span
    }
}

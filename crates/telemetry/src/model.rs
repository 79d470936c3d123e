//! Data model for session traces, spans and summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Building the context snapshot for an iteration.
    ContextBuild,
    /// Consuming one decision stream from the model provider (all attempts).
    DecisionStream,
    /// One tool call through the runner (all attempts).
    ToolCall,
    /// One append to the snapshot store.
    SnapshotWrite,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContextBuild => write!(f, "context_build"),
            Self::DecisionStream => write!(f, "decision_stream"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::SnapshotWrite => write!(f, "snapshot_write"),
        }
    }
}

/// A single traced execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub kind: SpanKind,
    /// Human-readable label (tool name, provider name, store name).
    pub label: String,
    /// Iteration the span belongs to.
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Attempts made (tool calls and decision streams).
    pub attempts: u32,
    /// Tokens consumed from the provider stream.
    pub tokens: u64,
    pub success: Option<bool>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Span {
    pub fn new(kind: SpanKind, label: impl Into<String>, iteration: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            iteration,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            attempts: 0,
            tokens: 0,
            success: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Mark the span as ended with the given success status.
    pub fn end(&mut self, success: bool) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.success = Some(success);
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

// ── Summary ───────────────────────────────────────────────────────────────

/// Per-kind aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
    pub count: usize,
    pub failures: usize,
    pub total_duration_ms: u64,
}

/// What a session run hands back to its caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub span_count: usize,
    pub tool_attempts: u64,
    pub provider_attempts: u64,
    pub tokens_streamed: u64,
    pub by_kind: BTreeMap<SpanKind, KindStats>,
}

impl TelemetrySummary {
    pub fn from_spans(spans: &[Span]) -> Self {
        let mut summary = Self {
            span_count: spans.len(),
            ..Self::default()
        };
        for span in spans {
            match span.kind {
                SpanKind::ToolCall => summary.tool_attempts += u64::from(span.attempts),
                SpanKind::DecisionStream => {
                    summary.provider_attempts += u64::from(span.attempts);
                    summary.tokens_streamed += span.tokens;
                }
                SpanKind::ContextBuild | SpanKind::SnapshotWrite => {}
            }
            let stats = summary.by_kind.entry(span.kind).or_default();
            stats.count += 1;
            stats.total_duration_ms += span.duration_ms.unwrap_or(0);
            if span.success == Some(false) {
                stats.failures += 1;
            }
        }
        summary
    }

    pub fn count(&self, kind: SpanKind) -> usize {
        self.by_kind.get(&kind).map_or(0, |s| s.count)
    }
}

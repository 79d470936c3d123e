//! Session-scoped execution tracing for MetricChat.
//!
//! Every session run owns a [`SessionRecorder`] that records spans for
//! context builds, decision streams, tool calls and snapshot writes. The
//! resulting [`TelemetrySummary`] is returned with the session outcome.

pub mod model;
pub mod recorder;

pub use model::{KindStats, Span, SpanKind, TelemetrySummary};
pub use recorder::{SessionRecorder, SpanHandle};

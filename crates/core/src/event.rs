//! Progress events: the externally visible stream of a session.
//!
//! The agent loop pushes whole [`ProgressEvent`] records into an
//! [`EventSink`]. Partial JSON from the model never crosses this boundary;
//! each event is one complete record, serialisable as one JSON line.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::session::SessionId;

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressKind {
    #[serde(rename = "decision.partial")]
    DecisionPartial,
    #[serde(rename = "tool.started")]
    ToolStarted,
    #[serde(rename = "tool.finished")]
    ToolFinished,
    #[serde(rename = "answer.final")]
    AnswerFinal,
    #[serde(rename = "error")]
    Error,
}

impl ProgressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecisionPartial => "decision.partial",
            Self::ToolStarted => "tool.started",
            Self::ToolFinished => "tool.finished",
            Self::AnswerFinal => "answer.final",
            Self::Error => "error",
        }
    }
}

/// One unit of the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub session_id: SessionId,
    pub iteration_index: u32,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, session_id: SessionId, iteration_index: u32, payload: Value) -> Self {
        Self {
            kind,
            session_id,
            iteration_index,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Consumer of progress events (SSE, WebSocket, stdout).
///
/// `emit` may apply backpressure by awaiting, but must not fail the
/// session: a sink that cannot deliver drops the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ProgressEvent);
}

/// Bounded `mpsc` sink. A full buffer makes the producer wait.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver the transport reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: ProgressEvent) {
        if self.sender.send(event).await.is_err() {
            tracing::debug!("Progress receiver closed, dropping event");
        }
    }
}

/// Fire-and-forget `broadcast` sink. Lagging receivers lose events.
pub struct BroadcastSink {
    sender: broadcast::Sender<Arc<ProgressEvent>>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProgressEvent>> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }
}

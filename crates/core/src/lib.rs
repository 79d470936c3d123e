//! # MetricChat Core
//!
//! Domain types, traits, and error definitions for the MetricChat agent
//! execution core. This crate has **zero framework dependencies**, it defines
//! the domain model that the agent, store and CLI crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the agent loop is a trait here:
//! - [`ToolContract`]: a pluggable capability (SQL query, chart builder, ...)
//! - [`ModelProvider`]: the language model's token stream
//! - [`EventSink`]: consumer of progress events (SSE, WebSocket, stdout)
//! - [`SnapshotStore`]: append-only persistence of iterations
//!
//! Implementations live in their respective crates, which keeps the
//! dependency graph pointing inward and makes every seam mockable in tests.

pub mod context;
pub mod decision;
pub mod error;
pub mod event;
pub mod observation;
pub mod provider;
pub mod session;
pub mod snapshot;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use context::{ContextFragment, ContextSnapshot, DropInfo, FragmentSource, Section};
pub use decision::{ClosedField, PartialUpdate, PlannerDecision};
pub use error::{
    Classify, FailureClass, ParseError, ProviderError, ResolutionError, SnapshotError,
    ToolError, ValidationError,
};
pub use event::{BroadcastSink, ChannelSink, EventSink, ProgressEvent, ProgressKind};
pub use observation::{Observation, ObservationStatus};
pub use provider::{DecisionRequest, ModelProvider, TokenStream};
pub use session::{
    Iteration, IterationError, IterationErrorKind, IterationOutcome, Session, SessionId,
    SessionStatus,
};
pub use snapshot::{SessionRecord, SnapshotStore};
pub use tool::{
    ArgumentSchema, FieldKind, FieldSpec, ToolCall, ToolContract, ToolDefinition, ToolRegistry,
    ValidatedArguments,
};
